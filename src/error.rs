use std::time::Duration;

use thiserror::Error;

/// Failures that end a run. Strategy misses and per-record write errors are
/// absorbed below this level and never show up here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("run exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}
