pub mod intercept;
pub mod markup;
pub mod script_scope;
pub mod shape;
pub mod table;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use intercept::ResponseInterceptor;

/// A raw, pre-normalization payload and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub payload: Value,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    Found(Extraction),
    NotFound,
}

impl ExtractionResult {
    pub fn found(payload: Value, source: impl Into<String>) -> Self {
        ExtractionResult::Found(Extraction {
            payload,
            source: source.into(),
        })
    }

    /// `Found` only if the payload passes the vessel-shape rule.
    pub fn checked(payload: Value, source: impl Into<String>) -> Self {
        if shape::is_vessel_shaped(&payload) {
            Self::found(payload, source)
        } else {
            ExtractionResult::NotFound
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ExtractionResult::Found(_))
    }
}

/// One step of the fallback chain. A failing attempt must leave the page as it
/// found it so the next strategy sees the same state.
pub trait Strategy {
    fn name(&self) -> &'static str;

    fn attempt(&self, page: &dyn BrowserSession) -> anyhow::Result<ExtractionResult>;
}

/// Runs strategies in order and stops at the first `Found`. Errors count as
/// `NotFound` for that strategy only.
pub fn run_chain(strategies: &[&dyn Strategy], page: &dyn BrowserSession) -> ExtractionResult {
    for strategy in strategies {
        match strategy.attempt(page) {
            Ok(ExtractionResult::Found(e)) => {
                info!(strategy = strategy.name(), source = %e.source, "Extraction succeeded");
                return ExtractionResult::Found(e);
            }
            Ok(ExtractionResult::NotFound) => {
                debug!(strategy = strategy.name(), "No data");
            }
            Err(e) => {
                warn!(strategy = strategy.name(), "Extraction failed: {:#}", e);
            }
        }
    }
    ExtractionResult::NotFound
}

/// Reads the interceptor's shape-checked capture.
pub struct InterceptedStrategy<'a>(pub &'a ResponseInterceptor);

impl Strategy for InterceptedStrategy<'_> {
    fn name(&self) -> &'static str {
        "intercepted-response"
    }

    fn attempt(&self, _page: &dyn BrowserSession) -> anyhow::Result<ExtractionResult> {
        Ok(match self.0.best() {
            Some(c) => ExtractionResult::found(c.payload, format!("response {}", c.url)),
            None => ExtractionResult::NotFound,
        })
    }
}

/// Full chain: intercepted response, DOM table, script globals, embedded JSON.
/// When everything misses, falls back to whatever JSON the interceptor last
/// saw on a watched path, shape-checked or not.
pub fn extract(
    page: &dyn BrowserSession,
    interceptor: &ResponseInterceptor,
    table: &table::TableExtractor,
    globals: &script_scope::ScriptScopeExtractor,
    markup: &markup::MarkupExtractor,
) -> ExtractionResult {
    let intercepted = InterceptedStrategy(interceptor);
    let chain: [&dyn Strategy; 4] = [&intercepted, table, globals, markup];
    let result = run_chain(&chain, page);
    if result.is_found() {
        return result;
    }
    match interceptor.last_captured() {
        Some(c) => {
            warn!(url = %c.url, "All strategies missed, using unverified intercepted payload");
            ExtractionResult::found(c.payload, format!("response {} (unverified)", c.url))
        }
        None => ExtractionResult::NotFound,
    }
}
