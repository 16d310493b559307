use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info};

use super::shape;
use crate::browser::{NetworkResponse, ResponseHandler};

/// A JSON body captured from a watched endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub url: String,
    pub payload: Value,
}

#[derive(Default)]
struct Slots {
    /// Latest vessel-shaped capture.
    best: Option<Capture>,
    /// Latest JSON capture on a watched path, shape aside.
    last: Option<Capture>,
}

/// Watches responses during navigation and keeps vessel-shaped JSON bodies.
/// Handlers may fire on any CDP thread, in any order relative to page load.
#[derive(Clone)]
pub struct ResponseInterceptor {
    paths: Arc<Vec<String>>,
    slots: Arc<Mutex<Slots>>,
}

impl ResponseInterceptor {
    pub fn new(paths: Vec<String>) -> Self {
        Self {
            paths: Arc::new(paths),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub fn handler(&self) -> ResponseHandler {
        let this = self.clone();
        Arc::new(move |resp: &NetworkResponse<'_>| this.observe(resp))
    }

    pub fn watches(&self, url: &str) -> bool {
        let path = url_path(url);
        self.paths.iter().any(|p| path.contains(p.as_str()))
    }

    /// Filters one response. Nothing here may fail the session.
    pub fn observe(&self, resp: &NetworkResponse<'_>) {
        if !self.watches(resp.url) || !resp.mime_type.to_ascii_lowercase().contains("json") {
            return;
        }
        if !(200..300).contains(&resp.status) {
            debug!(url = resp.url, status = resp.status, "Skipping error response");
            return;
        }
        let body = match resp.body() {
            Ok(b) => b,
            Err(e) => {
                debug!(url = resp.url, "Response body unavailable: {:#}", e);
                return;
            }
        };
        match serde_json::from_str::<Value>(&body) {
            Ok(payload) => self.observe_json(resp.url, payload),
            Err(e) => debug!(url = resp.url, "Response is not JSON: {}", e),
        }
    }

    /// Records a parsed body from a watched path. Later vessel-shaped bodies
    /// replace earlier ones; other bodies never displace a held best.
    pub fn observe_json(&self, url: &str, payload: Value) {
        let capture = Capture {
            url: url.to_string(),
            payload,
        };
        let mut slots = self.lock();
        if shape::is_vessel_shaped(&capture.payload) {
            info!(url, "Captured vessel payload from network");
            slots.best = Some(capture.clone());
        }
        slots.last = Some(capture);
    }

    pub fn best(&self) -> Option<Capture> {
        self.lock().best.clone()
    }

    pub fn last_captured(&self) -> Option<Capture> {
        self.lock().last.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panicking handler leaves plain data behind; keep going with it.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Path portion of a URL without query or fragment.
fn url_path(url: &str) -> &str {
    let path = match url.find("://") {
        Some(i) => {
            let rest = &url[i + 3..];
            rest.find('/').map_or("/", |j| &rest[j..])
        }
        None => url,
    };
    path.split(['?', '#']).next().unwrap_or(path)
}
