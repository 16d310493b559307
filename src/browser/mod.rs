#[cfg(feature = "chrome")]
pub mod chrome;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// What `navigate` waits for before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Document load event.
    Load,
    /// Load event plus a quiet network.
    NetworkIdle,
}

/// A network response seen while the page loads. The body is fetched lazily so
/// handlers only pay for the responses they care about.
pub struct NetworkResponse<'a> {
    pub url: &'a str,
    pub mime_type: &'a str,
    pub status: u16,
    body: &'a dyn Fn() -> Result<String>,
}

impl<'a> NetworkResponse<'a> {
    pub fn new(
        url: &'a str,
        mime_type: &'a str,
        status: u16,
        body: &'a dyn Fn() -> Result<String>,
    ) -> Self {
        Self {
            url,
            mime_type,
            status,
            body,
        }
    }

    pub fn body(&self) -> Result<String> {
        (self.body)()
    }
}

pub type ResponseHandler = Arc<dyn Fn(&NetworkResponse<'_>) + Send + Sync>;

/// The capabilities the pipeline needs from a browser tab.
pub trait BrowserSession: Send {
    fn navigate(&mut self, url: &str, wait: WaitCondition, timeout: Duration) -> Result<()>;

    /// Registers a handler invoked for every response from here on.
    fn intercept(&mut self, handler: ResponseHandler) -> Result<()>;

    /// `Ok(false)` means the element did not show up within `timeout`.
    fn wait_for_element(&mut self, selector: &str, timeout: Duration) -> Result<bool>;

    fn click(&mut self, selector: &str) -> Result<()>;

    fn type_into(&mut self, selector: &str, text: &str) -> Result<()>;

    fn wait_for_navigation(&mut self, timeout: Duration) -> Result<()>;

    /// Current serialized DOM.
    fn content(&self) -> Result<String>;

    /// Evaluates a script in page scope and returns its JSON result.
    fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    fn close(self: Box<Self>) -> Result<()>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Owns a session for the length of a run and closes it on every exit path.
pub struct SessionGuard {
    session: Option<Box<dyn BrowserSession>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn BrowserSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn session(&mut self) -> &mut dyn BrowserSession {
        self.session
            .as_deref_mut()
            .expect("session present until guard is dropped")
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("Failed to close browser session: {:#}", e);
            }
        }
    }
}
