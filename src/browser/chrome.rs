use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info};

use super::{BrowserSession, Launcher, NetworkResponse, ResponseHandler, WaitCondition};

const HANDLER_NAME: &str = "vessel_sync_interceptor";
/// Quiet period appended to `WaitCondition::NetworkIdle`.
const IDLE_WINDOW: Duration = Duration::from_millis(500);

pub struct ChromeLauncher {
    pub headless: bool,
    pub sandbox: bool,
    /// Upper bound on a silent CDP connection; keep above the run timeout.
    pub idle_timeout: Duration,
}

impl Launcher for ChromeLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let browser = Browser::new(LaunchOptions {
            headless: self.headless,
            sandbox: self.sandbox,
            idle_browser_timeout: self.idle_timeout,
            ..Default::default()
        })
        .context("Failed to launch Chrome")?;
        let tab = browser.new_tab().context("Failed to open tab")?;
        info!("Chrome session started (headless={})", self.headless);
        Ok(Box::new(ChromeSession { browser, tab }))
    }
}

pub struct ChromeSession {
    // Dropping the browser kills the Chrome process.
    browser: Browser,
    tab: Arc<Tab>,
}

impl BrowserSession for ChromeSession {
    fn navigate(&mut self, url: &str, wait: WaitCondition, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        self.tab
            .navigate_to(url)
            .with_context(|| format!("navigate to {}", url))?
            .wait_until_navigated()
            .with_context(|| format!("load of {}", url))?;
        if wait == WaitCondition::NetworkIdle {
            std::thread::sleep(IDLE_WINDOW);
        }
        Ok(())
    }

    fn intercept(&mut self, handler: ResponseHandler) -> Result<()> {
        self.tab
            .register_response_handling(
                HANDLER_NAME,
                Box::new(move |params, fetch_body| {
                    let resp = &params.response;
                    let body = || -> Result<String> {
                        let obj = fetch_body()?;
                        if obj.base_64_encoded {
                            return Err(anyhow!("binary response body"));
                        }
                        Ok(obj.body)
                    };
                    let view = NetworkResponse::new(
                        &resp.url,
                        &resp.mime_type,
                        resp.status as u16,
                        &body,
                    );
                    handler(&view);
                }),
            )
            .map_err(|e| anyhow!("Failed to register response handler: {}", e))?;
        Ok(())
    }

    fn wait_for_element(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        match self.tab.wait_for_element_with_custom_timeout(selector, timeout) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("Element {} not found: {}", selector, e);
                Ok(false)
            }
        }
    }

    fn click(&mut self, selector: &str) -> Result<()> {
        self.tab
            .find_element(selector)
            .with_context(|| format!("find {}", selector))?
            .click()
            .with_context(|| format!("click {}", selector))?;
        Ok(())
    }

    fn type_into(&mut self, selector: &str, text: &str) -> Result<()> {
        self.tab
            .find_element(selector)
            .with_context(|| format!("find {}", selector))?
            .type_into(text)
            .with_context(|| format!("type into {}", selector))?;
        Ok(())
    }

    fn wait_for_navigation(&mut self, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        self.tab.wait_until_navigated()?;
        Ok(())
    }

    fn content(&self) -> Result<String> {
        self.tab.get_content()
    }

    fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let remote = self.tab.evaluate(script, false)?;
        Ok(remote.value.unwrap_or(serde_json::Value::Null))
    }

    fn close(self: Box<Self>) -> Result<()> {
        let ChromeSession { browser, tab } = *self;
        let _ = tab.deregister_response_handling(HANDLER_NAME);
        tab.close(true)?;
        drop(browser);
        Ok(())
    }
}
