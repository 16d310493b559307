use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, WaitCondition};
use crate::config::Settings;
use crate::coordinator::{Deadline, Phase};
use crate::error::RunError;

/// Logs into the site. Everything after this needs an authenticated session,
/// so a missing login control is fatal while a missing consent dialog is not.
pub fn login(
    session: &mut dyn BrowserSession,
    settings: &Settings,
    deadline: &Deadline,
) -> Result<(), RunError> {
    if settings.username.is_empty() || settings.password.is_empty() {
        return Err(RunError::Authentication("no credentials configured".into()));
    }

    let nav_timeout = deadline.clamp(settings.navigation_timeout())?;
    session
        .navigate(&settings.login_url, WaitCondition::Load, nav_timeout)
        .map_err(|e| RunError::Navigation {
            url: settings.login_url.clone(),
            reason: format!("{:#}", e),
        })?;

    dismiss_consent(session, settings, deadline)?;

    let nav_timeout = deadline.clamp(settings.navigation_timeout())?;
    let present = session
        .wait_for_element(&settings.username_selector, nav_timeout)
        .map_err(|e| RunError::Authentication(format!("{:#}", e)))?;
    if !present {
        return Err(RunError::Authentication(format!(
            "login field {} not found within {:?}",
            settings.username_selector, nav_timeout
        )));
    }

    debug!(phase = %Phase::Authenticating);
    fill_form(session, settings).map_err(|e| RunError::Authentication(format!("{:#}", e)))?;

    // The post-login redirect is optional to wait on; the target navigation follows anyway.
    let step = deadline.clamp(settings.step_timeout())?;
    if let Err(e) = session.wait_for_navigation(step) {
        debug!("No navigation after login submit: {:#}", e);
    }
    info!("Logged in as {}", settings.username);
    Ok(())
}

fn fill_form(session: &mut dyn BrowserSession, settings: &Settings) -> anyhow::Result<()> {
    session.type_into(&settings.username_selector, &settings.username)?;
    session.type_into(&settings.password_selector, &settings.password)?;
    session.click(&settings.submit_selector)?;
    Ok(())
}

fn dismiss_consent(
    session: &mut dyn BrowserSession,
    settings: &Settings,
    deadline: &Deadline,
) -> Result<(), RunError> {
    let step = deadline.clamp(settings.step_timeout())?;
    match session.wait_for_element(&settings.consent_selector, step) {
        Ok(true) => {
            if let Err(e) = session.click(&settings.consent_selector) {
                warn!("Cookie consent present but not dismissed: {:#}", e);
            } else {
                debug!("Cookie consent dismissed");
            }
        }
        Ok(false) => debug!("No cookie consent dialog"),
        Err(e) => debug!("Cookie consent check failed: {:#}", e),
    }
    Ok(())
}
