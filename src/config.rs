use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::extract::{script_scope, table};

const DEFAULT_INTERCEPT_PATHS: &[&str] = &["/reports", "/getData", "/get_data_json", "/vessels"];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,

    pub login_url: String,
    pub target_url: String,
    pub username: String,
    pub password: String,

    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    pub consent_selector: String,

    pub table_selectors: Vec<String>,
    pub known_globals: Vec<String>,
    pub intercept_paths: Vec<String>,

    pub interval_secs: u64,
    pub run_timeout_secs: u64,
    pub navigation_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub settle_delay_ms: u64,

    pub headless: bool,
    pub sandbox: bool,
}

impl Settings {
    /// Defaults, then `vessel_sync.toml` if present, then `VESSELS_*` env vars.
    pub fn load() -> Result<Self> {
        let lists = ["table_selectors", "known_globals", "intercept_paths"];
        let mut env = Environment::with_prefix("VESSELS")
            .try_parsing(true)
            .list_separator(",");
        for key in lists {
            env = env.with_list_parse_key(key);
        }

        let settings = Config::builder()
            .set_default("db_path", "data/vessels.sqlite")?
            .set_default("login_url", "https://www.marinetraffic.com/en/users/login")?
            .set_default(
                "target_url",
                "https://www.marinetraffic.com/en/data/?asset_type=vessels&columns=shipname,imo,mmsi,flag,lat_of_latest_position,lon_of_latest_position,speed,course,draught,eta,eta_updated,launch_date",
            )?
            .set_default("username", "")?
            .set_default("password", "")?
            .set_default("username_selector", "#email")?
            .set_default("password_selector", "#password")?
            .set_default("submit_selector", "#login_form_submit")?
            .set_default("consent_selector", ".qc-cmp2-summary-buttons button[mode=primary]")?
            .set_default("table_selectors", owned(table::DEFAULT_SELECTORS))?
            .set_default("known_globals", owned(script_scope::DEFAULT_GLOBALS))?
            .set_default("intercept_paths", owned(DEFAULT_INTERCEPT_PATHS))?
            .set_default("interval_secs", 3600)?
            .set_default("run_timeout_secs", 300)?
            .set_default("navigation_timeout_secs", 60)?
            .set_default("step_timeout_secs", 5)?
            .set_default("settle_delay_ms", 5000)?
            .set_default("headless", true)?
            .set_default("sandbox", true)?
            .add_source(File::with_name("vessel_sync").required(false))
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
