mod auth;
mod browser;
mod config;
mod coordinator;
mod db;
mod error;
mod extract;
mod normalize;
mod record;
mod scheduler;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::browser::Launcher;
use crate::config::Settings;
use crate::coordinator::{Coordinator, RunStatus};

#[derive(Parser)]
#[command(name = "vessel_sync", about = "Scheduled vessel report extraction into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vessels table
    Init,
    /// Extract on a fixed interval until Ctrl-C (default)
    Run,
    /// Run a single extraction and exit
    Once,
    /// Show stored vessel counts
    Stats {
        /// Rows to display
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            println!("Schema ready at {:?}", settings.db_path);
            Ok(())
        }
        Commands::Run => {
            let coordinator = Arc::new(build_coordinator(settings.clone())?);
            scheduler::run_forever(coordinator, settings.interval(), settings.run_timeout()).await
        }
        Commands::Once => {
            let t0 = Instant::now();
            let coordinator = Arc::new(build_coordinator(settings)?);
            let c = Arc::clone(&coordinator);
            let status = tokio::task::spawn_blocking(move || c.run()).await??;
            match status {
                RunStatus::Completed(o) => println!(
                    "Done: {} seen, {} saved, {} unchanged, {} failed in {:.1}s (source: {})",
                    o.seen,
                    o.saved,
                    o.unchanged,
                    o.failed,
                    t0.elapsed().as_secs_f64(),
                    o.source.as_deref().unwrap_or("none"),
                ),
                RunStatus::Skipped => println!("Skipped: a run is already in progress."),
            }
            Ok(())
        }
        Commands::Stats { limit } => {
            let conn = db::connect(&settings.db_path)?;
            db::verify_schema(&conn)?;
            let total = db::count(&conn)?;
            println!("Vessels stored: {}", total);
            if total == 0 {
                return Ok(());
            }
            println!(
                "{:<12} | {:<28} | {:>9} | {:>10} | {:>6}",
                "SHIP_ID", "Name", "Lat", "Lon", "Speed"
            );
            println!("{}", "-".repeat(77));
            for r in db::fetch_recent(&conn, limit)? {
                println!(
                    "{:<12} | {:<28} | {:>9} | {:>10} | {:>6}",
                    r.ship_id,
                    truncate(r.name.as_deref().unwrap_or("-"), 28),
                    fmt_num(r.lat),
                    fmt_num(r.lon),
                    fmt_num(r.speed),
                );
            }
            Ok(())
        }
    }
}

/// Opens the store and refuses to start without the vessels table.
fn build_coordinator(settings: Settings) -> Result<Coordinator> {
    let conn = db::connect(&settings.db_path)?;
    db::verify_schema(&conn).context("Startup check failed")?;
    let launcher = launcher(&settings)?;
    info!(
        target_url = settings.target_url.as_str(),
        interval_secs = settings.interval_secs,
        "Coordinator ready"
    );
    Ok(Coordinator::new(settings, launcher, conn))
}

#[cfg(feature = "chrome")]
fn launcher(settings: &Settings) -> Result<Box<dyn Launcher>> {
    Ok(Box::new(browser::chrome::ChromeLauncher {
        headless: settings.headless,
        sandbox: settings.sandbox,
        idle_timeout: settings.run_timeout() + settings.navigation_timeout(),
    }))
}

#[cfg(not(feature = "chrome"))]
fn launcher(_settings: &Settings) -> Result<Box<dyn Launcher>> {
    anyhow::bail!("built without a browser backend; enable the `chrome` feature")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn fmt_num(v: Option<f64>) -> String {
    v.map(|n| format!("{:.3}", n)).unwrap_or_else(|| "-".into())
}
