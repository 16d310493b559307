use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::coordinator::{Coordinator, RunStatus};

/// Extra time allowed past the run budget before the supervisor gives up waiting.
const SUPERVISE_GRACE: Duration = Duration::from_secs(30);

/// Fires a run every `period` until Ctrl-C.
pub async fn run_forever(
    coordinator: Arc<Coordinator>,
    period: Duration,
    run_timeout: Duration,
) -> Result<()> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Signal handler failed: {}", e);
        }
    };
    run_until(coordinator, period, run_timeout, shutdown).await;
    Ok(())
}

/// Ticks until `shutdown` resolves. Overlapping ticks are dropped, never
/// queued. On shutdown the in-flight run is allowed to finish.
pub async fn run_until(
    coordinator: Arc<Coordinator>,
    period: Duration,
    run_timeout: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    info!("Scheduler started, every {:?}", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                in_flight.retain(|h| !h.is_finished());
                if let Some(handle) = dispatch(&coordinator, run_timeout) {
                    in_flight.push(handle);
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested, waiting for in-flight run");
                break;
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }
    info!("Scheduler stopped");
}

/// Starts a supervised run unless one is already in flight.
fn dispatch(coordinator: &Arc<Coordinator>, run_timeout: Duration) -> Option<JoinHandle<()>> {
    if coordinator.is_running() {
        info!("Previous run still in progress, skipping this tick");
        return None;
    }
    Some(tokio::spawn(supervise(Arc::clone(coordinator), run_timeout)))
}

/// One run on the blocking pool, bounded from outside as well.
async fn supervise(coordinator: Arc<Coordinator>, run_timeout: Duration) {
    let job = tokio::task::spawn_blocking(move || coordinator.run());
    match time::timeout(run_timeout + SUPERVISE_GRACE, job).await {
        Ok(Ok(Ok(RunStatus::Completed(_)))) | Ok(Ok(Ok(RunStatus::Skipped))) => {}
        // already logged with cause and duration by the coordinator
        Ok(Ok(Err(_))) => {}
        Ok(Err(e)) => error!("Run task panicked: {}", e),
        Err(_) => error!(
            "Run did not return within {:?}; its guard stays held until it does",
            run_timeout + SUPERVISE_GRACE
        ),
    }
}
