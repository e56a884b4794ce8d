use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotpay_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Periodic maintenance job, decoupled from whatever triggers it (timer, HTTP cron call).
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one pass. Returns a short human readable summary for the log line.
    async fn run(&self, now: DateTime<Utc>) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

/// Run `task` every `period` until `shutdown` is cancelled. A failed pass is logged and the
/// next tick runs normally.
pub fn spawn_periodic(
    task: Arc<dyn ScheduledTask>,
    period: Duration,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = task.name(), period_secs = period.as_secs(), "Scheduled task started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(task = task.name(), "Scheduled task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match task.run(clock.now()).await {
                        Ok(summary) => info!(task = task.name(), %summary, "Scheduled task pass finished"),
                        Err(e) => error!(task = task.name(), error = %e, "Scheduled task pass failed"),
                    }
                }
            }
        }
    })
}
