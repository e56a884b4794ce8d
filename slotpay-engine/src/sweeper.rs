use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::reservation::{ReservationError, ReservationManager};
use crate::scheduler::ScheduledTask;

/// Releases holds that lapsed without being confirmed.
pub struct ExpirySweeper {
    reservations: Arc<ReservationManager>,
}

impl ExpirySweeper {
    pub fn new(reservations: Arc<ReservationManager>) -> Self {
        Self { reservations }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, ReservationError> {
        self.reservations.sweep_expired(now).await
    }
}

#[async_trait]
impl ScheduledTask for ExpirySweeper {
    fn name(&self) -> &'static str {
        "expiry-sweeper"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let reclaimed = self.sweep(now).await?;
        Ok(format!("reclaimed {reclaimed}"))
    }
}
