use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle facts handed to the notification side (emails, SMS, calendars).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    ReservationHeld {
        reservation_id: Uuid,
        tenant_id: String,
        resource_id: String,
        expires_at: Option<DateTime<Utc>>,
    },
    ReservationConfirmed {
        reservation_id: Uuid,
        tenant_id: String,
    },
    ReservationReleased {
        reservation_id: Uuid,
        tenant_id: String,
        reason: String,
    },
    PaymentFlagged {
        transaction_id: Uuid,
        tenant_id: String,
        reason: String,
    },
}

impl BookingEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BookingEvent::ReservationHeld { .. } => "reservation.held",
            BookingEvent::ReservationConfirmed { .. } => "reservation.confirmed",
            BookingEvent::ReservationReleased { .. } => "reservation.released",
            BookingEvent::PaymentFlagged { .. } => "payment.flagged",
        }
    }

    /// Partition key; keeps one tenant's events ordered.
    pub fn key(&self) -> &str {
        match self {
            BookingEvent::ReservationHeld { tenant_id, .. }
            | BookingEvent::ReservationConfirmed { tenant_id, .. }
            | BookingEvent::ReservationReleased { tenant_id, .. }
            | BookingEvent::PaymentFlagged { tenant_id, .. } => tenant_id,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &BookingEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Drops every event. Used when no broker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: &BookingEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::trace!(topic = event.topic(), "No event broker configured, dropping event");
        Ok(())
    }
}
