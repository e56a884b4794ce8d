pub mod locks;
pub mod payment;
pub mod rate_limit;
pub mod reconcile;
pub mod reservation;
pub mod scheduler;
pub mod sweeper;
pub mod webhook;

pub use payment::{CreateSession, PaymentCoordinator, PaymentError, PaymentSession};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use reconcile::{ReconciliationReport, ReconciliationTask, Reconciler};
pub use reservation::{AcquireRequest, ReservationError, ReservationManager};
pub use scheduler::{spawn_periodic, ScheduledTask};
pub use sweeper::ExpirySweeper;
pub use webhook::{WebhookError, WebhookOutcome, WebhookProcessor};

use slotpay_core::events::{BookingEvent, EventPublisher};

/// Fire-and-forget: a broker outage must never fail the booking operation that caused the event.
pub(crate) async fn publish(events: &dyn EventPublisher, event: BookingEvent) {
    if let Err(e) = events.publish(&event).await {
        tracing::warn!(topic = event.topic(), error = %e, "Failed to publish booking event");
    }
}
