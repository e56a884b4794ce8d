pub mod clock;
pub mod events;
pub mod payment;
pub mod rate_limit;
pub mod repository;
pub mod reservation;
pub mod secret;
pub mod webhook;

pub use clock::{Clock, ManualClock, SystemClock};
pub use payment::{PaymentState, PaymentTransaction};
pub use repository::{StoreError, StoreResult};
pub use reservation::{Reservation, ReservationStatus, Resource, ResourceKind, Slot};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
