use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::payment::{PaymentState, PaymentTransaction};
use crate::reservation::Reservation;
use crate::webhook::LedgerKey;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An active reservation already covers part of the requested slot.
    #[error("slot overlaps an active reservation")]
    Conflict,
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Connection, timeout or pool exhaustion. Retryable; nothing was changed.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage invariant violated: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository trait for reservation data access.
///
/// Every mutating method is a single atomic, conditional operation so that concurrent
/// callers (other requests, the sweeper) can never clobber each other.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Insert `reservation` unless an active reservation on the same resource overlaps it.
    async fn insert_if_free(&self, reservation: Reservation) -> StoreResult<Reservation>;

    async fn get_reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>>;

    /// `held -> confirmed` iff still held and `now <= expires_at`. `None` when the condition fails.
    async fn confirm_if_held(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Reservation>>;

    /// `held|confirmed -> cancelled`. `None` when the reservation is in neither state.
    async fn cancel_if_active(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Reservation>>;

    /// `held -> expired` for every hold with `expires_at < now`. Returns the reclaimed rows.
    async fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<Vec<Reservation>>;
}

/// One webhook delivery to be recorded together with its effect on the transaction.
#[derive(Debug, Clone)]
pub struct EventApplication {
    pub transaction_id: Uuid,
    pub key: LedgerKey,
    /// Gateway-reported state. Applied only when the state machine allows it.
    pub target: PaymentState,
    /// Set `external_transaction_id` from the ledger key if the transaction has none yet.
    pub assign_external_id: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied {
        transaction: PaymentTransaction,
        previous: PaymentState,
        transitioned: bool,
    },
    /// The ledger already holds this key; nothing was written.
    Duplicate,
}

/// Repository trait for payment transactions and the webhook dedup ledger.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `Duplicate` when `(tenant_id, idempotency_key)` already exists.
    async fn insert_transaction(&self, transaction: PaymentTransaction) -> StoreResult<PaymentTransaction>;

    async fn get_transaction(&self, id: Uuid) -> StoreResult<Option<PaymentTransaction>>;

    async fn find_by_idempotency_key(&self, tenant_id: &str, key: &str) -> StoreResult<Option<PaymentTransaction>>;

    async fn find_by_external_id(&self, gateway: &str, external_id: &str) -> StoreResult<Option<PaymentTransaction>>;

    async fn list_for_reservation(&self, reservation_id: Uuid) -> StoreResult<Vec<PaymentTransaction>>;

    /// Record the gateway session. `external_id` is only written if none is set yet.
    async fn attach_session(
        &self,
        id: Uuid,
        redirect_url: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<PaymentTransaction>;

    async fn is_processed(&self, key: &LedgerKey) -> StoreResult<bool>;

    /// Insert the ledger row and update the transaction in one unit: both or neither.
    async fn apply_event(&self, application: EventApplication) -> StoreResult<ApplyOutcome>;

    async fn list_in_state(&self, state: PaymentState) -> StoreResult<Vec<PaymentTransaction>>;
}

/// Repository trait for fixed-window rate limit counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one hit for `key` and return the count within the current window.
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> StoreResult<u64>;
}
