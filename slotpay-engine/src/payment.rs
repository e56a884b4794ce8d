use serde::Serialize;
use slotpay_core::payment::{
    normalize_currency, GatewayError, PaymentGateway, PaymentState, PaymentTransaction, SessionRequest,
};
use slotpay_core::repository::{PaymentStore, StoreError};
use slotpay_core::reservation::{Reservation, ReservationStatus};
use slotpay_core::Clock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::locks::KeyedLocks;
use crate::reservation::{ReservationError, ReservationManager};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct CreateSession {
    pub reservation_id: Uuid,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentSession {
    pub transaction: PaymentTransaction,
    pub redirect_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("reservation {0} is not held")]
    ReservationNotHeld(Uuid),
    #[error("reservation {0} not found")]
    ReservationNotFound(Uuid),
    /// Another live transaction already pays for the reservation.
    #[error("payment {0} is already in progress for this reservation")]
    PaymentInProgress(Uuid),
    #[error("payment {0} not found")]
    NotFound(Uuid),
    #[error("invalid payment request: {0}")]
    Validation(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Opens hosted payment sessions for held reservations.
pub struct PaymentCoordinator {
    store: Arc<dyn PaymentStore>,
    reservations: Arc<ReservationManager>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks<Uuid>,
}

impl PaymentCoordinator {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        reservations: Arc<ReservationManager>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            reservations,
            gateway,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    /// Create (or return the existing) pending transaction for the reservation and open the
    /// gateway session. A gateway failure leaves the transaction pending and the hold untouched;
    /// retrying with the same idempotency key resumes it.
    pub async fn create_session(&self, mut request: CreateSession) -> Result<PaymentSession, PaymentError> {
        request.idempotency_key = request.idempotency_key.trim().to_string();
        validate(&request)?;
        let currency = normalize_currency(&request.currency).map_err(|e| PaymentError::Validation(e.to_string()))?;

        let _guard = self.locks.lock(request.reservation_id).await;
        let reservation = self.load_reservation(request.reservation_id).await?;

        if let Some(existing) = self
            .store
            .find_by_idempotency_key(&reservation.tenant_id, &request.idempotency_key)
            .await?
        {
            return self.resume(existing, &request, &reservation).await;
        }

        let now = self.clock.now();
        if reservation.status != ReservationStatus::Held || reservation.is_lapsed(now) {
            debug!(reservation_id = %reservation.id, status = %reservation.status, "Payment refused, reservation not held");
            return Err(PaymentError::ReservationNotHeld(reservation.id));
        }

        let live = self.store.list_for_reservation(reservation.id).await?;
        if let Some(other) = live.iter().find(|tx| tx.state != PaymentState::Failed) {
            return Err(PaymentError::PaymentInProgress(other.id));
        }

        let pending = PaymentTransaction::pending(
            &reservation,
            request.amount,
            currency,
            self.gateway.name().to_string(),
            request.idempotency_key.clone(),
            now,
        );
        let transaction = match self.store.insert_transaction(pending).await {
            Ok(transaction) => transaction,
            Err(StoreError::Duplicate(_)) => {
                // Lost the race on the idempotency key; the winner's row is authoritative.
                let winner = self
                    .store
                    .find_by_idempotency_key(&reservation.tenant_id, &request.idempotency_key)
                    .await?
                    .ok_or_else(|| StoreError::Corrupt("idempotency key vanished after conflict".into()))?;
                return self.resume(winner, &request, &reservation).await;
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            transaction_id = %transaction.id,
            reservation_id = %reservation.id,
            amount = transaction.amount,
            currency = %transaction.currency,
            "Payment transaction created"
        );
        self.open_session(transaction).await
    }

    pub async fn get(&self, id: Uuid) -> Result<PaymentTransaction, PaymentError> {
        self.store.get_transaction(id).await?.ok_or(PaymentError::NotFound(id))
    }

    async fn resume(
        &self,
        existing: PaymentTransaction,
        request: &CreateSession,
        reservation: &Reservation,
    ) -> Result<PaymentSession, PaymentError> {
        if existing.reservation_id != request.reservation_id {
            return Err(PaymentError::Validation(
                "idempotency key was already used for another reservation".into(),
            ));
        }
        if let Some(redirect_url) = existing.redirect_url.clone() {
            debug!(transaction_id = %existing.id, "Returning existing payment session");
            return Ok(PaymentSession {
                transaction: existing,
                redirect_url,
            });
        }

        // The gateway call failed last time. Only retry while the hold can still be paid for.
        if reservation.status != ReservationStatus::Held || reservation.is_lapsed(self.clock.now()) {
            return Err(PaymentError::ReservationNotHeld(reservation.id));
        }
        if existing.state != PaymentState::Pending {
            return Err(PaymentError::PaymentInProgress(existing.id));
        }
        info!(transaction_id = %existing.id, "Retrying gateway session for pending transaction");
        self.open_session(existing).await
    }

    async fn open_session(&self, transaction: PaymentTransaction) -> Result<PaymentSession, PaymentError> {
        let request = SessionRequest {
            transaction_id: transaction.id,
            reservation_id: transaction.reservation_id,
            tenant_id: transaction.tenant_id.clone(),
            amount: transaction.amount,
            currency: transaction.currency.clone(),
        };
        let session = match self.gateway.create_session(&request).await {
            Ok(session) => session,
            Err(e) => {
                warn!(transaction_id = %transaction.id, error = %e, "Gateway session could not be opened");
                return Err(e.into());
            }
        };

        let transaction = self
            .store
            .attach_session(
                transaction.id,
                &session.redirect_url,
                session.external_transaction_id.as_deref(),
                self.clock.now(),
            )
            .await?;
        info!(transaction_id = %transaction.id, session_id = %session.session_id, "Payment session opened");

        Ok(PaymentSession {
            transaction,
            redirect_url: session.redirect_url,
        })
    }

    async fn load_reservation(&self, id: Uuid) -> Result<Reservation, PaymentError> {
        match self.reservations.get(id).await {
            Ok(reservation) => Ok(reservation),
            Err(ReservationError::NotFound(id)) => Err(PaymentError::ReservationNotFound(id)),
            Err(ReservationError::Store(e)) => Err(PaymentError::Store(e)),
            Err(other) => Err(PaymentError::Store(StoreError::Corrupt(other.to_string()))),
        }
    }
}

fn validate(request: &CreateSession) -> Result<(), PaymentError> {
    if request.amount <= 0 {
        return Err(PaymentError::Validation("amount must be positive".into()));
    }
    let key = &request.idempotency_key;
    if key.is_empty() {
        return Err(PaymentError::Validation("idempotency_key must not be empty".into()));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(PaymentError::Validation(format!(
            "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    Ok(())
}
