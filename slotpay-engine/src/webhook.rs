use serde::Serialize;
use slotpay_core::events::{BookingEvent, EventPublisher};
use slotpay_core::payment::{map_gateway_state, PaymentState, PaymentTransaction};
use slotpay_core::repository::{ApplyOutcome, EventApplication, PaymentStore, StoreError};
use slotpay_core::secret::Masked;
use slotpay_core::webhook::{verify_signature, WebhookEvent};
use slotpay_core::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::locks::KeyedLocks;
use crate::publish;
use crate::reservation::{ReservationError, ReservationManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The event moved the transaction.
    Processed,
    /// Already in the ledger. Nothing was written.
    Duplicate,
    /// Recorded, but stale or out of order for the current state.
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook signature missing or invalid")]
    Unauthorized,
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("unknown gateway state: {0}")]
    UnknownState(String),
    #[error("no transaction for {gateway} external id {external_transaction_id}")]
    TransactionNotFound {
        gateway: String,
        external_transaction_id: String,
    },
    #[error("transaction {0} is bound to a different external id")]
    ExternalIdMismatch(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies signed gateway notifications exactly once and drives the reservation they pay for.
pub struct WebhookProcessor {
    secrets: HashMap<String, Masked<String>>,
    store: Arc<dyn PaymentStore>,
    reservations: Arc<ReservationManager>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks<(String, String)>,
}

impl WebhookProcessor {
    pub fn new(
        secrets: HashMap<String, Masked<String>>,
        store: Arc<dyn PaymentStore>,
        reservations: Arc<ReservationManager>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secrets,
            store,
            reservations,
            events,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn process_event(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookOutcome, WebhookError> {
        let signer = self.authenticate(body, signature)?;
        let event: WebhookEvent = serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        if event.gateway != signer {
            warn!(signer, gateway = %event.gateway, "Webhook signed with another gateway's secret");
            return Err(WebhookError::Unauthorized);
        }
        if event.external_transaction_id.trim().is_empty() || event.event_id.trim().is_empty() {
            return Err(WebhookError::Malformed(
                "external_transaction_id and event_id must not be empty".into(),
            ));
        }

        let key = event.ledger_key();
        let _guard = self
            .locks
            .lock((key.gateway.clone(), key.external_transaction_id.clone()))
            .await;

        if self.store.is_processed(&key).await? {
            debug!(gateway = %key.gateway, event_id = %key.event_id, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        let (transaction, assign_external_id) = self.locate(&event).await?;
        let Some(target) = map_gateway_state(&event.state) else {
            warn!(gateway = %event.gateway, state = %event.state, "Webhook carries an unknown gateway state");
            return Err(WebhookError::UnknownState(event.state));
        };

        let outcome = self
            .store
            .apply_event(EventApplication {
                transaction_id: transaction.id,
                key,
                target,
                assign_external_id,
                now: self.clock.now(),
            })
            .await?;

        match outcome {
            ApplyOutcome::Duplicate => Ok(WebhookOutcome::Duplicate),
            ApplyOutcome::Applied {
                transaction,
                previous,
                transitioned: false,
            } => {
                info!(
                    transaction_id = %transaction.id,
                    current = %previous,
                    reported = %target,
                    event_id = %event.event_id,
                    "Stale payment event recorded without effect"
                );
                Ok(WebhookOutcome::Ignored)
            }
            ApplyOutcome::Applied {
                transaction, previous, ..
            } => {
                info!(
                    transaction_id = %transaction.id,
                    from = %previous,
                    to = %transaction.state,
                    event_id = %event.event_id,
                    "Payment state updated"
                );
                self.drive_reservation(&transaction).await;
                Ok(WebhookOutcome::Processed)
            }
        }
    }

    /// Returns the gateway whose secret produced `signature`.
    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> Result<&str, WebhookError> {
        let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
            warn!("Webhook rejected, no signature");
            return Err(WebhookError::Unauthorized);
        };
        self.secrets
            .iter()
            .find(|(_, secret)| verify_signature(secret.expose(), body, signature))
            .map(|(gateway, _)| gateway.as_str())
            .ok_or_else(|| {
                warn!("Webhook rejected, signature does not match any gateway secret");
                WebhookError::Unauthorized
            })
    }

    /// Finds the transaction by external id, or by `reference` the first time the gateway's id
    /// is seen. The bool says whether the external id still has to be bound.
    async fn locate(&self, event: &WebhookEvent) -> Result<(PaymentTransaction, bool), WebhookError> {
        if let Some(transaction) = self
            .store
            .find_by_external_id(&event.gateway, &event.external_transaction_id)
            .await?
        {
            return Ok((transaction, false));
        }

        if let Some(reference) = event.reference {
            if let Some(transaction) = self.store.get_transaction(reference).await? {
                if transaction.gateway == event.gateway {
                    if transaction.external_transaction_id.is_some() {
                        warn!(
                            transaction_id = %transaction.id,
                            external_transaction_id = %event.external_transaction_id,
                            "Webhook reference points at a transaction bound to another external id"
                        );
                        return Err(WebhookError::ExternalIdMismatch(transaction.id));
                    }
                    return Ok((transaction, true));
                }
            }
        }

        Err(WebhookError::TransactionNotFound {
            gateway: event.gateway.clone(),
            external_transaction_id: event.external_transaction_id.clone(),
        })
    }

    /// Reservation side effect of a state change. Failures here are left to the reconciler.
    async fn drive_reservation(&self, transaction: &PaymentTransaction) {
        let reservation_id = transaction.reservation_id;
        match transaction.state {
            PaymentState::Completed => match self.reservations.confirm(reservation_id).await {
                Ok(_) => {}
                Err(ReservationError::Expired(_)) => {
                    error!(
                        transaction_id = %transaction.id,
                        %reservation_id,
                        "Payment completed for a reservation that is no longer held, manual refund required"
                    );
                    publish(
                        self.events.as_ref(),
                        BookingEvent::PaymentFlagged {
                            transaction_id: transaction.id,
                            tenant_id: transaction.tenant_id.clone(),
                            reason: "paid_after_hold_released".into(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    warn!(transaction_id = %transaction.id, %reservation_id, error = %e, "Confirm after payment failed");
                }
            },
            PaymentState::Failed | PaymentState::Refunded => match self.reservations.cancel(reservation_id).await {
                Ok(_) => {}
                Err(ReservationError::Expired(_)) => {
                    debug!(%reservation_id, "Reservation already released");
                }
                Err(e) => {
                    warn!(transaction_id = %transaction.id, %reservation_id, error = %e, "Release after payment failure failed");
                }
            },
            PaymentState::Pending | PaymentState::Authorized => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{CreateSession, PaymentCoordinator};
    use crate::reservation::AcquireRequest;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use slotpay_core::payment::MockPaymentGateway;
    use slotpay_core::reservation::{Reservation, ReservationStatus, Resource, ResourceKind, Slot};
    use slotpay_core::webhook::sign_payload;
    use slotpay_core::ManualClock;
    use slotpay_store::{MemoryEventLog, MemoryStore};

    const SECRET: &str = "whsec_test";

    struct Fixture {
        clock: Arc<ManualClock>,
        events: Arc<MemoryEventLog>,
        reservations: Arc<ReservationManager>,
        payments: PaymentCoordinator,
        processor: WebhookProcessor,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventLog::new());
        let reservations = Arc::new(ReservationManager::new(store.clone(), events.clone(), clock.clone()));
        let payments = PaymentCoordinator::new(
            store.clone(),
            reservations.clone(),
            Arc::new(MockPaymentGateway::new("datatrans", "https://pay.example.test")),
            clock.clone(),
        );
        let secrets = HashMap::from([("datatrans".to_string(), Masked(SECRET.to_string()))]);
        let processor = WebhookProcessor::new(secrets, store, reservations.clone(), events.clone(), clock.clone());
        Fixture {
            clock,
            events,
            reservations,
            payments,
            processor,
        }
    }

    fn slot_request(ttl_secs: u64) -> AcquireRequest {
        AcquireRequest {
            resource: Resource::new("T", "R1", ResourceKind::Instructor),
            slot: Slot::new(
                Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, 10, 45, 0).unwrap(),
            )
            .unwrap(),
            holder_id: "customer-1".into(),
            ttl: std::time::Duration::from_secs(ttl_secs),
        }
    }

    async fn held_with_payment(f: &Fixture, ttl_secs: u64) -> (Reservation, PaymentTransaction) {
        let held = f.reservations.acquire(slot_request(ttl_secs)).await.unwrap();
        let session = f
            .payments
            .create_session(CreateSession {
                reservation_id: held.id,
                amount: 8000,
                currency: "CHF".into(),
                idempotency_key: "abc".into(),
            })
            .await
            .unwrap();
        (held, session.transaction)
    }

    fn body(external_id: &str, event_id: &str, state: &str, reference: Option<Uuid>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "gateway": "datatrans",
            "external_transaction_id": external_id,
            "event_id": event_id,
            "state": state,
            "timestamp": "2026-03-02T09:01:00Z",
            "reference": reference,
        }))
        .unwrap()
    }

    async fn deliver(f: &Fixture, body: &[u8]) -> Result<WebhookOutcome, WebhookError> {
        let signature = sign_payload(SECRET, body).unwrap();
        f.processor.process_event(body, Some(&signature)).await
    }

    #[tokio::test]
    async fn test_success_confirms_once_and_replay_is_a_noop() {
        let f = fixture();
        let (held, transaction) = held_with_payment(&f, 900).await;
        let event = body("X1", "E1", "SUCCESS", Some(transaction.id));

        assert_eq!(deliver(&f, &event).await.unwrap(), WebhookOutcome::Processed);
        for _ in 0..3 {
            assert_eq!(deliver(&f, &event).await.unwrap(), WebhookOutcome::Duplicate);
        }

        let paid = f.payments.get(transaction.id).await.unwrap();
        assert_eq!(paid.state, PaymentState::Completed);
        assert_eq!(paid.external_transaction_id.as_deref(), Some("X1"));
        assert_eq!(paid.last_event_id.as_deref(), Some("E1"));
        assert_eq!(f.reservations.get(held.id).await.unwrap().status, ReservationStatus::Confirmed);

        let confirmations = f
            .events
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, BookingEvent::ReservationConfirmed { .. }))
            .count();
        assert_eq!(confirmations, 1);
    }

    #[tokio::test]
    async fn test_failure_cancels_and_frees_the_slot() {
        let f = fixture();
        let (held, transaction) = held_with_payment(&f, 900).await;

        let outcome = deliver(&f, &body("X1", "E1", "FAILED", Some(transaction.id))).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(f.payments.get(transaction.id).await.unwrap().state, PaymentState::Failed);
        assert_eq!(f.reservations.get(held.id).await.unwrap().status, ReservationStatus::Cancelled);

        f.reservations.acquire(slot_request(300)).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_event_is_recorded_but_ignored() {
        let f = fixture();
        let (_, transaction) = held_with_payment(&f, 900).await;

        deliver(&f, &body("X1", "E2", "settled", Some(transaction.id))).await.unwrap();
        let outcome = deliver(&f, &body("X1", "E1", "authorized", None)).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(
            deliver(&f, &body("X1", "E1", "authorized", None)).await.unwrap(),
            WebhookOutcome::Duplicate
        );

        let current = f.payments.get(transaction.id).await.unwrap();
        assert_eq!(current.state, PaymentState::Completed);
        assert_eq!(current.last_event_id.as_deref(), Some("E1"));
    }

    #[tokio::test]
    async fn test_rejects_bad_signatures_without_mutation() {
        let f = fixture();
        let (_, transaction) = held_with_payment(&f, 900).await;
        let event = body("X1", "E1", "SUCCESS", Some(transaction.id));

        let forged = sign_payload("not-the-secret", &event).unwrap();
        assert!(matches!(
            f.processor.process_event(&event, Some(&forged)).await,
            Err(WebhookError::Unauthorized)
        ));
        assert!(matches!(
            f.processor.process_event(&event, None).await,
            Err(WebhookError::Unauthorized)
        ));
        assert_eq!(f.payments.get(transaction.id).await.unwrap().state, PaymentState::Pending);

        // A valid delivery afterwards is not mistaken for a duplicate.
        assert_eq!(deliver(&f, &event).await.unwrap(), WebhookOutcome::Processed);
    }

    #[tokio::test]
    async fn test_unknown_state_and_unknown_transaction() {
        let f = fixture();
        let (_, transaction) = held_with_payment(&f, 900).await;

        let err = deliver(&f, &body("X1", "E1", "chargeback", Some(transaction.id))).await.unwrap_err();
        assert!(matches!(err, WebhookError::UnknownState(state) if state == "chargeback"));
        let unchanged = f.payments.get(transaction.id).await.unwrap();
        assert_eq!(unchanged.state, PaymentState::Pending);
        assert_eq!(unchanged.external_transaction_id, None);

        let err = deliver(&f, &body("X404", "E9", "SUCCESS", None)).await.unwrap_err();
        assert!(matches!(err, WebhookError::TransactionNotFound { .. }));

        let err = deliver(&f, b"{not json").await.unwrap_err();
        assert!(matches!(err, WebhookError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_reference_cannot_rebind_external_id() {
        let f = fixture();
        let (_, transaction) = held_with_payment(&f, 900).await;

        deliver(&f, &body("X1", "E1", "authorized", Some(transaction.id))).await.unwrap();
        let err = deliver(&f, &body("X2", "E2", "SUCCESS", Some(transaction.id))).await.unwrap_err();
        assert!(matches!(err, WebhookError::ExternalIdMismatch(id) if id == transaction.id));
        assert_eq!(
            f.payments.get(transaction.id).await.unwrap().external_transaction_id.as_deref(),
            Some("X1")
        );
    }

    #[tokio::test]
    async fn test_payment_after_lapse_is_flagged() {
        let f = fixture();
        let (held, transaction) = held_with_payment(&f, 60).await;
        f.clock.advance(chrono::Duration::seconds(61));
        f.reservations.sweep_expired(f.clock.now()).await.unwrap();

        let outcome = deliver(&f, &body("X1", "E1", "paid", Some(transaction.id))).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(f.payments.get(transaction.id).await.unwrap().state, PaymentState::Completed);
        assert_eq!(f.reservations.get(held.id).await.unwrap().status, ReservationStatus::Expired);

        let flagged = f
            .events
            .events()
            .await
            .into_iter()
            .any(|e| matches!(e, BookingEvent::PaymentFlagged { transaction_id, .. } if transaction_id == transaction.id));
        assert!(flagged);
    }
}
