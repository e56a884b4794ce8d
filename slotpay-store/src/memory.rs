//! In-memory implementation of every storage seam.
//!
//! All state lives behind `tokio::sync` locks. Each trait method takes the relevant lock once,
//! so check-and-insert, conditional updates and event application are atomic within the process.
//! Nothing is durable and multiple processes do not coordinate; this backend serves local runs,
//! tests, and deployments without Postgres.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use slotpay_core::events::{BookingEvent, EventPublisher};
use slotpay_core::payment::{PaymentState, PaymentTransaction};
use slotpay_core::rate_limit::RateLimitBucket;
use slotpay_core::repository::{
    ApplyOutcome, EventApplication, PaymentStore, RateLimitStore, ReservationStore, StoreError, StoreResult,
};
use slotpay_core::reservation::{Reservation, ReservationStatus};
use slotpay_core::webhook::LedgerKey;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct PaymentTables {
    transactions: HashMap<Uuid, PaymentTransaction>,
    /// `(tenant_id, idempotency_key)` unique index.
    by_idempotency_key: HashMap<(String, String), Uuid>,
    /// `(gateway, external_transaction_id)` unique index.
    by_external_id: HashMap<(String, String), Uuid>,
    ledger: HashSet<LedgerKey>,
}

#[derive(Default)]
pub struct MemoryStore {
    reservations: RwLock<HashMap<Uuid, Reservation>>,
    payments: RwLock<PaymentTables>,
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a transaction as-is, bypassing every check. Simulates crashes and manual edits.
    pub async fn force_transaction(&self, transaction: PaymentTransaction) {
        let mut tables = self.payments.write().await;
        if let Some(external_id) = &transaction.external_transaction_id {
            tables
                .by_external_id
                .insert((transaction.gateway.clone(), external_id.clone()), transaction.id);
        }
        tables.by_idempotency_key.insert(
            (transaction.tenant_id.clone(), transaction.idempotency_key.clone()),
            transaction.id,
        );
        tables.transactions.insert(transaction.id, transaction);
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn insert_if_free(&self, reservation: Reservation) -> StoreResult<Reservation> {
        let mut reservations = self.reservations.write().await;
        if reservations.values().any(|existing| existing.blocks(&reservation)) {
            return Err(StoreError::Conflict);
        }
        reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn get_reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        Ok(self.reservations.read().await.get(&id).cloned())
    }

    async fn confirm_if_held(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Reservation>> {
        let mut reservations = self.reservations.write().await;
        match reservations.get_mut(&id) {
            Some(r) if r.status == ReservationStatus::Held && !r.is_lapsed(now) => {
                r.update_status(ReservationStatus::Confirmed, now);
                Ok(Some(r.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_if_active(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Reservation>> {
        let mut reservations = self.reservations.write().await;
        match reservations.get_mut(&id) {
            Some(r) if r.status.is_active() => {
                r.update_status(ReservationStatus::Cancelled, now);
                Ok(Some(r.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<Vec<Reservation>> {
        let mut reservations = self.reservations.write().await;
        let mut reclaimed = Vec::new();
        for r in reservations.values_mut() {
            if r.status == ReservationStatus::Held && r.expires_at.is_some_and(|at| at < now) {
                r.update_status(ReservationStatus::Expired, now);
                reclaimed.push(r.clone());
            }
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert_transaction(&self, transaction: PaymentTransaction) -> StoreResult<PaymentTransaction> {
        let mut tables = self.payments.write().await;
        let key = (transaction.tenant_id.clone(), transaction.idempotency_key.clone());
        if tables.by_idempotency_key.contains_key(&key) {
            return Err(StoreError::Duplicate(format!("idempotency key {}", transaction.idempotency_key)));
        }
        tables.by_idempotency_key.insert(key, transaction.id);
        tables.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn get_transaction(&self, id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        Ok(self.payments.read().await.transactions.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, tenant_id: &str, key: &str) -> StoreResult<Option<PaymentTransaction>> {
        let tables = self.payments.read().await;
        Ok(tables
            .by_idempotency_key
            .get(&(tenant_id.to_string(), key.to_string()))
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn find_by_external_id(&self, gateway: &str, external_id: &str) -> StoreResult<Option<PaymentTransaction>> {
        let tables = self.payments.read().await;
        Ok(tables
            .by_external_id
            .get(&(gateway.to_string(), external_id.to_string()))
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn list_for_reservation(&self, reservation_id: Uuid) -> StoreResult<Vec<PaymentTransaction>> {
        let tables = self.payments.read().await;
        let mut found: Vec<PaymentTransaction> = tables
            .transactions
            .values()
            .filter(|t| t.reservation_id == reservation_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn attach_session(
        &self,
        id: Uuid,
        redirect_url: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<PaymentTransaction> {
        let mut tables = self.payments.write().await;
        let PaymentTables {
            transactions,
            by_external_id,
            ..
        } = &mut *tables;
        let transaction = transactions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment transaction {id}")))?;

        transaction.redirect_url = Some(redirect_url.to_string());
        if let Some(external_id) = external_id.filter(|_| transaction.external_transaction_id.is_none()) {
            let index_key = (transaction.gateway.clone(), external_id.to_string());
            if by_external_id.contains_key(&index_key) {
                return Err(StoreError::Duplicate(format!("external transaction id {external_id}")));
            }
            by_external_id.insert(index_key, id);
            transaction.external_transaction_id = Some(external_id.to_string());
        }
        transaction.updated_at = now;
        Ok(transaction.clone())
    }

    async fn is_processed(&self, key: &LedgerKey) -> StoreResult<bool> {
        Ok(self.payments.read().await.ledger.contains(key))
    }

    async fn apply_event(&self, application: EventApplication) -> StoreResult<ApplyOutcome> {
        let mut tables = self.payments.write().await;
        if tables.ledger.contains(&application.key) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let PaymentTables {
            transactions,
            by_external_id,
            ledger,
            ..
        } = &mut *tables;
        let transaction = transactions
            .get_mut(&application.transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment transaction {}", application.transaction_id)))?;

        let external_id = application.key.external_transaction_id.clone();
        if let Some(existing) = transaction.external_transaction_id.as_deref() {
            if existing != external_id {
                return Err(StoreError::Corrupt(format!(
                    "transaction {} already bound to external id {existing}",
                    transaction.id
                )));
            }
        } else if application.assign_external_id {
            by_external_id.insert((transaction.gateway.clone(), external_id.clone()), transaction.id);
            transaction.external_transaction_id = Some(external_id);
        }

        let previous = transaction.state;
        let transitioned = previous.can_transition_to(application.target);
        if transitioned {
            transaction.state = application.target;
        }
        transaction.last_event_id = Some(application.key.event_id.clone());
        transaction.updated_at = application.now;
        ledger.insert(application.key);

        Ok(ApplyOutcome::Applied {
            transaction: transaction.clone(),
            previous,
            transitioned,
        })
    }

    async fn list_in_state(&self, state: PaymentState) -> StoreResult<Vec<PaymentTransaction>> {
        let tables = self.payments.read().await;
        let mut found: Vec<PaymentTransaction> = tables
            .transactions
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut buckets = self.buckets.lock().await;
        // Each bucket ages out on its own window so the map stays bounded.
        buckets.retain(|_, bucket| !bucket.is_stale(now));
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateLimitBucket::open(key, window, now));
        bucket.window = window;
        Ok(bucket.hit(now))
    }
}

/// Keeps every published event in memory. Used by tests and local runs.
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<BookingEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<BookingEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventLog {
    async fn publish(&self, event: &BookingEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotpay_core::reservation::{Resource, ResourceKind, Slot};

    fn hold(resource: &str, start_min: i64, end_min: i64, now: DateTime<Utc>) -> Reservation {
        let base = now + Duration::hours(1);
        let slot = Slot::new(base + Duration::minutes(start_min), base + Duration::minutes(end_min)).unwrap();
        Reservation::hold(
            &Resource::new("t1", resource, ResourceKind::Instructor),
            slot,
            "holder".into(),
            now,
            Duration::seconds(300),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_rejects_overlap_on_same_resource_only() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.insert_if_free(hold("r1", 0, 45, now)).await.unwrap();
        assert!(matches!(
            store.insert_if_free(hold("r1", 30, 60, now)).await,
            Err(StoreError::Conflict)
        ));
        store.insert_if_free(hold("r1", 45, 90, now)).await.unwrap();
        store.insert_if_free(hold("r2", 0, 45, now)).await.unwrap();
    }

    #[tokio::test]
    async fn test_expire_lapsed_skips_confirmed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.insert_if_free(hold("r1", 0, 45, now)).await.unwrap();
        let b = store.insert_if_free(hold("r1", 60, 90, now)).await.unwrap();
        store.confirm_if_held(b.id, now).await.unwrap().unwrap();

        let reclaimed = store.expire_lapsed(now + Duration::seconds(301)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, a.id);
        assert_eq!(
            store.get_reservation(b.id).await.unwrap().unwrap().status,
            ReservationStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_rate_limit_buckets_are_per_key() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let window = Duration::seconds(60);
        assert_eq!(store.hit("a", window, now).await.unwrap(), 1);
        assert_eq!(store.hit("a", window, now).await.unwrap(), 2);
        assert_eq!(store.hit("b", window, now).await.unwrap(), 1);
        assert_eq!(store.hit("a", window, now + window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_short_window_key_does_not_evict_long_window_bucket() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let hour = Duration::hours(1);
        assert_eq!(store.hit("ratelimit:ip:acquire", hour, now).await.unwrap(), 1);
        assert_eq!(store.hit("ratelimit:ip:acquire", hour, now).await.unwrap(), 2);

        let later = now + Duration::seconds(5);
        assert_eq!(store.hit("ratelimit:ip:other", Duration::seconds(1), later).await.unwrap(), 1);
        assert_eq!(store.hit("ratelimit:ip:acquire", hour, later).await.unwrap(), 3);
    }
}
