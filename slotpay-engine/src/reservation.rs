use chrono::{DateTime, Utc};
use slotpay_core::events::{BookingEvent, EventPublisher};
use slotpay_core::repository::{ReservationStore, StoreError};
use slotpay_core::reservation::{Reservation, ReservationStatus, Resource, Slot};
use slotpay_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::locks::KeyedLocks;
use crate::publish;

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub resource: Resource,
    pub slot: Slot,
    pub holder_id: String,
    pub ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("resource {resource_id} is already reserved between {start} and {end}")]
    Conflict {
        resource_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("reservation {0} is no longer held")]
    Expired(Uuid),
    #[error("reservation {0} not found")]
    NotFound(Uuid),
    #[error("invalid reservation request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the reservation lifecycle and the per-resource exclusion of overlapping slots.
pub struct ReservationManager {
    store: Arc<dyn ReservationStore>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks<(String, String)>,
    max_ttl: Option<Duration>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn ReservationStore>, events: Arc<dyn EventPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
            locks: KeyedLocks::new(),
            max_ttl: None,
        }
    }

    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = Some(max_ttl);
        self
    }

    /// Hold `slot` on the resource for `ttl`, or fail with `Conflict` if any held or confirmed
    /// reservation overlaps it. No retries: the caller picks another slot.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<Reservation, ReservationError> {
        request
            .slot
            .validate()
            .map_err(|e| ReservationError::Validation(e.to_string()))?;
        if request.holder_id.trim().is_empty() {
            return Err(ReservationError::Validation("holder_id must not be empty".into()));
        }
        if request.ttl.is_zero() {
            return Err(ReservationError::Validation("ttl must be positive".into()));
        }
        if let Some(max_ttl) = self.max_ttl {
            if request.ttl > max_ttl {
                return Err(ReservationError::Validation(format!(
                    "ttl of {}s exceeds the maximum hold of {}s",
                    request.ttl.as_secs(),
                    max_ttl.as_secs()
                )));
            }
        }
        let ttl = chrono::Duration::from_std(request.ttl)
            .map_err(|e| ReservationError::Validation(format!("ttl out of range: {e}")))?;

        let resource_key = (request.resource.tenant_id.clone(), request.resource.id.clone());
        let _guard = self.locks.lock(resource_key).await;

        let now = self.clock.now();
        let reservation = Reservation::hold(&request.resource, request.slot, request.holder_id, now, ttl)
            .map_err(|e| ReservationError::Validation(e.to_string()))?;
        match self.store.insert_if_free(reservation).await {
            Ok(reservation) => {
                info!(
                    reservation_id = %reservation.id,
                    tenant_id = %reservation.tenant_id,
                    resource_id = %reservation.resource_id,
                    "Slot held"
                );
                publish(
                    self.events.as_ref(),
                    BookingEvent::ReservationHeld {
                        reservation_id: reservation.id,
                        tenant_id: reservation.tenant_id.clone(),
                        resource_id: reservation.resource_id.clone(),
                        expires_at: reservation.expires_at,
                    },
                )
                .await;
                Ok(reservation)
            }
            Err(StoreError::Conflict) => {
                debug!(resource_id = %request.resource.id, "Slot already taken");
                Err(ReservationError::Conflict {
                    resource_id: request.resource.id,
                    start: request.slot.start,
                    end: request.slot.end,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Turn a live hold into a confirmed booking. Confirming twice is a no-op success.
    pub async fn confirm(&self, id: Uuid) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        if let Some(reservation) = self.store.confirm_if_held(id, now).await? {
            info!(reservation_id = %id, "Reservation confirmed");
            publish(
                self.events.as_ref(),
                BookingEvent::ReservationConfirmed {
                    reservation_id: id,
                    tenant_id: reservation.tenant_id.clone(),
                },
            )
            .await;
            return Ok(reservation);
        }

        match self.store.get_reservation(id).await? {
            None => Err(ReservationError::NotFound(id)),
            Some(reservation) if reservation.status == ReservationStatus::Confirmed => Ok(reservation),
            Some(reservation) => {
                debug!(reservation_id = %id, status = %reservation.status, "Confirm refused");
                Err(ReservationError::Expired(id))
            }
        }
    }

    /// Release a held or confirmed reservation. Cancelling twice is a no-op success.
    ///
    /// Side effects: frees the slot immediately. It never refunds a payment that is in flight
    /// or already completed for this reservation; that compensation is the caller's to trigger.
    pub async fn cancel(&self, id: Uuid) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        if let Some(reservation) = self.store.cancel_if_active(id, now).await? {
            info!(reservation_id = %id, "Reservation cancelled");
            publish(
                self.events.as_ref(),
                BookingEvent::ReservationReleased {
                    reservation_id: id,
                    tenant_id: reservation.tenant_id.clone(),
                    reason: "cancelled".into(),
                },
            )
            .await;
            return Ok(reservation);
        }

        match self.store.get_reservation(id).await? {
            None => Err(ReservationError::NotFound(id)),
            Some(reservation) if reservation.status == ReservationStatus::Cancelled => Ok(reservation),
            Some(_) => Err(ReservationError::Expired(id)),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Reservation, ReservationError> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or(ReservationError::NotFound(id))
    }

    /// Expire every hold whose `expires_at` is before `now`. Returns how many were reclaimed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, ReservationError> {
        let reclaimed = self.store.expire_lapsed(now).await?;
        for reservation in &reclaimed {
            publish(
                self.events.as_ref(),
                BookingEvent::ReservationReleased {
                    reservation_id: reservation.id,
                    tenant_id: reservation.tenant_id.clone(),
                    reason: "expired".into(),
                },
            )
            .await;
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Expired lapsed holds");
        }
        Ok(reclaimed.len())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use slotpay_core::events::NoopPublisher;
    use slotpay_core::reservation::ResourceKind;
    use slotpay_core::ManualClock;
    use slotpay_store::MemoryStore;

    fn manager() -> (ReservationManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let manager = ReservationManager::new(Arc::new(MemoryStore::new()), Arc::new(NoopPublisher), clock.clone())
            .with_max_ttl(Duration::from_secs(3600));
        (manager, clock)
    }

    fn request(resource: &str, start: (u32, u32), end: (u32, u32), ttl_secs: u64) -> AcquireRequest {
        AcquireRequest {
            resource: Resource::new("T", resource, ResourceKind::Instructor),
            slot: Slot::new(
                Utc.with_ymd_and_hms(2026, 3, 2, start.0, start.1, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, end.0, end.1, 0).unwrap(),
            )
            .unwrap(),
            holder_id: "customer-1".into(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_acquire_then_conflict() {
        let (manager, _) = manager();
        let held = manager.acquire(request("R1", (10, 0), (10, 45), 300)).await.unwrap();
        assert_eq!(held.status, ReservationStatus::Held);

        let err = manager.acquire(request("R1", (10, 30), (11, 0), 300)).await.unwrap_err();
        assert!(matches!(err, ReservationError::Conflict { .. }));

        // Adjacent slot and other resource are free.
        manager.acquire(request("R1", (10, 45), (11, 30), 300)).await.unwrap();
        manager.acquire(request("R2", (10, 0), (10, 45), 300)).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_validates_ttl() {
        let (manager, _) = manager();
        let err = manager.acquire(request("R1", (10, 0), (10, 45), 0)).await.unwrap_err();
        assert!(matches!(err, ReservationError::Validation(_)));
        let err = manager.acquire(request("R1", (10, 0), (10, 45), 7200)).await.unwrap_err();
        assert!(matches!(err, ReservationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_acquire_without_max_ttl_rejects_unrepresentable_expiry() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let manager = ReservationManager::new(Arc::new(MemoryStore::new()), Arc::new(NoopPublisher), clock);
        let err = manager
            .acquire(request("R1", (10, 0), (10, 45), 300_000 * 365 * 86_400))
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent_and_refuses_lapsed_holds() {
        let (manager, clock) = manager();
        let held = manager.acquire(request("R1", (10, 0), (10, 45), 300)).await.unwrap();
        let confirmed = manager.confirm(held.id).await.unwrap();
        assert_eq!(confirmed.status, ReservationStatus::Confirmed);
        assert_eq!(confirmed.expires_at, None);
        assert_eq!(manager.confirm(held.id).await.unwrap().status, ReservationStatus::Confirmed);

        let late = manager.acquire(request("R1", (12, 0), (12, 45), 5)).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));
        assert!(matches!(manager.confirm(late.id).await, Err(ReservationError::Expired(_))));
    }

    #[tokio::test]
    async fn test_cancel_frees_slot_and_is_idempotent() {
        let (manager, _) = manager();
        let held = manager.acquire(request("R1", (10, 0), (10, 45), 300)).await.unwrap();
        manager.confirm(held.id).await.unwrap();

        assert_eq!(manager.cancel(held.id).await.unwrap().status, ReservationStatus::Cancelled);
        assert_eq!(manager.cancel(held.id).await.unwrap().status, ReservationStatus::Cancelled);
        manager.acquire(request("R1", (10, 0), (10, 45), 300)).await.unwrap();

        assert!(matches!(
            manager.cancel(Uuid::new_v4()).await,
            Err(ReservationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_then_reacquire_same_slot() {
        let (manager, clock) = manager();
        let held = manager.acquire(request("R1", (10, 0), (10, 45), 5)).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));

        assert_eq!(manager.sweep_expired(clock.now()).await.unwrap(), 1);
        assert_eq!(manager.get(held.id).await.unwrap().status, ReservationStatus::Expired);
        assert!(matches!(manager.cancel(held.id).await, Err(ReservationError::Expired(_))));

        manager.acquire(request("R1", (10, 0), (10, 45), 300)).await.unwrap();
        assert_eq!(manager.sweep_expired(clock.now()).await.unwrap(), 0);
    }
}
