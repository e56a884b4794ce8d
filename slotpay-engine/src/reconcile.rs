use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use slotpay_core::payment::{PaymentState, PaymentTransaction};
use slotpay_core::repository::{PaymentStore, StoreError};
use slotpay_core::reservation::ReservationStatus;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reservation::{ReservationError, ReservationManager};
use crate::scheduler::ScheduledTask;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub repaired: usize,
    pub flagged: usize,
    /// Transactions that need a human; they are reported again on every pass until fixed.
    pub flagged_transactions: Vec<Uuid>,
}

impl ReconciliationReport {
    fn flag(&mut self, transaction: &PaymentTransaction, reason: &str) {
        error!(
            transaction_id = %transaction.id,
            reservation_id = %transaction.reservation_id,
            state = %transaction.state,
            reason,
            "Payment needs manual reconciliation"
        );
        self.flagged += 1;
        self.flagged_transactions.push(transaction.id);
    }
}

enum Repair {
    Repaired,
    Flagged(&'static str),
    Untouched,
}

/// Audits payments against reservations and repairs the drift a crash between the two leaves.
pub struct Reconciler {
    store: Arc<dyn PaymentStore>,
    reservations: Arc<ReservationManager>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PaymentStore>, reservations: Arc<ReservationManager>) -> Self {
        Self { store, reservations }
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, StoreError> {
        let mut report = ReconciliationReport::default();

        for transaction in self.store.list_in_state(PaymentState::Completed).await? {
            self.settle(self.reconcile_completed(&transaction).await, &transaction, &mut report);
        }
        for state in [PaymentState::Failed, PaymentState::Refunded] {
            for transaction in self.store.list_in_state(state).await? {
                let outcome = self.reconcile_unpaid(&transaction).await;
                self.settle(outcome, &transaction, &mut report);
            }
        }

        info!(
            at = %now,
            repaired = report.repaired,
            flagged = report.flagged,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    fn settle(
        &self,
        outcome: Result<Repair, ReservationError>,
        transaction: &PaymentTransaction,
        report: &mut ReconciliationReport,
    ) {
        match outcome {
            Ok(Repair::Repaired) => report.repaired += 1,
            Ok(Repair::Flagged(reason)) => report.flag(transaction, reason),
            Ok(Repair::Untouched) => {}
            // One unreachable row must not stop the audit; the next pass retries it.
            Err(e) => warn!(transaction_id = %transaction.id, error = %e, "Reconciliation skipped transaction"),
        }
    }

    async fn reconcile_completed(&self, transaction: &PaymentTransaction) -> Result<Repair, ReservationError> {
        if transaction.external_transaction_id.is_none() {
            // Cannot be verified against the gateway without its id.
            return Ok(Repair::Flagged("completed_without_external_id"));
        }

        let reservation = match self.reservations.get(transaction.reservation_id).await {
            Ok(reservation) => reservation,
            Err(ReservationError::NotFound(_)) => return Ok(Repair::Flagged("reservation_missing")),
            Err(e) => return Err(e),
        };

        match reservation.status {
            ReservationStatus::Confirmed => Ok(Repair::Untouched),
            ReservationStatus::Held => match self.reservations.confirm(reservation.id).await {
                Ok(_) => {
                    info!(transaction_id = %transaction.id, reservation_id = %reservation.id, "Confirmed paid reservation");
                    Ok(Repair::Repaired)
                }
                Err(ReservationError::Expired(_)) => Ok(Repair::Flagged("paid_after_hold_released")),
                Err(e) => Err(e),
            },
            ReservationStatus::Expired | ReservationStatus::Cancelled => Ok(Repair::Flagged("paid_for_released_slot")),
        }
    }

    /// Releases a hold whose only payment failed or was refunded.
    async fn reconcile_unpaid(&self, transaction: &PaymentTransaction) -> Result<Repair, ReservationError> {
        let reservation = match self.reservations.get(transaction.reservation_id).await {
            Ok(reservation) => reservation,
            Err(ReservationError::NotFound(_)) => return Ok(Repair::Untouched),
            Err(e) => return Err(e),
        };
        let releasable = match transaction.state {
            PaymentState::Refunded => reservation.status.is_active(),
            _ => reservation.status == ReservationStatus::Held,
        };
        if !releasable {
            return Ok(Repair::Untouched);
        }

        // A retry with a fresh idempotency key may still be paying for the same hold.
        let siblings = self.store.list_for_reservation(reservation.id).await?;
        if siblings
            .iter()
            .any(|tx| tx.id != transaction.id && !matches!(tx.state, PaymentState::Failed | PaymentState::Refunded))
        {
            return Ok(Repair::Untouched);
        }

        match self.reservations.cancel(reservation.id).await {
            Ok(_) => {
                info!(transaction_id = %transaction.id, reservation_id = %reservation.id, "Released unpaid reservation");
                Ok(Repair::Repaired)
            }
            Err(ReservationError::Expired(_)) => Ok(Repair::Untouched),
            Err(e) => Err(e),
        }
    }
}

/// Periodic driver for [`Reconciler`].
pub struct ReconciliationTask {
    reconciler: Arc<Reconciler>,
}

impl ReconciliationTask {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl ScheduledTask for ReconciliationTask {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let report = self.reconciler.reconcile(now).await?;
        Ok(format!("repaired {}, flagged {}", report.repaired, report.flagged))
    }
}
