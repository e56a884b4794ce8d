use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotpay_core::payment::{PaymentState, PaymentTransaction};
use slotpay_core::repository::{
    ApplyOutcome, EventApplication, PaymentStore, ReservationStore, StoreError, StoreResult,
};
use slotpay_core::reservation::{Reservation, ResourceKind, Slot};
use slotpay_core::webhook::LedgerKey;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const EXCLUSION_VIOLATION: &str = "23P01";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

fn map_db_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(EXCLUSION_VIOLATION) => return StoreError::Conflict,
            Some(UNIQUE_VIOLATION) => return StoreError::Duplicate(db.message().to_string()),
            _ => {}
        }
    }
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(err.to_string())
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Postgres-backed store. Overlap exclusion, idempotency keys and the webhook ledger are all
/// enforced by constraints declared in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: &DbClient) -> Self {
        Self { pool: db.pool.clone() }
    }
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: Uuid,
    tenant_id: String,
    resource_id: String,
    resource_kind: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    holder_id: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: row.id,
            tenant_id: row.tenant_id,
            resource_id: row.resource_id,
            resource_kind: row
                .resource_kind
                .parse::<ResourceKind>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            slot: Slot {
                start: row.starts_at,
                end: row.ends_at,
            },
            holder_id: row.holder_id,
            status: row.status.parse().map_err(|e: slotpay_core::CoreError| StoreError::Corrupt(e.to_string()))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    reservation_id: Uuid,
    tenant_id: String,
    amount: i64,
    currency: String,
    gateway: String,
    external_transaction_id: Option<String>,
    idempotency_key: String,
    state: String,
    last_event_id: Option<String>,
    redirect_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(PaymentTransaction {
            id: row.id,
            reservation_id: row.reservation_id,
            tenant_id: row.tenant_id,
            amount: row.amount,
            currency: row.currency,
            gateway: row.gateway,
            external_transaction_id: row.external_transaction_id,
            idempotency_key: row.idempotency_key,
            state: row.state.parse().map_err(|e: slotpay_core::CoreError| StoreError::Corrupt(e.to_string()))?,
            last_event_id: row.last_event_id,
            redirect_url: row.redirect_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const RESERVATION_COLUMNS: &str = "id, tenant_id, resource_id, resource_kind, starts_at, ends_at, holder_id, status, created_at, updated_at, expires_at";
const TRANSACTION_COLUMNS: &str = "id, reservation_id, tenant_id, amount, currency, gateway, external_transaction_id, idempotency_key, state, last_event_id, redirect_url, created_at, updated_at";

fn into_reservations(rows: Vec<ReservationRow>) -> StoreResult<Vec<Reservation>> {
    rows.into_iter().map(Reservation::try_from).collect()
}

#[async_trait]
impl ReservationStore for PgStore {
    async fn insert_if_free(&self, reservation: Reservation) -> StoreResult<Reservation> {
        // `reservations_no_overlap` rejects the row atomically with 23P01.
        let row: ReservationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO reservations (id, tenant_id, resource_id, resource_kind, starts_at, ends_at, holder_id, status, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(reservation.id)
        .bind(&reservation.tenant_id)
        .bind(&reservation.resource_id)
        .bind(reservation.resource_kind.as_str())
        .bind(reservation.slot.start)
        .bind(reservation.slot.end)
        .bind(&reservation.holder_id)
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .bind(reservation.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.try_into()
    }

    async fn get_reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        let row: Option<ReservationRow> =
            sqlx::query_as(&format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;

        row.map(Reservation::try_from).transpose()
    }

    async fn confirm_if_held(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Reservation>> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE reservations
            SET status = 'confirmed', expires_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'held' AND expires_at >= $2
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(Reservation::try_from).transpose()
    }

    async fn cancel_if_active(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Reservation>> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE reservations
            SET status = 'cancelled', expires_at = NULL, updated_at = $2
            WHERE id = $1 AND status IN ('held', 'confirmed')
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(Reservation::try_from).transpose()
    }

    async fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<Vec<Reservation>> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE reservations
            SET status = 'expired', expires_at = NULL, updated_at = $1
            WHERE status = 'held' AND expires_at < $1
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        into_reservations(rows)
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn insert_transaction(&self, transaction: PaymentTransaction) -> StoreResult<PaymentTransaction> {
        let row: TransactionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_transactions (id, reservation_id, tenant_id, amount, currency, gateway, external_transaction_id, idempotency_key, state, last_event_id, redirect_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(transaction.id)
        .bind(transaction.reservation_id)
        .bind(&transaction.tenant_id)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.gateway)
        .bind(&transaction.external_transaction_id)
        .bind(&transaction.idempotency_key)
        .bind(transaction.state.as_str())
        .bind(&transaction.last_event_id)
        .bind(&transaction.redirect_url)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.try_into()
    }

    async fn get_transaction(&self, id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        let row: Option<TransactionRow> =
            sqlx::query_as(&format!("SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;

        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, tenant_id: &str, key: &str) -> StoreResult<Option<PaymentTransaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn find_by_external_id(&self, gateway: &str, external_id: &str) -> StoreResult<Option<PaymentTransaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE gateway = $1 AND external_transaction_id = $2"
        ))
        .bind(gateway)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn list_for_reservation(&self, reservation_id: Uuid) -> StoreResult<Vec<PaymentTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE reservation_id = $1 ORDER BY created_at"
        ))
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }

    async fn attach_session(
        &self,
        id: Uuid,
        redirect_url: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<PaymentTransaction> {
        // COALESCE keeps an already assigned external id untouched.
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_transactions
            SET redirect_url = $2,
                external_transaction_id = COALESCE(external_transaction_id, $3),
                updated_at = $4
            WHERE id = $1
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(redirect_url)
        .bind(external_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.ok_or_else(|| StoreError::NotFound(format!("payment transaction {id}")))?
            .try_into()
    }

    async fn is_processed(&self, key: &LedgerKey) -> StoreResult<bool> {
        let processed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM webhook_events WHERE gateway = $1 AND external_transaction_id = $2 AND event_id = $3)",
        )
        .bind(&key.gateway)
        .bind(&key.external_transaction_id)
        .bind(&key.event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(processed)
    }

    async fn apply_event(&self, application: EventApplication) -> StoreResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        // The primary key on the ledger makes a concurrent twin either wait or skip.
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (gateway, external_transaction_id, event_id, transaction_id, reported_state, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (gateway, external_transaction_id, event_id) DO NOTHING
            "#,
        )
        .bind(&application.key.gateway)
        .bind(&application.key.external_transaction_id)
        .bind(&application.key.event_id)
        .bind(application.transaction_id)
        .bind(application.target.as_str())
        .bind(application.now)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(map_db_err)?;
            return Ok(ApplyOutcome::Duplicate);
        }

        let current: TransactionRow = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(application.transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("payment transaction {}", application.transaction_id)))?;
        let current = PaymentTransaction::try_from(current)?;

        let external_id = &application.key.external_transaction_id;
        if let Some(existing) = &current.external_transaction_id {
            if existing != external_id {
                return Err(StoreError::Corrupt(format!(
                    "transaction {} already bound to external id {existing}",
                    current.id
                )));
            }
        }
        let assign = current.external_transaction_id.is_none() && application.assign_external_id;

        let previous = current.state;
        let transitioned = previous.can_transition_to(application.target);
        let next_state = if transitioned { application.target } else { previous };

        let row: TransactionRow = sqlx::query_as(&format!(
            r#"
            UPDATE payment_transactions
            SET state = $2,
                last_event_id = $3,
                external_transaction_id = CASE WHEN $4 THEN $5 ELSE external_transaction_id END,
                updated_at = $6
            WHERE id = $1
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(application.transaction_id)
        .bind(next_state.as_str())
        .bind(&application.key.event_id)
        .bind(assign)
        .bind(external_id)
        .bind(application.now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;

        Ok(ApplyOutcome::Applied {
            transaction: row.try_into()?,
            previous,
            transitioned,
        })
    }

    async fn list_in_state(&self, state: PaymentState) -> StoreResult<Vec<PaymentTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE state = $1 ORDER BY created_at"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }
}
