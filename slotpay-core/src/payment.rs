use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::reservation::Reservation;
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Authorized,
    Completed,
    Failed,
    Refunded,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Authorized => "authorized",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
            PaymentState::Refunded => "refunded",
        }
    }

    /// Forward edges of the payment state machine. Self-loops are not transitions.
    pub fn can_transition_to(&self, next: PaymentState) -> bool {
        use PaymentState::*;
        matches!(
            (self, next),
            (Pending, Authorized)
                | (Pending, Completed)
                | (Authorized, Completed)
                | (Pending, Failed)
                | (Authorized, Failed)
                | (Completed, Refunded)
        )
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentState::Pending),
            "authorized" => Ok(PaymentState::Authorized),
            "completed" => Ok(PaymentState::Completed),
            "failed" => Ok(PaymentState::Failed),
            "refunded" => Ok(PaymentState::Refunded),
            other => Err(CoreError::ValidationError(format!("unknown payment state: {other}"))),
        }
    }
}

/// Maps a gateway's status vocabulary onto local states. Case-insensitive.
pub fn map_gateway_state(raw: &str) -> Option<PaymentState> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "success" | "succeeded" | "completed" | "settled" | "transmitted" | "paid" => Some(PaymentState::Completed),
        "authorized" | "authorised" => Some(PaymentState::Authorized),
        "failed" | "failure" | "declined" | "cancelled" | "canceled" | "expired" | "error" => Some(PaymentState::Failed),
        "refunded" => Some(PaymentState::Refunded),
        "pending" | "initialized" | "created" | "processing" => Some(PaymentState::Pending),
        _ => None,
    }
}

/// Upper-cases and checks an ISO-4217 style code.
pub fn normalize_currency(raw: &str) -> CoreResult<String> {
    let code = raw.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CoreError::ValidationError(format!("invalid currency code: {raw}")));
    }
    Ok(code.to_ascii_uppercase())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub tenant_id: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub gateway: String,
    /// Assigned by the gateway; never changes once set.
    pub external_transaction_id: Option<String>,
    pub idempotency_key: String,
    pub state: PaymentState,
    pub last_event_id: Option<String>,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn pending(
        reservation: &Reservation,
        amount: i64,
        currency: String,
        gateway: String,
        idempotency_key: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reservation_id: reservation.id,
            tenant_id: reservation.tenant_id.clone(),
            amount,
            currency,
            gateway,
            external_transaction_id: None,
            idempotency_key,
            state: PaymentState::Pending,
            last_event_id: None,
            redirect_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    /// Echoed back by the gateway on webhook deliveries as `reference`.
    pub transaction_id: Uuid,
    pub reservation_id: Uuid,
    pub tenant_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewaySession {
    pub session_id: String,
    pub redirect_url: String,
    #[serde(default)]
    pub external_transaction_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Timeouts, connection resets, 5xx. Safe to retry.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Open a hosted payment session for a pending transaction.
    async fn create_session(&self, request: &SessionRequest) -> Result<GatewaySession, GatewayError>;
}

/// Gateway that never leaves the process; redirects point at a configurable checkout page.
pub struct MockPaymentGateway {
    name: String,
    redirect_base_url: String,
}

impl MockPaymentGateway {
    pub fn new(name: impl Into<String>, redirect_base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            redirect_base_url: redirect_base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_session(&self, request: &SessionRequest) -> Result<GatewaySession, GatewayError> {
        let session_id = format!("mock_cs_{}", request.transaction_id.simple());
        Ok(GatewaySession {
            redirect_url: format!("{}/{}", self.redirect_base_url.trim_end_matches('/'), session_id),
            session_id,
            external_transaction_id: None,
        })
    }
}
