use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use slotpay_core::payment::{PaymentState, PaymentTransaction};
use slotpay_engine::CreateSession;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub reservation_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub transaction_id: Uuid,
    pub redirect_url: String,
    pub state: PaymentState,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments/sessions", post(create_session))
        .route("/v1/payments/{id}", get(get_payment))
}

/// POST /v1/payments/sessions
/// Replays with the same idempotency key return the original session.
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreated>), AppError> {
    let session = state
        .payments
        .create_session(CreateSession {
            reservation_id: req.reservation_id,
            amount: req.amount,
            currency: req.currency,
            idempotency_key: req.idempotency_key,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            transaction_id: session.transaction.id,
            redirect_url: session.redirect_url,
            state: session.transaction.state,
        }),
    ))
}

/// GET /v1/payments/{id}
async fn get_payment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.payments.get(id).await?))
}
