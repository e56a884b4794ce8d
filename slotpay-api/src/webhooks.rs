use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use slotpay_core::webhook::SIGNATURE_HEADER;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(receive_payment_event))
}

/// POST /v1/webhooks/payments
/// Takes the raw body: the signature covers the exact bytes the gateway sent.
async fn receive_payment_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());
    let outcome = state.webhooks.process_event(&body, signature).await?;
    Ok(Json(json!({ "status": outcome.as_str() })))
}
