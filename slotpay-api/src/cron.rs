use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use slotpay_core::Clock;
use slotpay_engine::ReconciliationReport;

use crate::error::AppError;
use crate::state::AppState;

/// Triggers for an external scheduler. Same operations the in-process scheduled tasks run.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/internal/cron/sweep", post(sweep))
        .route("/internal/cron/reconcile", post(reconcile))
}

async fn sweep(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let reclaimed = state.sweeper.sweep(state.clock.now()).await?;
    Ok(Json(json!({ "reclaimed": reclaimed })))
}

async fn reconcile(State(state): State<AppState>) -> Result<Json<ReconciliationReport>, AppError> {
    Ok(Json(state.reconciler.reconcile(state.clock.now()).await?))
}
