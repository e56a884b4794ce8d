use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotpay_core::reservation::{Reservation, ReservationStatus, Resource, ResourceKind, Slot};
use slotpay_engine::AcquireRequest;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub tenant_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_kind: ResourceKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub holder_id: String,
    /// Falls back to the configured default hold.
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ReservationCreated {
    pub reservation_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReservationCancelled {
    pub reservation_id: Uuid,
    pub status: ReservationStatus,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/reservations", post(create_reservation))
        .route("/v1/reservations/{id}", get(get_reservation))
        .route("/v1/reservations/{id}/cancel", post(cancel_reservation))
}

/// POST /v1/reservations
async fn create_reservation(
    State(state): State<AppState>,
    Json(req): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<ReservationCreated>), AppError> {
    if req.tenant_id.trim().is_empty() || req.resource_id.trim().is_empty() {
        return Err(AppError::ValidationError("tenant_id and resource_id are required".to_string()));
    }
    let slot = Slot::new(req.start, req.end).map_err(|e| AppError::ValidationError(e.to_string()))?;
    let ttl = req
        .ttl_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.settings.default_hold);

    let reservation = state
        .reservations
        .acquire(AcquireRequest {
            resource: Resource::new(req.tenant_id, req.resource_id, req.resource_kind),
            slot,
            holder_id: req.holder_id,
            ttl,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ReservationCreated {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
        }),
    ))
}

/// GET /v1/reservations/{id}
async fn get_reservation(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.reservations.get(id).await?))
}

/// POST /v1/reservations/{id}/cancel
async fn cancel_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReservationCancelled>, AppError> {
    let reservation = state.reservations.cancel(id).await?;
    Ok(Json(ReservationCancelled {
        reservation_id: reservation.id,
        status: reservation.status,
    }))
}
