use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::state::AppState;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Guards the internal cron triggers with the shared secret the external scheduler sends.
pub async fn require_cron_secret(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = req
        .headers()
        .get(CRON_SECRET_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if !state.settings.cron_secret.matches(provided) {
        tracing::warn!(path = %req.uri().path(), "Cron trigger rejected");
        return Err(AppError::AuthenticationError("Invalid cron secret".to_string()));
    }

    Ok(next.run(req).await)
}
