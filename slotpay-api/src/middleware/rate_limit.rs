use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use slotpay_core::rate_limit::rate_limit_key;
use slotpay_engine::RateLimitError;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::AppError;
use crate::state::AppState;

/// Fixed-window limit per client IP and route for state-changing calls. Reads pass untouched.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if req.method() == Method::GET {
        return Ok(next.run(req).await);
    }

    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let action = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let key = rate_limit_key(&ip, &action);

    let policy = &state.settings.rate_limit;
    match state
        .rate_limiter
        .allow(&key, policy.limit, Duration::from_secs(policy.window_seconds))
        .await
    {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => {
            tracing::info!(%key, "Rate limit exceeded");
            Err(AppError::TooManyRequests)
        }
        Err(e @ RateLimitError::LimiterUnavailable(_)) if policy.fail_open => {
            tracing::warn!(error = %e, "Rate limiter down, letting request through");
            Ok(next.run(req).await)
        }
        Err(e) => Err(e.into()),
    }
}
