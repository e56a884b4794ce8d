use axum::{
    http::Method,
    middleware::from_fn_with_state,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod cron;
pub mod error;
pub mod middleware;
pub mod payments;
pub mod reservations;
pub mod state;
pub mod webhooks;

pub use state::{AppState, Backends};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let public = Router::new()
        .merge(reservations::routes())
        .merge(payments::routes())
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit));

    let internal = cron::routes().route_layer(from_fn_with_state(state.clone(), middleware::require_cron_secret));

    Router::new()
        .route("/health", get(health))
        .merge(public)
        .merge(webhooks::routes())
        .merge(internal)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
