use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use slotpay_core::payment::GatewayError;
use slotpay_core::StoreError;
use slotpay_engine::{PaymentError, RateLimitError, ReservationError, WebhookError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    AuthenticationError(String),
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    ConflictError(String),
    #[error("{0}")]
    UnprocessableError(String),
    #[error("Rate limit exceeded")]
    TooManyRequests,
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnprocessableError(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded".to_string()),
            AppError::BadGateway(msg) => {
                tracing::warn!("Upstream rejected request: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Dependency unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable, retry later".to_string())
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict | StoreError::Duplicate(_) => AppError::ConflictError(err.to_string()),
            StoreError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            StoreError::Unavailable(_) => AppError::ServiceUnavailable(err.to_string()),
            StoreError::Corrupt(_) => AppError::InternalServerError(err.to_string()),
        }
    }
}

impl From<ReservationError> for AppError {
    fn from(err: ReservationError) -> Self {
        match err {
            ReservationError::Conflict { .. } | ReservationError::Expired(_) => AppError::ConflictError(err.to_string()),
            ReservationError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            ReservationError::Validation(_) => AppError::ValidationError(err.to_string()),
            ReservationError::Store(e) => e.into(),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::ReservationNotHeld(_) | PaymentError::PaymentInProgress(_) => {
                AppError::ConflictError(err.to_string())
            }
            PaymentError::ReservationNotFound(_) | PaymentError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            PaymentError::Validation(_) => AppError::ValidationError(err.to_string()),
            PaymentError::Gateway(GatewayError::Unavailable(msg)) => AppError::ServiceUnavailable(msg),
            PaymentError::Gateway(GatewayError::Rejected(msg)) => AppError::BadGateway(msg),
            PaymentError::Store(e) => e.into(),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Unauthorized => AppError::AuthenticationError(err.to_string()),
            WebhookError::Malformed(_) => AppError::ValidationError(err.to_string()),
            WebhookError::UnknownState(_) | WebhookError::ExternalIdMismatch(_) => {
                AppError::UnprocessableError(err.to_string())
            }
            WebhookError::TransactionNotFound { .. } => AppError::NotFoundError(err.to_string()),
            // The gateway redelivers on any 5xx.
            WebhookError::Store(e) => AppError::InternalServerError(e.to_string()),
        }
    }
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::LimiterUnavailable(_) => AppError::ServiceUnavailable(err.to_string()),
            RateLimitError::InvalidPolicy(_) => AppError::InternalServerError(err.to_string()),
        }
    }
}
