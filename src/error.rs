use crate::types::ApiResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

/// Application-specific error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database connection failed")]
    DatabaseConnection,

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Purchase not found: {0}")]
    PurchaseNotFound(String),

    #[error("Invalid switch: {0}")]
    InvalidSwitch(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment declined: {0}")]
    GatewayDeclined(String),

    #[error("Conflicting transition: {0}")]
    ConflictingTransition(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Failed to parse gateway response: {0}")]
    GatewayResponseParse(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the appropriate HTTP status code for this error
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::DatabaseConnection
            | AppError::DatabaseOperation(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,

            AppError::PlanNotFound(_) | AppError::PurchaseNotFound(_) => StatusCode::NOT_FOUND,

            AppError::InvalidSwitch(_)
            | AppError::BadRequest(_)
            | AppError::GatewayResponseParse(_) => StatusCode::BAD_REQUEST,

            AppError::GatewayDeclined(_) => StatusCode::PAYMENT_REQUIRED,

            AppError::ConflictingTransition(_) => StatusCode::CONFLICT,

            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,

            AppError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

            AppError::NetworkError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code();
        let response_body = ApiResponse::<()>::error(self.to_string());

        (status_code, Json(response_body)).into_response()
    }
}

/// Result type for application operations
pub type AppResult<T> = Result<T, AppError>;

// Conversion implementations for common error types
impl From<diesel::result::Error> for AppError {
    fn from(err: diesel::result::Error) -> Self {
        AppError::DatabaseOperation(err.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for AppError {
    fn from(_: diesel::r2d2::PoolError) -> Self {
        AppError::DatabaseConnection
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            AppError::NetworkError(err.to_string())
        } else {
            AppError::GatewayResponseParse(err.to_string())
        }
    }
}
