use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Gone(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("{}\n", self)).into_response()
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(e: diesel::result::Error) -> Self {
        warn!("Failed to execute DB query: {}", e);
        ApiError::Internal("database error".to_string())
    }
}

impl From<openssl::error::ErrorStack> for ApiError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        warn!("OpenSSL operation failed: {}", e);
        ApiError::Internal("crypto error".to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        warn!("I/O operation failed: {}", e);
        ApiError::Internal(format!("i/o error: {}", e))
    }
}
