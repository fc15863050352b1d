use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use queue_core::Rejection;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the control API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Message rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Cache error: {0}")]
    Cache(#[from] cache_core::CacheError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::Rejected(_) => StatusCode::BAD_REQUEST,
            ApiError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::InvalidInput(msg) | ApiError::NotFound(msg) => msg,
            ApiError::Rejected(rejection) => rejection.to_string(),
            ApiError::Cache(e) => {
                tracing::error!("Cache error: {}", e);
                format!("Cache error: {}", e)
            }
        };

        let body = Json(ErrorResponse {
            error,
            code: status.as_u16(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(Rejection::MissingVoicePrefix).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("seq 9".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert_eq!(
            ApiError::from(cache_core::CacheError::from(io)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
