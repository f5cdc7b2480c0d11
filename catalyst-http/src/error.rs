use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[must_use]
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[must_use]
    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Maps the core's sentinel error kinds to the status codes fixed by
/// SPEC_FULL.md 7/6. Several of these never reach the edge directly — they
/// are consumed by the 4.H retry loop — but are handled here too so any
/// caller that bypasses the loop still gets a sane response.
impl From<catalyst_core::Error> for AppError {
    fn from(err: catalyst_core::Error) -> Self {
        use catalyst_core::Error;
        match err {
            Error::InvalidRequest(msg) => Self::not_found(msg),
            Error::SelectorFailed(msg) => Self::bad_gateway(msg),
            Error::NoOrigin => Self::not_found("no origin for stream"),
            Error::LockDenied(stream) => Self::new(StatusCode::SERVICE_UNAVAILABLE, format!("lease denied for {stream}")),
            Error::WrongRegion { .. } => Self::new(StatusCode::SERVICE_UNAVAILABLE, "wrong region, retry"),
            Error::RateLimited { retry_after_secs } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                format!("rate limited, retry in {retry_after_secs}s"),
            ),
            Error::DirectoryUnavailable(msg) => {
                tracing::error!("stream directory unavailable: {}", msg);
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "stream directory unavailable")
            }
            Error::StreamSuspended => Self::new(StatusCode::FORBIDDEN, "stream suspended"),
            Error::StreamDeleted => Self::not_found("stream deleted"),
            Error::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                Self::internal("internal server error")
            }
            Error::Redis(e) => {
                tracing::error!("redis error: {}", e);
                Self::internal("service temporarily unavailable")
            }
            Error::Http(e) => {
                tracing::error!("http client error: {}", e);
                Self::bad_gateway("upstream request failed")
            }
            Error::Serialization(e) => {
                tracing::error!("serialization error: {}", e);
                Self::internal("data processing error")
            }
            Error::Configuration(msg) => {
                tracing::error!("configuration error: {}", msg);
                Self::internal("internal server error")
            }
        }
    }
}
