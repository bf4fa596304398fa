use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Failure kinds of the release core (engine, resolver, repositories).
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage failure: {0}")]
    StorageFailure(#[source] anyhow::Error),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ReleaseError {
    pub fn not_found(what: impl Into<String>) -> Self { Self::NotFound(what.into()) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::Conflict(msg.into()) }
    pub fn invalid_state(msg: impl Into<String>) -> Self { Self::InvalidState(msg.into()) }
    pub fn storage<E: Into<anyhow::Error>>(err: E) -> Self { Self::StorageFailure(err.into()) }
}

pub type ReleaseResult<T> = Result<T, ReleaseError>;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody { pub code: &'static str, pub message: String }

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }
    pub fn service_unavailable() -> Self { Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", "Required dependency not ready") }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, "not_found", msg) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::new(StatusCode::CONFLICT, "conflict", msg) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg) }
    pub fn bad_request(msg: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, "bad_request", msg) }
    pub fn unauthorized(msg: impl Into<String>) -> Self { Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg) }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl From<ReleaseError> for ApiError {
    fn from(err: ReleaseError) -> Self {
        match err {
            ReleaseError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
            ReleaseError::Conflict(msg) => ApiError::conflict(msg),
            ReleaseError::InvalidState(msg) => ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_state", msg),
            ReleaseError::StorageFailure(e) => {
                tracing::error!(error=%e, "storage_failure");
                ApiError::new(StatusCode::BAD_GATEWAY, "storage_failure", "blob storage unavailable")
            }
            ReleaseError::PermissionDenied(msg) => ApiError::new(StatusCode::FORBIDDEN, "forbidden", msg),
            ReleaseError::Database(e) => {
                tracing::error!(error=%e, "database_failure");
                ApiError::internal("database error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_errors_map_to_status_codes() {
        assert_eq!(ApiError::from(ReleaseError::not_found("deployment")).status, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(ReleaseError::conflict("dupe")).status, StatusCode::CONFLICT);
        let e = ApiError::from(ReleaseError::invalid_state("no previous package"));
        assert_eq!(e.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(e.code, "invalid_state");
        let e = ApiError::from(ReleaseError::storage(anyhow::anyhow!("disk full")));
        assert_eq!(e.code, "storage_failure");
        assert_eq!(ApiError::from(ReleaseError::PermissionDenied("owner only".into())).status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let e = ApiError::from(ReleaseError::not_found("deployment"));
        assert_eq!(e.message, "deployment not found");
    }
}
