// Common DTOs and error mapping for the public API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use runloop_core::{RunError, StoreError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Handler error rendered as `{"error": "..."}` with a mapped status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &RunError) -> StatusCode {
    match err {
        RunError::AgentNotFound(_) | RunError::RunNotFound(_) | RunError::ScheduleNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RunError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
        RunError::ScheduleConflict(_) => StatusCode::CONFLICT,
        RunError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(code = err.code().as_str(), error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        RunError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::now_v7();
        assert_eq!(
            ApiError::from(RunError::AgentNotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RunError::RunNotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RunError::invalid_schedule("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RunError::ScheduleConflict(id)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(RunError::ShuttingDown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(StoreError::database("down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
