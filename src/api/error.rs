//! Mapping from workflow errors to HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::error::{DatabaseError, WorkflowError};

/// Error returned by HTTP handlers. Internal details stay in the logs.
#[derive(Debug)]
pub struct ApiError(pub WorkflowError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(WorkflowError::Validation(message.into()))
    }

    /// Status code and client-safe message.
    pub fn parts(&self) -> (StatusCode, String) {
        match &self.0 {
            WorkflowError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            WorkflowError::NotFound(id) => (StatusCode::NOT_FOUND, format!("{id} not found")),
            WorkflowError::ExternalService { .. }
            | WorkflowError::InvalidTransition { .. }
            | WorkflowError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        Self(e)
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self(WorkflowError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.parts();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
