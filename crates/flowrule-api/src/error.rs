//! API error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flowrule_automation::AutomationError;
use flowrule_workflow::WorkflowError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Automation(#[from] AutomationError),
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError::Automation(AutomationError::Workflow(err))
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Automation(e) => e.error_code(),
        }
    }

    /// HTTP status for this error, derived from its stable code.
    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            "BAD_REQUEST" | "VALIDATION_ERROR" | "SERIALIZATION_ERROR" => StatusCode::BAD_REQUEST,
            "NOT_AUTHORIZED_MOVER" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "PRECONDITION_FAILED" => StatusCode::PRECONDITION_FAILED,
            "ILLEGAL_STATE_TRANSITION" | "VERSION_CONFLICT" => StatusCode::CONFLICT,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            "TRANSIENT_IO_FAILURE" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
