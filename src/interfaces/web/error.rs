use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::core::error::RunError;

/// Error response with a `{error, details}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            details: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        let (status, label) = match &err {
            RunError::Validation { .. } => (StatusCode::BAD_REQUEST, "Invalid message"),
            RunError::ToolNotFound { .. } => (StatusCode::BAD_REQUEST, "Tool not found"),
            RunError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            _ => {
                error!("Request failed: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        ApiError::new(status, label).with_details(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request("Invalid request body").with_details(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.error,
            "details": self.details,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::RunStatus;

    #[test]
    fn run_errors_map_to_status_codes() {
        let cases = [
            (
                RunError::Validation {
                    index: 0,
                    reason: "bad".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                RunError::ToolNotFound {
                    name: "x".to_string(),
                    available: vec![],
                },
                StatusCode::BAD_REQUEST,
            ),
            (RunError::run_not_found("3"), StatusCode::NOT_FOUND),
            (
                RunError::InvalidTransition {
                    from: RunStatus::Done,
                    to: RunStatus::Running,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (RunError::AgentUnavailable, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
