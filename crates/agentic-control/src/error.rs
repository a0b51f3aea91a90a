use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Failures surfaced to the caller. Background process failures never end
/// up here; they are recorded in the state document instead.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("{message}")]
    Precondition { message: String, hint: String },
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl ApiError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } | ApiError::UnknownAction(_) => StatusCode::BAD_REQUEST,
            ApiError::Precondition { .. } | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation",
            ApiError::UnknownAction(_) => "unknown_action",
            ApiError::Precondition { .. } => "precondition",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        ApiError::validation("body", format!("Invalid JSON body: {}", value.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        let (field, hint) = match &self {
            ApiError::Validation { field, .. } => (Some(*field), None),
            ApiError::Precondition { hint, .. } => (None, Some(hint.clone())),
            _ => (None, None),
        };
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
            field,
            hint,
        };
        (status, Json(body)).into_response()
    }
}
