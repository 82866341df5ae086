//! Error types shared by the defense components.
//!
//! A blocked or flagged request is a decision, never an error. Errors are
//! reserved for caller mistakes (unknown ids, terminal-state transitions) and
//! for misconfiguration, which is rejected when a component is constructed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::config::validation::ValidationError;

/// Errors returned by the defense components.
#[derive(Debug, Error)]
pub enum ShieldError {
    /// Operation on an unknown identity, session, incident or block.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The target already reached a terminal state (e.g. a resolved incident).
    #[error("{kind} {id} is already in a terminal state")]
    AlreadyInTerminalState { kind: &'static str, id: String },

    /// A caller-supplied value is out of range.
    #[error("invalid {field}: {message}")]
    InvalidArgument { field: &'static str, message: String },

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ValidationError>),
}

impl ShieldError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn terminal(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyInTerminalState { kind, id: id.into() }
    }

    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            message: message.into(),
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for defense operations.
pub type ShieldResult<T> = Result<T, ShieldError>;

impl IntoResponse for ShieldError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ShieldError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ShieldError::AlreadyInTerminalState { .. } => (StatusCode::CONFLICT, "conflict"),
            ShieldError::InvalidArgument { .. } => (StatusCode::BAD_REQUEST, "invalid_argument"),
            ShieldError::InvalidConfig(_) => (StatusCode::INTERNAL_SERVER_ERROR, "invalid_config"),
        };
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
