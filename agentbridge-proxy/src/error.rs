//! Error types for the admin and REST HTTP surfaces.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use agentbridge_core::BridgeError;

/// Errors returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// No registration under this name (404)
    #[error("registration '{name}' not found")]
    NotFound { name: String },

    /// Registration already exists (409)
    #[error("registration '{name}' already exists")]
    Conflict { name: String },

    /// Nothing of the REST kind is listed under this name (400)
    #[error("no REST agent named '{name}'")]
    UnknownAgent { name: String },

    /// Request body is not usable (400)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Shutdown in progress (503)
    #[error("service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ProxyError {
    /// HTTP status and stable error label for this error.
    pub fn status_and_label(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            Self::UnknownAgent { .. } => (StatusCode::BAD_REQUEST, "unknown_agent"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Self::Bridge(e @ BridgeError::InvalidRegistration { .. }) => {
                (StatusCode::BAD_REQUEST, e.error_type_name())
            }
            Self::Bridge(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.error_type_name()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, label) = self.status_and_label();
        (
            status,
            Json(json!({ "error": label, "message": self.to_string() })),
        )
            .into_response()
    }
}

/// Result type alias for HTTP handlers.
pub type ProxyResult<T> = Result<T, ProxyError>;
