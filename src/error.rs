//! Error types for the proxy.
//!
//! Structural input errors abort the whole request with a 4xx; per-type
//! forwarding errors are collected during fan-out and reported together
//! as an aggregate 500, never individually.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors produced while routing and forwarding inference requests.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The `entries` form field is missing, not JSON, or structurally wrong.
    #[error("invalid entries: {0}")]
    MalformedEntries(String),

    /// The `entries` object decoded to zero entries.
    #[error("no entries specified")]
    EmptyEntries,

    /// A config replace failed validation.
    #[error("{0}")]
    InvalidConfig(String),

    /// Neither a routing-table entry nor a default backend resolves for a type.
    #[error("no backend configured for type: {0}")]
    NoBackendForType(String),

    /// Transport-level failure talking to a backend.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Backend answered with a non-200 status.
    #[error("backend returned status {status}: {body}")]
    BackendError { status: u16, body: String },

    /// Backend answered 200 but the body was not a JSON object.
    #[error("invalid backend response: {0}")]
    InvalidBackendResponse(String),

    /// Writing the configuration to durable storage failed.
    #[error("failed to persist configuration: {0}")]
    Persistence(String),
}

impl ProxyError {
    /// HTTP status this error maps to when it surfaces on its own.
    ///
    /// Per-type variants only ever appear inside the aggregate fan-out
    /// error list, but they still carry a sensible default here.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedEntries(_)
            | ProxyError::EmptyEntries
            | ProxyError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoBackendForType(_)
            | ProxyError::BackendUnreachable(_)
            | ProxyError::BackendError { .. }
            | ProxyError::InvalidBackendResponse(_)
            | ProxyError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
