//! Shared error types.

use thiserror::Error;

use crate::models::ApiResponse;

/// A realtime frame that could not be turned into an [`Event`](crate::Event).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown event type: {0}")]
    UnknownType(String),
}

/// API error type for client-side use
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    /// The server answered with `success: false`.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Pull a user-facing reason out of a failed response envelope.
/// Prefers `error`, falls back to `message`.
pub fn rejection_reason<T>(resp: &ApiResponse<T>) -> String {
    resp.error
        .as_deref()
        .or(resp.message.as_deref())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("request failed")
        .to_string()
}
