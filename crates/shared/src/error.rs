//! REST error type for client-side use.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    /// The server answered with `status: "error"`.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    status: Option<String>,
    message: Option<String>,
}

/// Attempt to pull a user-facing message out of a `{status: "error", message}`
/// body. Returns `None` for anything else.
pub fn try_error_message(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    if parsed.status.as_deref() != Some("error") {
        return None;
    }
    parsed.message.filter(|m| !m.trim().is_empty())
}
