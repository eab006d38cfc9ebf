//! Engine error taxonomy.

use storyweave_shared::ApiError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A send was attempted while the transport is down.
    #[error("not connected: cannot send '{event}'")]
    NotConnected { event: String },
    /// A stream start arrived while another stream is still open.
    #[error("stream '{rejected}' rejected while stream '{open}' is open")]
    DuplicateStream { open: String, rejected: String },
    /// A chunk or close referenced a stream that is not the open one.
    #[error("no open stream matches '{0}'")]
    UnknownStream(String),
    /// The transport dropped mid-stream; the partial content was kept.
    #[error("stream '{stream_id}' interrupted after {buffered} bytes")]
    StreamInterrupted { stream_id: String, buffered: usize },
    /// A user turn was attempted before the session restore landed.
    #[error("session is still being restored")]
    Restoring,
    #[error("malformed '{event}' payload: {reason}")]
    MalformedPayload { event: String, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The server reported a failure for a dialogue turn.
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
