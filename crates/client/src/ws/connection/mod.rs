//! Connection state, reconnect policy and the transport seam.
//!
//! A [`Transport`] opens one link at a time. The link is a pair of channels:
//! envelopes pushed into `outgoing` are written to the socket, frames read from
//! the socket come out of `incoming`. The link is gone when `incoming` ends.

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use storyweave_shared::WsEnvelope;
use url::Url;

use crate::error::{EngineError, EngineResult};

mod connection_native;
pub use connection_native::WsTransport;

/// Connection lifecycle.
///
/// `Idle -> Connecting -> Ready -> (Reconnecting <-> Ready) -> DisconnectedPermanent`.
/// Only an explicit `connect()` leaves `DisconnectedPermanent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Reconnecting { attempt: u32 },
    DisconnectedPermanent,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    /// True while a supervisor task owns the connection.
    pub fn is_active(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts tolerated before giving up for good
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any retry delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor per attempt; 1.0 keeps the delay fixed
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let delay = self.initial_delay_ms as f64 * (self.backoff_multiplier as f64).powi(attempt as i32);
        (delay as u64).min(self.max_delay_ms)
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub url: Url,
}

impl EndpointConfig {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let url = Url::parse(raw)
            .map_err(|e| EngineError::Config(format!("invalid socket url '{}': {}", raw, e)))?;
        match url.scheme() {
            "ws" | "wss" | "memory" => Ok(Self { url }),
            other => Err(EngineError::Config(format!(
                "unsupported socket scheme '{}' in '{}'",
                other, raw
            ))),
        }
    }

    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// An open link to the server.
pub struct TransportLink {
    pub outgoing: UnboundedSender<WsEnvelope>,
    pub incoming: UnboundedReceiver<WsEnvelope>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &EndpointConfig) -> EngineResult<TransportLink>;
}
