//! In-process transport that plays the server side from code.
//!
//! Used by tests and offline demos: `emit` pushes events to the client,
//! `sent` returns what the client wrote, `drop_link` simulates the server
//! going away and `fail_next`/`fail_always` make opens fail.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{FutureExt, StreamExt};
use storyweave_shared::WsEnvelope;

use super::connection::{EndpointConfig, Transport, TransportLink};
use crate::error::{EngineError, EngineResult};

#[derive(Default)]
struct ServerSide {
    to_client: Option<UnboundedSender<WsEnvelope>>,
    from_client: Option<UnboundedReceiver<WsEnvelope>>,
}

#[derive(Default)]
struct MemoryInner {
    server: ServerSide,
    fail_next: u32,
    fail_always: bool,
    opens: u32,
    sent: Vec<WsEnvelope>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` opens fail.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn fail_always(&self, fail: bool) {
        self.lock().fail_always = fail;
    }

    /// Number of open attempts so far, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    /// Push an event to the connected client. Returns `false` if no link is up.
    pub fn emit(&self, event: &str, data: serde_json::Value) -> bool {
        let inner = self.lock();
        match &inner.server.to_client {
            Some(tx) => tx.unbounded_send(WsEnvelope::new(event, data)).is_ok(),
            None => false,
        }
    }

    /// Close the server side of the current link.
    pub fn drop_link(&self) {
        let mut inner = self.lock();
        inner.server.to_client = None;
        if let Some(mut rx) = inner.server.from_client.take() {
            while let Some(Some(envelope)) = rx.next().now_or_never() {
                inner.sent.push(envelope);
            }
        }
    }

    /// Everything the client has written so far, oldest first.
    pub fn sent(&self) -> Vec<WsEnvelope> {
        let mut inner = self.lock();
        let mut drained = Vec::new();
        if let Some(rx) = inner.server.from_client.as_mut() {
            while let Some(Some(envelope)) = rx.next().now_or_never() {
                drained.push(envelope);
            }
        }
        inner.sent.extend(drained);
        inner.sent.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _endpoint: &EndpointConfig) -> EngineResult<TransportLink> {
        let mut inner = self.lock();
        inner.opens += 1;
        if inner.fail_always || inner.fail_next > 0 {
            inner.fail_next = inner.fail_next.saturating_sub(1);
            return Err(EngineError::Transport("connection refused".to_string()));
        }

        if let Some(mut stale) = inner.server.from_client.take() {
            while let Some(Some(envelope)) = stale.next().now_or_never() {
                inner.sent.push(envelope);
            }
        }
        let (outgoing, from_client) = unbounded();
        let (to_client, incoming) = unbounded();
        inner.server = ServerSide {
            to_client: Some(to_client),
            from_client: Some(from_client),
        };
        Ok(TransportLink { outgoing, incoming })
    }
}
