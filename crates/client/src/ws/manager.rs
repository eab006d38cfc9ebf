//! Connection manager: owns the link, the reconnect loop and event handlers.
//!
//! Handlers registered with [`ConnectionManager::on`] while the link is down
//! wait in a pending queue; when a link comes up the queue is moved, in
//! registration order, into the live registry before anything is dispatched.
//! Live handlers survive reconnects, so a reconnect never registers a handler
//! twice. Besides server events the manager dispatches two local lifecycle
//! events, `connect` and `disconnect`, through the same ordered path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_channel::mpsc::UnboundedSender;
use futures_util::StreamExt;
use serde_json::Value;
use storyweave_shared::{WsEnvelope, EVENT_CONNECT, EVENT_DISCONNECT};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionState, EndpointConfig, ReconnectConfig, Transport, TransportLink};
use crate::error::{EngineError, EngineResult};
use crate::notice::{Notice, Notices};

/// Event callback. Receives the event payload.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    event: String,
    handler: Handler,
}

#[derive(Default)]
struct Shared {
    registered: Vec<Registration>,
    pending: VecDeque<Registration>,
    outgoing: Option<UnboundedSender<WsEnvelope>>,
    next_id: u64,
    /// Bumped by every `connect`/`disconnect` so a superseded supervisor
    /// notices it has been replaced.
    session: u64,
    cancel: Option<CancellationToken>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    notices: Notices,
    state: watch::Sender<ConnectionState>,
    shared: Mutex<Shared>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, reconnect: ReconnectConfig, notices: Notices) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                transport,
                reconnect,
                notices,
                state,
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of handlers waiting for the next link.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Start connecting. No-op while a connection is up or being attempted;
    /// from `Idle` or `DisconnectedPermanent` a fresh supervisor is started.
    /// Returns whether a new attempt was started.
    pub fn connect(&self, endpoint: EndpointConfig) -> bool {
        let (session, token) = {
            let mut shared = self.lock();
            let current = self.state();
            if current.is_active() {
                crate::log_debug!("ConnectionManager: connect ignored in state {:?}", current);
                return false;
            }
            shared.session += 1;
            let token = CancellationToken::new();
            shared.cancel = Some(token.clone());
            self.inner.state.send_replace(ConnectionState::Connecting);
            (shared.session, token)
        };

        crate::log_info!("ConnectionManager: connecting to {}", endpoint.url);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(session, endpoint, token).await;
        });
        true
    }

    /// Tear the link down and return to `Idle`. Handlers stay registered.
    pub fn disconnect(&self) {
        let was_live = {
            let mut shared = self.lock();
            shared.session += 1;
            if let Some(token) = shared.cancel.take() {
                token.cancel();
            }
            let was_live = shared.outgoing.take().is_some();
            self.inner.state.send_replace(ConnectionState::Idle);
            was_live
        };
        crate::log_info!("ConnectionManager: disconnected by request");
        if was_live {
            self.dispatch(EVENT_DISCONNECT, &Value::Null);
        }
    }

    /// Wait until the manager is `Ready` or has given up. Returns the state
    /// that ended the wait.
    pub async fn wait_settled(&self) -> ConnectionState {
        let mut rx = self.subscribe_state();
        loop {
            let current = rx.borrow_and_update().clone();
            if matches!(
                current,
                ConnectionState::Ready | ConnectionState::DisconnectedPermanent
            ) {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Register a handler. Goes live immediately if the link is up, otherwise
    /// waits in the pending queue.
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        let mut shared = self.lock();
        shared.next_id += 1;
        let registration = Registration {
            id: HandlerId(shared.next_id),
            event: event.to_string(),
            handler: Arc::new(handler),
        };
        let id = registration.id;
        if shared.outgoing.is_some() {
            shared.registered.push(registration);
        } else {
            crate::log_debug!("ConnectionManager: queueing handler for '{}'", event);
            shared.pending.push_back(registration);
        }
        id
    }

    /// Remove a handler, live or pending.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut shared = self.lock();
        let before = shared.registered.len() + shared.pending.len();
        shared.registered.retain(|r| r.id != id);
        shared.pending.retain(|r| r.id != id);
        before != shared.registered.len() + shared.pending.len()
    }

    /// Send an event. Fails with `NotConnected` (also published as a notice)
    /// when no link is up; nothing is buffered for later.
    pub fn send(&self, event: &str, payload: Value) -> EngineResult<()> {
        let result = {
            let shared = self.lock();
            match &shared.outgoing {
                Some(tx) if self.state().is_connected() => tx
                    .unbounded_send(WsEnvelope::new(event, payload))
                    .map_err(|_| EngineError::NotConnected {
                        event: event.to_string(),
                    }),
                _ => Err(EngineError::NotConnected {
                    event: event.to_string(),
                }),
            }
        };
        if let Err(e) = &result {
            self.inner.notices.error(e.clone());
        }
        result
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<Handler> = self
            .lock()
            .registered
            .iter()
            .filter(|r| r.event == event)
            .map(|r| r.handler.clone())
            .collect();
        if handlers.is_empty() {
            crate::log_debug!("ConnectionManager: no handler for '{}'", event);
        }
        for handler in handlers {
            handler(payload);
        }
    }

    fn is_current(&self, session: u64) -> bool {
        self.lock().session == session
    }

    /// Install a fresh link: promote pending handlers, then mark ready.
    fn attach(&self, session: u64, outgoing: UnboundedSender<WsEnvelope>) -> bool {
        let mut shared = self.lock();
        if shared.session != session {
            return false;
        }
        let promoted = shared.pending.len();
        while let Some(registration) = shared.pending.pop_front() {
            shared.registered.push(registration);
        }
        shared.outgoing = Some(outgoing);
        self.inner.state.send_replace(ConnectionState::Ready);
        crate::log_info!(
            "ConnectionManager: ready ({} pending handlers registered)",
            promoted
        );
        true
    }

    fn detach(&self, session: u64) -> bool {
        let mut shared = self.lock();
        if shared.session != session {
            return false;
        }
        shared.outgoing = None;
        true
    }

    fn set_state_if_current(&self, session: u64, state: ConnectionState) -> bool {
        let shared = self.lock();
        if shared.session != session {
            return false;
        }
        self.inner.state.send_replace(state);
        true
    }

    async fn supervise(&self, session: u64, endpoint: EndpointConfig, token: CancellationToken) {
        let max_attempts = self.inner.reconnect.max_attempts;
        let mut failures = 0u32;

        loop {
            if !self.is_current(session) {
                return;
            }

            let opened = tokio::select! {
                _ = token.cancelled() => return,
                opened = self.inner.transport.open(&endpoint) => opened,
            };

            match opened {
                Ok(TransportLink { outgoing, mut incoming }) => {
                    failures = 0;
                    if !self.attach(session, outgoing) {
                        return;
                    }
                    self.inner.notices.publish(Notice::Connected);
                    self.dispatch(EVENT_CONNECT, &Value::Null);

                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            next = incoming.next() => match next {
                                Some(envelope) => self.dispatch(&envelope.event, &envelope.data),
                                None => break,
                            },
                        }
                    }

                    if !self.detach(session) {
                        return;
                    }
                    crate::log_warn!("ConnectionManager: link to {} lost", endpoint.url);
                    self.set_state_if_current(session, ConnectionState::Reconnecting { attempt: 1 });
                    self.dispatch(EVENT_DISCONNECT, &Value::Null);

                    let delay = self.inner.reconnect.delay_for_attempt(0);
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                    }
                }
                Err(e) => {
                    failures += 1;
                    crate::log_error!(
                        "ConnectionManager: attempt {} to {} failed: {}",
                        failures,
                        endpoint.url,
                        e
                    );
                    if failures > max_attempts {
                        if self.set_state_if_current(session, ConnectionState::DisconnectedPermanent) {
                            self.inner
                                .notices
                                .publish(Notice::ConnectivityLost { attempts: failures });
                        }
                        return;
                    }
                    if !self.set_state_if_current(
                        session,
                        ConnectionState::Reconnecting { attempt: failures },
                    ) {
                        return;
                    }
                    let delay = self.inner.reconnect.delay_for_attempt(failures - 1);
                    crate::log_info!(
                        "ConnectionManager: retrying {} in {}ms (attempt {} of {})",
                        endpoint.url,
                        delay,
                        failures + 1,
                        max_attempts + 1
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::Notice;
    use crate::ws::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use storyweave_shared::EVENT_RECEIVE_MESSAGE;

    fn endpoint() -> EndpointConfig {
        EndpointConfig::parse("memory://story").unwrap()
    }

    fn manager(transport: &MemoryTransport, notices: &Notices) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(transport.clone()),
            ReconnectConfig::default(),
            notices.clone(),
        )
    }

    fn counter(manager: &ConnectionManager, event: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager.on(event, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_without_emission() {
        let transport = MemoryTransport::new();
        let notices = Notices::new();
        let mut notice_rx = notices.subscribe();
        let manager = manager(&transport, &notices);

        let err = manager
            .send("send_message", json!({"message": "hi", "character": "Nova"}))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::NotConnected {
                event: "send_message".into()
            }
        );
        assert!(transport.sent().is_empty());
        assert_eq!(notice_rx.try_recv().unwrap(), Notice::Error(err));
    }

    #[tokio::test]
    async fn handlers_before_and_after_connect_fire_once() {
        let transport = MemoryTransport::new();
        let notices = Notices::new();
        let manager = manager(&transport, &notices);

        let early = counter(&manager, EVENT_RECEIVE_MESSAGE);
        assert_eq!(manager.pending_count(), 1);

        assert!(manager.connect(endpoint()));
        assert_eq!(manager.wait_settled().await, ConnectionState::Ready);
        assert_eq!(manager.pending_count(), 0);

        let late = counter(&manager, EVENT_RECEIVE_MESSAGE);
        assert!(transport.emit(EVENT_RECEIVE_MESSAGE, json!({"status": "success"})));
        settle().await;

        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_handlers_register_in_call_order() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, &Notices::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let o = order.clone();
            manager.on("ping", move |_| o.lock().unwrap().push(tag));
        }

        manager.connect(endpoint());
        manager.wait_settled().await;
        transport.emit("ping", Value::Null);
        settle().await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_does_not_duplicate_handlers() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, &Notices::new());
        let hits = counter(&manager, "ping");
        let connects = counter(&manager, EVENT_CONNECT);
        let disconnects = counter(&manager, EVENT_DISCONNECT);

        manager.connect(endpoint());
        manager.wait_settled().await;
        transport.drop_link();
        settle().await;
        assert!(matches!(manager.state(), ConnectionState::Reconnecting { .. }));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // Handler registered while reconnecting waits for the new link.
        let late = counter(&manager, "ping");
        assert_eq!(manager.pending_count(), 1);

        assert_eq!(manager.wait_settled().await, ConnectionState::Ready);
        transport.emit("ping", Value::Null);
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_permanent_with_one_fatal_notice() {
        let transport = MemoryTransport::new();
        transport.fail_always(true);
        let notices = Notices::new();
        let mut notice_rx = notices.subscribe();
        let manager = manager(&transport, &notices);

        manager.connect(endpoint());
        assert_eq!(
            manager.wait_settled().await,
            ConnectionState::DisconnectedPermanent
        );
        assert_eq!(transport.open_count(), 6);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 6);

        let mut fatal = 0;
        while let Ok(notice) = notice_rx.try_recv() {
            if notice.is_fatal() {
                fatal += 1;
            }
        }
        assert_eq!(fatal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_before_ceiling_returns_to_ready() {
        let transport = MemoryTransport::new();
        transport.fail_next(3);
        let manager = manager(&transport, &Notices::new());

        manager.connect(endpoint());
        assert_eq!(manager.wait_settled().await, ConnectionState::Ready);
        assert_eq!(transport.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_and_manual_connect_leaves_permanent_state() {
        let transport = MemoryTransport::new();
        transport.fail_always(true);
        let manager = manager(&transport, &Notices::new());

        assert!(manager.connect(endpoint()));
        assert!(!manager.connect(endpoint()));
        manager.wait_settled().await;

        transport.fail_always(false);
        assert!(manager.connect(endpoint()));
        assert_eq!(manager.wait_settled().await, ConnectionState::Ready);
        assert!(!manager.connect(endpoint()));
        assert_eq!(transport.open_count(), 7);
    }

    #[tokio::test]
    async fn sends_reach_the_transport_when_ready() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, &Notices::new());
        manager.connect(endpoint());
        manager.wait_settled().await;

        manager
            .send("send_message", json!({"message": "hi", "character": "Nova"}))
            .unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "send_message");
        assert_eq!(sent[0].data["message"], "hi");
    }

    #[tokio::test]
    async fn disconnect_returns_to_idle_and_off_removes_handler() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, &Notices::new());
        let id = manager.on("ping", |_| {});
        manager.connect(endpoint());
        manager.wait_settled().await;

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.send("ping", Value::Null).is_err());
        assert!(manager.off(id));
        assert!(!manager.off(id));
    }
}
