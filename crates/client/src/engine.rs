//! The dialogue engine: one context object tying the components together.
//!
//! Socket handlers only forward events into a channel. A single engine task
//! drains that channel, so every state change caused by the server happens in
//! arrival order on one task. The task runs the session restore before it
//! reads the first event; events that arrive earlier wait in the channel.
//!
//! ```text
//!  socket ──▶ ConnectionManager ──▶ handlers ──▶ engine channel
//!                                                     │
//!                                            engine task (StreamAssembler)
//!                                              │            │
//!                                         StateStore   PresentationQueue ──▶ RenderTarget
//!                                              │
//!                                        SessionBridge ──▶ snapshot file / REST
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use storyweave_shared::{
    Character, CharacterRef, InitStoryRequest, Message, ReceiveMessagePayload, ResponseStatus,
    SendMessagePayload, Speaker, Story, StreamDataPayload, StreamEndPayload, StreamStartPayload,
    EVENT_CONNECT, EVENT_DISCONNECT, EVENT_RECEIVE_MESSAGE, EVENT_SEND_MESSAGE,
    EVENT_STREAM_DATA, EVENT_STREAM_END, EVENT_STREAM_START,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api_client::ApiClient;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notice::{Notice, Notices};
use crate::presentation::{PresentationQueue, PresentationUnit, RenderTarget};
use crate::session::{PersistKey, RestoreOutcome, SessionBackend, SessionBridge};
use crate::storage::LocalStorage;
use crate::stores::{StateStore, CHARACTERS, GAME_PROGRESS, STORY, WORLD_SETTING};
use crate::stream::StreamAssembler;
use crate::ws::{ConnectionManager, ConnectionState, HandlerId, Transport, WsTransport};

/// Server events the engine listens to.
const ENGINE_EVENTS: [&str; 6] = [
    EVENT_CONNECT,
    EVENT_DISCONNECT,
    EVENT_RECEIVE_MESSAGE,
    EVENT_STREAM_START,
    EVENT_STREAM_DATA,
    EVENT_STREAM_END,
];

enum Command {
    Socket { event: String, payload: Value },
    Reset(oneshot::Sender<()>),
    Shutdown,
}

/// Collaborators the engine is built from. Tests swap in memory fakes.
pub struct EngineParts {
    pub transport: Arc<dyn Transport>,
    pub backend: Arc<dyn SessionBackend>,
    pub storage: LocalStorage,
    pub render: Arc<dyn RenderTarget>,
}

struct Inner {
    config: EngineConfig,
    store: Arc<StateStore>,
    connection: ConnectionManager,
    presentation: Arc<PresentationQueue>,
    session: Arc<SessionBridge>,
    api: ApiClient,
    notices: Notices,
    commands: mpsc::UnboundedSender<Command>,
    /// Taken by `start`.
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Held while one turn's state changes are applied, so a user send and a
    /// server event never interleave.
    turn: Mutex<()>,
    handlers: Mutex<Vec<HandlerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DialogueEngine {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn decode<T: DeserializeOwned>(event: &str, payload: &Value) -> Option<T> {
    match serde_json::from_value(payload.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            let err = EngineError::MalformedPayload {
                event: event.to_string(),
                reason: e.to_string(),
            };
            crate::log_warn!("DialogueEngine: dropping {}", err);
            None
        }
    }
}

impl DialogueEngine {
    /// Engine talking to a real server: websocket transport, REST history and
    /// a snapshot file under the configured data directory.
    pub fn new(config: EngineConfig, render: Arc<dyn RenderTarget>) -> EngineResult<Self> {
        let dir = config
            .data_dir
            .clone()
            .ok_or_else(|| EngineError::Config("no data directory; set STORYWEAVE_DATA_DIR".into()))?;
        let api = ApiClient::new().with_base_url(config.server_url.as_str());
        let parts = EngineParts {
            transport: Arc::new(WsTransport::new()),
            backend: Arc::new(api),
            storage: LocalStorage::new(dir),
            render,
        };
        Ok(Self::with_parts(config, parts))
    }

    /// Must be called from inside a tokio runtime.
    pub fn with_parts(config: EngineConfig, parts: EngineParts) -> Self {
        let notices = Notices::new();
        let store = Arc::new(StateStore::new());
        let connection =
            ConnectionManager::new(parts.transport, config.reconnect.clone(), notices.clone());
        let presentation = Arc::new(PresentationQueue::new(parts.render, config.reveal_interval));
        let session = Arc::new(SessionBridge::new(store.clone(), parts.backend, parts.storage));
        let api = ApiClient::new().with_base_url(config.server_url.as_str());
        let (commands, receiver) = mpsc::unbounded_channel();

        if let Some(character) = &config.initial_character {
            store.set_current_character(character);
        }

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                connection,
                presentation,
                session,
                api,
                notices,
                commands,
                receiver: Mutex::new(Some(receiver)),
                turn: Mutex::new(()),
                handlers: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn presentation(&self) -> &Arc<PresentationQueue> {
        &self.inner.presentation
    }

    pub fn session(&self) -> &Arc<SessionBridge> {
        &self.inner.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Register the socket handlers, start the engine and presentation tasks
    /// and begin connecting. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(receiver) = lock(&self.inner.receiver).take() else {
            crate::log_debug!("DialogueEngine: already started");
            return;
        };

        {
            let mut handlers = lock(&self.inner.handlers);
            for event in ENGINE_EVENTS {
                let tx = self.inner.commands.clone();
                let name = event.to_string();
                let id = self.inner.connection.on(event, move |payload| {
                    let _ = tx.send(Command::Socket {
                        event: name.clone(),
                        payload: payload.clone(),
                    });
                });
                handlers.push(id);
            }
        }

        let engine = self.clone();
        let run = tokio::spawn(async move { engine.run(receiver).await });
        let drain = self.inner.presentation.spawn();
        lock(&self.inner.tasks).extend([run, drain]);

        self.inner.connection.connect(self.inner.config.socket.clone());
    }

    /// Wait for the session restore to land.
    pub async fn wait_restored(&self) {
        let mut rx = self.inner.session.subscribe_restored();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the engine tasks and drop the connection.
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
        for id in lock(&self.inner.handlers).drain(..) {
            self.inner.connection.off(id);
        }
        self.inner.connection.disconnect();
        self.inner.presentation.clear();
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }

    /// Manual reconnect, e.g. after connectivity was lost for good.
    pub fn reconnect(&self) -> bool {
        self.inner.connection.connect(self.inner.config.socket.clone())
    }

    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    // --- User operations ---

    /// Send a user line to the current character. Rejected without touching
    /// the transport when the text is blank, no character is selected or the
    /// session restore has not landed yet; when disconnected the send fails
    /// with `NotConnected` and nothing is appended.
    pub fn send_message(&self, text: &str) -> EngineResult<Message> {
        self.send_turn(text, false)
    }

    /// Answer with one of the offered choices. The offer is withdrawn once the
    /// answer is sent.
    pub fn choose(&self, index: usize) -> EngineResult<Message> {
        let choices = self.inner.store.pending_choices();
        let choice = choices.get(index).ok_or_else(|| {
            EngineError::InvalidInput(format!("no choice #{} ({} offered)", index + 1, choices.len()))
        })?;
        self.send_turn(&choice.text, true)
    }

    fn send_turn(&self, text: &str, clear_choices: bool) -> EngineResult<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("message is empty".into()));
        }
        let character = self
            .inner
            .store
            .current_character()
            .ok_or_else(|| EngineError::InvalidInput("no character selected".into()))?;
        if !self.inner.session.is_restored() {
            return Err(EngineError::Restoring);
        }

        let _turn = lock(&self.inner.turn);
        let payload = SendMessagePayload {
            message: text.to_string(),
            character: character.to_string(),
        };
        self.inner.connection.send(EVENT_SEND_MESSAGE, json!(payload))?;

        let message = Message::from_user(text);
        self.inner.store.append_message(&message);
        if clear_choices {
            self.inner.store.set_pending_choices(&[]);
        }
        self.inner
            .presentation
            .enqueue(PresentationUnit::Message(message.clone()));
        self.inner
            .presentation
            .enqueue(PresentationUnit::Typing(character));
        self.inner.session.persist(PersistKey::History);
        Ok(message)
    }

    /// Switch the conversation partner. The character record is fetched if
    /// the store does not have it yet; a failed fetch only logs.
    pub async fn select_character(&self, name: &str) -> EngineResult<CharacterRef> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("character name is empty".into()));
        }
        let character = CharacterRef::new(name);
        self.inner.store.set_current_character(&character);

        let known = self
            .inner
            .store
            .get(CHARACTERS)
            .and_then(|all| all.get(name).cloned())
            .is_some();
        if !known {
            match self.inner.api.character(name).await {
                Ok(record) => self.store_character(&record),
                Err(e) => crate::log_warn!("DialogueEngine: no record for {}: {}", name, e),
            }
        }
        Ok(character)
    }

    /// Drop the conversation: cancel the reveal, clear the queue, discard any
    /// open stream and empty the history.
    pub async fn reset(&self) {
        self.inner.session.supersede_restore();
        let (tx, rx) = oneshot::channel();
        // The engine task answers after dropping its open stream; before
        // `start` there is no stream to drop.
        let started = lock(&self.inner.receiver).is_none();
        if self.inner.commands.send(Command::Reset(tx)).is_ok() && started {
            let _ = rx.await;
        }
        self.inner.presentation.clear();
        {
            let _turn = lock(&self.inner.turn);
            self.inner.store.clear_conversation();
        }
        self.inner.session.persist(PersistKey::History);
        crate::log_info!("DialogueEngine: conversation reset");
    }

    /// Pick the model the server generates with.
    pub async fn set_model(&self, model: &str) -> EngineResult<()> {
        self.inner.api.set_model(model).await?;
        self.inner.store.set("settings.aiModel", json!(model));
        self.inner.session.persist(PersistKey::Settings);
        Ok(())
    }

    /// Start a new story on the server and reset the local conversation.
    pub async fn init_story(&self, request: &InitStoryRequest) -> EngineResult<Story> {
        let story = self.inner.api.init_story(request).await?;
        self.reset().await;
        self.apply_story(&story);
        Ok(story)
    }

    fn apply_story(&self, story: &Story) {
        let mut updates = vec![
            (STORY.to_string(), json!(story)),
            (WORLD_SETTING.to_string(), json!(story.world_setting())),
        ];
        if !story.characters.is_empty() {
            updates.push((CHARACTERS.to_string(), json!(story.characters)));
        }
        self.inner.store.apply(updates);
        self.inner.session.persist(PersistKey::WorldSetting);
    }

    // --- Engine task ---

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        match self.inner.session.restore().await {
            RestoreOutcome::Applied { history, .. } => {
                for message in history {
                    self.inner
                        .presentation
                        .enqueue(PresentationUnit::Restored(message));
                }
            }
            RestoreOutcome::Superseded => {
                crate::log_info!("DialogueEngine: restore superseded, starting empty");
                self.inner.session.mark_restored();
            }
        }

        let mut streams = StreamAssembler::new();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Socket { event, payload } => {
                    let _turn = lock(&self.inner.turn);
                    self.handle_event(&mut streams, &event, &payload);
                }
                Command::Reset(done) => {
                    if let Some(dropped) = streams.interrupt() {
                        crate::log_info!(
                            "DialogueEngine: discarded stream '{}' on reset",
                            dropped.session.stream_id
                        );
                    }
                    let _ = done.send(());
                }
                Command::Shutdown => break,
            }
        }
        crate::log_debug!("DialogueEngine: engine task stopped");
    }

    fn handle_event(&self, streams: &mut StreamAssembler, event: &str, payload: &Value) {
        match event {
            EVENT_CONNECT => crate::log_debug!("DialogueEngine: link up"),
            EVENT_DISCONNECT => self.on_disconnect(streams),
            EVENT_RECEIVE_MESSAGE => {
                if let Some(received) = decode::<ReceiveMessagePayload>(event, payload) {
                    self.on_receive(received);
                }
            }
            EVENT_STREAM_START => {
                if let Some(start) = decode::<StreamStartPayload>(event, payload) {
                    let character = start.character.reference();
                    if let Some(record) = start.character.record() {
                        self.store_character(record);
                    }
                    if streams.open_stream(&start.stream_id, character.clone()).is_ok() {
                        self.inner.presentation.dismiss_typing(&character);
                    }
                }
            }
            EVENT_STREAM_DATA => {
                if let Some(data) = decode::<StreamDataPayload>(event, payload) {
                    let _ = streams.append_chunk(&data.stream_id, &data.content);
                }
            }
            EVENT_STREAM_END => {
                if let Some(end) = decode::<StreamEndPayload>(event, payload) {
                    if let Ok(message) = streams.close_stream(&end.stream_id) {
                        self.finalize(message);
                    }
                }
            }
            other => crate::log_debug!("DialogueEngine: ignoring '{}'", other),
        }
    }

    fn on_receive(&self, received: ReceiveMessagePayload) {
        // The placeholder went up for whoever the user addressed, which is not
        // always the character that answers.
        let addressed = self.inner.store.current_character();
        if let Some(addressed) = &addressed {
            self.inner.presentation.dismiss_typing(addressed);
        }
        let character = received
            .character
            .as_ref()
            .map(|field| field.reference())
            .or(addressed);

        if received.status == ResponseStatus::Error {
            if let Some(character) = &character {
                self.inner.presentation.dismiss_typing(character);
            }
            let reason = received
                .message
                .unwrap_or_else(|| "the server could not answer".to_string());
            self.inner.notices.error(EngineError::Server(reason));
            return;
        }

        if let Some(record) = received.character.as_ref().and_then(|field| field.record()) {
            self.store_character(record);
        }

        match (character, received.message) {
            (Some(character), Some(content)) => {
                let message = Message::from_character(character, content)
                    .with_kind(received.kind.unwrap_or_default());
                self.finalize(message);
            }
            (None, Some(_)) => {
                crate::log_warn!("DialogueEngine: dropping reply without a character");
            }
            _ => {}
        }

        self.inner
            .store
            .set_pending_choices(&received.choices.unwrap_or_default());
    }

    fn on_disconnect(&self, streams: &mut StreamAssembler) {
        let Some(interrupted) = streams.interrupt() else {
            return;
        };
        self.inner.notices.error(interrupted.error());
        let character = interrupted.session.character.clone();
        match interrupted.message {
            Some(partial) => self.finalize(partial),
            None => self.inner.presentation.dismiss_typing(&character),
        }
    }

    /// A finalized message goes to the store, the presentation queue and the
    /// persisted history, in that order. The speaker's placeholder is taken
    /// down first.
    fn finalize(&self, message: Message) {
        if message.speaker == Speaker::Character {
            if let Some(character) = &message.character_ref {
                self.inner.presentation.dismiss_typing(character);
                self.inner.store.set_current_character(character);
            }
        }
        if !self.inner.store.append_message(&message) {
            crate::log_debug!("DialogueEngine: message {} already present", message.id);
            return;
        }
        self.inner
            .presentation
            .enqueue(PresentationUnit::Message(message));
        self.inner.session.persist(PersistKey::History);
    }

    /// Keep the full record under `characters.<name>` and mirror its
    /// affection into the game progress.
    fn store_character(&self, record: &Character) {
        let Ok(encoded) = serde_json::to_value(record) else {
            return;
        };
        let name = record.name.clone();
        self.inner.store.update(CHARACTERS, move |slot| {
            if !slot.is_object() {
                *slot = json!({});
            }
            if let Some(map) = slot.as_object_mut() {
                map.insert(name, encoded);
            }
        });

        let level = record.affection_level();
        self.inner.store.update(GAME_PROGRESS, |slot| {
            if !slot.is_object() {
                *slot = json!({});
            }
            if let Some(map) = slot.as_object_mut() {
                map.insert("affectionLevel".to_string(), json!(level));
            }
        });
        self.inner.session.persist(PersistKey::GameProgress);
    }
}
