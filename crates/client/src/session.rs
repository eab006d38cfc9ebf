//! Bridge between the state store and persisted session data.
//!
//! History lives on the server (`/api/load_story`, `/api/save_story`); the
//! settings, world setting and game progress live in a local snapshot file.
//! `restore` merges both into the store as one update. `persist` hands a
//! write to a background worker that runs jobs one at a time, in order,
//! collapsing queued writes for the same key to the newest value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use storyweave_shared::{
    ApiError, DialogueEntry, GameProgress, LoadStoryResponse, LocalSnapshot, Message, Settings,
    Story, WorldSetting,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::api_client::ApiClient;
use crate::storage::LocalStorage;
use crate::stores::{StateStore, CHARACTERS, GAME_PROGRESS, MESSAGES, SETTINGS, STORY, WORLD_SETTING};

/// File key of the local snapshot inside [`LocalStorage`].
pub const SNAPSHOT_KEY: &str = "snapshot";

/// Remote half of the session: where the dialogue history is kept.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load_story(&self) -> Result<LoadStoryResponse, ApiError>;
    async fn save_history(&self, history: &[DialogueEntry]) -> Result<(), ApiError>;
}

#[async_trait]
impl SessionBackend for ApiClient {
    async fn load_story(&self) -> Result<LoadStoryResponse, ApiError> {
        ApiClient::load_story(self).await
    }

    async fn save_history(&self, history: &[DialogueEntry]) -> Result<(), ApiError> {
        self.save_story(history).await
    }
}

/// The persisted subset of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistKey {
    Settings,
    WorldSetting,
    GameProgress,
    History,
}

impl PersistKey {
    pub fn path(self) -> &'static str {
        match self {
            PersistKey::Settings => SETTINGS,
            PersistKey::WorldSetting => WORLD_SETTING,
            PersistKey::GameProgress => GAME_PROGRESS,
            PersistKey::History => MESSAGES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// Merged into the store. `history` is what was restored from the server,
    /// empty when the server could not be reached.
    Applied { history: Vec<Message>, remote: bool },
    /// A newer restore or a reset started while this one was waiting.
    Superseded,
}

enum Job {
    Write(PersistKey, Value),
    Flush(oneshot::Sender<()>),
}

pub struct SessionBridge {
    store: Arc<StateStore>,
    backend: Arc<dyn SessionBackend>,
    storage: LocalStorage,
    jobs: mpsc::UnboundedSender<Job>,
    generation: AtomicU64,
    restored: watch::Sender<bool>,
    /// A history write was held back while the restore was in flight.
    history_held: AtomicBool,
    // Serializes local snapshot read-modify-write between restore and worker.
    snapshot_lock: Arc<Mutex<()>>,
}

impl SessionBridge {
    /// Create the bridge and start its persist worker. Must be called from
    /// inside a tokio runtime.
    pub fn new(
        store: Arc<StateStore>,
        backend: Arc<dyn SessionBackend>,
        storage: LocalStorage,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let (restored, _) = watch::channel(false);
        let snapshot_lock = Arc::new(Mutex::new(()));
        tokio::spawn(persist_worker(
            rx,
            backend.clone(),
            storage.clone(),
            snapshot_lock.clone(),
        ));
        Self {
            store,
            backend,
            storage,
            jobs,
            generation: AtomicU64::new(0),
            restored,
            history_held: AtomicBool::new(false),
            snapshot_lock,
        }
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn is_restored(&self) -> bool {
        *self.restored.borrow()
    }

    pub fn subscribe_restored(&self) -> watch::Receiver<bool> {
        self.restored.subscribe()
    }

    /// Declare the restore phase over without applying anything, e.g. when
    /// the only restore was superseded by a reset.
    pub fn mark_restored(&self) {
        self.restored.send_replace(true);
        self.release_history();
    }

    fn release_history(&self) {
        if self.history_held.swap(false, Ordering::SeqCst) {
            self.persist(PersistKey::History);
        }
    }

    /// Make any in-flight restore stale. Its result is dropped when it lands.
    pub fn supersede_restore(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Load the local snapshot and the server history and merge both into the
    /// store in a single `apply`. Sections the snapshot does not carry are left
    /// untouched. A server failure only costs the history; it is logged and
    /// the session continues with what it has.
    pub async fn restore(&self) -> RestoreOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.restored.send_replace(false);

        let local: LocalSnapshot = {
            let _guard = self.snapshot_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.storage.load(SNAPSHOT_KEY).unwrap_or_default()
        };
        let remote = self.backend.load_story().await;

        if self.generation.load(Ordering::SeqCst) != generation {
            crate::log_info!("SessionBridge: dropping stale restore #{}", generation);
            return RestoreOutcome::Superseded;
        }

        let mut updates: Vec<(String, Value)> = Vec::new();
        if let Some(settings) = &local.settings {
            updates.push((SETTINGS.to_string(), json!(settings)));
        }
        if let Some(progress) = &local.game_progress {
            updates.push((GAME_PROGRESS.to_string(), json!(progress)));
        }
        if let Some(world) = &local.world_setting {
            updates.push((WORLD_SETTING.to_string(), json!(world)));
        }

        let (history, remote_ok) = match remote {
            Ok(response) => {
                let history: Vec<Message> = response
                    .dialogue_history
                    .into_iter()
                    .map(Message::from)
                    .collect();
                updates.push((MESSAGES.to_string(), json!(history)));
                if let Some(story) = response.story {
                    merge_story(&mut updates, &story, local.world_setting.is_none());
                }
                (history, true)
            }
            Err(e) => {
                crate::log_warn!("SessionBridge: history unavailable, starting fresh: {}", e);
                (Vec::new(), false)
            }
        };

        crate::log_info!(
            "SessionBridge: restored {} messages ({} sections)",
            history.len(),
            updates.len()
        );
        self.store.apply(updates);
        self.restored.send_replace(true);
        self.release_history();
        RestoreOutcome::Applied {
            history,
            remote: remote_ok,
        }
    }

    /// Queue a write of `key`'s current value. Returns immediately; failures
    /// are logged by the worker. History writes are held until the restore
    /// has landed, so the server copy is never overwritten before it is read.
    pub fn persist(&self, key: PersistKey) {
        if key == PersistKey::History && !self.is_restored() {
            crate::log_debug!("SessionBridge: holding history write until restored");
            self.history_held.store(true, Ordering::SeqCst);
            return;
        }
        let value = match key {
            PersistKey::History => {
                let entries: Vec<DialogueEntry> =
                    self.store.messages().iter().map(DialogueEntry::from).collect();
                json!(entries)
            }
            _ => self.store.get(key.path()).unwrap_or(Value::Null),
        };
        if self.jobs.send(Job::Write(key, value)).is_err() {
            crate::log_warn!("SessionBridge: persist worker gone, dropping {:?}", key);
        }
    }

    /// Wait until every persist queued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn merge_story(updates: &mut Vec<(String, Value)>, story: &Story, derive_world: bool) {
    updates.push((STORY.to_string(), json!(story)));
    if !story.characters.is_empty() {
        updates.push((CHARACTERS.to_string(), json!(story.characters)));
    }
    if derive_world {
        updates.push((WORLD_SETTING.to_string(), json!(story.world_setting())));
    }
}

/// Collapse a batch: the newest write per key wins and takes the position of
/// that newest write. Flush waiters are answered after all writes.
fn coalesce(batch: Vec<Job>) -> (Vec<(PersistKey, Value)>, Vec<oneshot::Sender<()>>) {
    let mut writes: Vec<(PersistKey, Value)> = Vec::new();
    let mut waiters = Vec::new();
    for job in batch {
        match job {
            Job::Write(key, value) => {
                writes.retain(|(k, _)| *k != key);
                writes.push((key, value));
            }
            Job::Flush(tx) => waiters.push(tx),
        }
    }
    (writes, waiters)
}

async fn persist_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    backend: Arc<dyn SessionBackend>,
    storage: LocalStorage,
    snapshot_lock: Arc<Mutex<()>>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(job) = rx.try_recv() {
            batch.push(job);
        }
        let (writes, waiters) = coalesce(batch);

        for (key, value) in writes {
            let result = match key {
                PersistKey::History => match serde_json::from_value::<Vec<DialogueEntry>>(value) {
                    Ok(entries) => backend
                        .save_history(&entries)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                },
                _ => write_local(&storage, &snapshot_lock, key, value),
            };
            match result {
                Ok(()) => crate::log_debug!("SessionBridge: persisted {:?}", key),
                Err(e) => crate::log_warn!("SessionBridge: persisting {:?} failed: {}", key, e),
            }
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
    crate::log_debug!("SessionBridge: persist worker stopped");
}

fn write_local(
    storage: &LocalStorage,
    snapshot_lock: &Mutex<()>,
    key: PersistKey,
    value: Value,
) -> Result<(), String> {
    let _guard = snapshot_lock.lock().unwrap_or_else(|p| p.into_inner());
    let mut snapshot: LocalSnapshot = storage.load(SNAPSHOT_KEY).unwrap_or_default();
    let decoded = |e: serde_json::Error| format!("{:?} does not decode: {}", key, e);
    match key {
        PersistKey::Settings => {
            snapshot.settings = section::<Settings>(value).map_err(decoded)?;
        }
        PersistKey::WorldSetting => {
            snapshot.world_setting = section::<WorldSetting>(value).map_err(decoded)?;
        }
        PersistKey::GameProgress => {
            snapshot.game_progress = section::<GameProgress>(value).map_err(decoded)?;
        }
        PersistKey::History => return Ok(()),
    }
    storage.save(SNAPSHOT_KEY, &snapshot).map_err(|e| e.to_string())
}

fn section<T: serde::de::DeserializeOwned>(value: Value) -> Result<Option<T>, serde_json::Error> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value).map(Some)
}

/// Session backend kept in memory. Saved history is served back by the next
/// `load_story`.
#[derive(Clone, Default)]
pub struct MemorySessionBackend {
    inner: Arc<Mutex<MemoryBackendState>>,
}

#[derive(Default)]
struct MemoryBackendState {
    history: Vec<DialogueEntry>,
    story: Option<Story>,
    fail_loads: bool,
    saves: usize,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBackendState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_history(self, history: Vec<DialogueEntry>) -> Self {
        self.lock().history = history;
        self
    }

    pub fn with_story(self, story: Story) -> Self {
        self.lock().story = Some(story);
        self
    }

    pub fn fail_loads(&self, fail: bool) {
        self.lock().fail_loads = fail;
    }

    pub fn history(&self) -> Vec<DialogueEntry> {
        self.lock().history.clone()
    }

    pub fn save_count(&self) -> usize {
        self.lock().saves
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load_story(&self) -> Result<LoadStoryResponse, ApiError> {
        let state = self.lock();
        if state.fail_loads {
            return Err(ApiError::Network("backend unavailable".to_string()));
        }
        Ok(LoadStoryResponse {
            status: "success".to_string(),
            message: None,
            dialogue_history: state.history.clone(),
            story: state.story.clone(),
        })
    }

    async fn save_history(&self, history: &[DialogueEntry]) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.history = history.to_vec();
        state.saves += 1;
        Ok(())
    }
}
