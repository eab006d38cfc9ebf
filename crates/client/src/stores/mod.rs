//! Key-path state store with exact-path subscriptions.
//!
//! State lives in a single JSON tree. Paths are dot separated
//! (`"conversation.messages"`); `set` creates missing intermediate objects and
//! then notifies every subscriber registered on exactly that path. The store
//! does no I/O. Subscribers are called after the internal lock is released, so
//! a callback may read or write the store again.

pub mod conversation;

pub use conversation::{
    ConversationState, CHARACTERS, CURRENT_CHARACTER, GAME_PROGRESS, MESSAGES, PENDING_CHOICES,
    SETTINGS, STORY, WORLD_SETTING,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};

/// Callback invoked with the new value of a subscribed path.
pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`StateStore::subscribe`]. The same callback may be
/// subscribed several times; each subscription gets its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Inner {
    root: Map<String, Value>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Subscriber)>>,
    next_id: u64,
}

#[derive(Default)]
pub struct StateStore {
    inner: Mutex<Inner>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = segments(path);
    let first = parts.next()?;
    let mut current = root.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Walk to the slot for `path`, replacing non-object intermediates with empty
/// objects along the way.
fn slot<'a>(root: &'a mut Map<String, Value>, path: &str) -> Option<&'a mut Value> {
    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = parts.split_last()?;
    let mut map = root;
    for part in parents {
        let entry = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        map = entry.as_object_mut()?;
    }
    Some(map.entry(last.to_string()).or_insert(Value::Null))
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking subscriber never runs under this lock, so poisoning can
        // only come from a bug inside the store itself; keep serving the data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        lookup(&self.lock().root, path).cloned()
    }

    /// Typed read. Returns `None` when the path is absent or does not decode.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let value = self.get(path)?;
        serde_json::from_value(value).ok()
    }

    pub fn set(&self, path: &str, value: Value) {
        {
            let mut inner = self.lock();
            let Some(target) = slot(&mut inner.root, path) else {
                crate::log_warn!("StateStore: ignoring set on empty path");
                return;
            };
            *target = value.clone();
        }
        self.notify(path, &value);
    }

    pub fn set_serialized<T: Serialize>(&self, path: &str, value: &T) -> EngineResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| EngineError::InvalidInput(format!("cannot store '{}': {}", path, e)))?;
        self.set(path, value);
        Ok(())
    }

    /// Read-modify-write under a single lock, then notify with the result.
    pub fn update(&self, path: &str, f: impl FnOnce(&mut Value)) {
        let value = {
            let mut inner = self.lock();
            let Some(target) = slot(&mut inner.root, path) else {
                crate::log_warn!("StateStore: ignoring update on empty path");
                return;
            };
            f(target);
            target.clone()
        };
        self.notify(path, &value);
    }

    /// Apply several writes as one logical update: every value is in place
    /// before the first subscriber runs. Notifications follow input order.
    pub fn apply(&self, updates: Vec<(String, Value)>) {
        {
            let mut inner = self.lock();
            for (path, value) in &updates {
                if let Some(target) = slot(&mut inner.root, path) {
                    *target = value.clone();
                }
            }
        }
        for (path, value) in &updates {
            self.notify(path, value);
        }
    }

    pub fn subscribe(
        &self,
        path: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner
            .subscribers
            .entry(path.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the subscription was not registered on `path`.
    pub fn unsubscribe(&self, path: &str, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.subscribers.get_mut(path) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.subscribers.remove(path);
        }
        removed
    }

    fn notify(&self, path: &str, value: &Value) {
        let callbacks: Vec<Subscriber> = self
            .lock()
            .subscribers
            .get(path)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(value);
        }
    }
}
