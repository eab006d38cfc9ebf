//! Local key/value storage as JSON files.
//!
//! Each key maps to `<dir>/<key>.json`. The default directory is the
//! platform config directory:
//!   - Linux: `~/.config/storyweave/`
//!   - macOS: `~/Library/Application Support/storyweave/`
//!   - Windows: `%APPDATA%\storyweave\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{EngineError, EngineResult};

const APP_DIR: &str = "storyweave";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage rooted in the platform config directory.
    pub fn default_dir() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join(APP_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| EngineError::Storage(format!("serialize '{}': {}", key, e)))?;
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .map_err(|e| EngineError::Storage(format!("create {}: {}", self.dir.display(), e)))?;
        }
        let path = self.file_path(key);
        // Write-then-rename so a crash never leaves a half-written snapshot.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| EngineError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| EngineError::Storage(format!("rename to {}: {}", path.display(), e)))
    }

    /// Returns `None` if the key doesn't exist or deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.file_path(key);
        let json = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                crate::log_warn!("LocalStorage: ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.file_path(key));
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }
}
