use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ClientResult;

/// Persistent small-object store used for session caching.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value) -> bool;
    async fn delete(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes raw text, bypassing serialization.
    pub async fn set_raw(&self, key: &str, raw: impl Into<String>) {
        self.items.lock().await.insert(key.to_string(), raw.into());
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let items = self.items.lock().await;
        parse_item(key, items.get(key)?)
    }

    async fn set(&self, key: &str, value: Value) -> bool {
        self.items
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        true
    }

    async fn delete(&self, key: &str) {
        self.items.lock().await.remove(key);
    }
}

/// Items kept as serialized text inside one JSON object file.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> HashMap<String, String> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(err) => {
                warn!(path = %self.path.display(), "storage: ignoring unreadable store file: {err}");
                HashMap::new()
            }
        }
    }

    async fn persist(&self, items: &HashMap<String, String>) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_string_pretty(items)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let _guard = self.lock.lock().await;
        let items = self.load().await;
        parse_item(key, items.get(key)?)
    }

    async fn set(&self, key: &str, value: Value) -> bool {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await;
        items.insert(key.to_string(), value.to_string());
        match self.persist(&items).await {
            Ok(()) => true,
            Err(err) => {
                warn!(key, "storage: failed to set item: {err}");
                false
            }
        }
    }

    async fn delete(&self, key: &str) {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await;
        if items.remove(key).is_none() {
            return;
        }
        if let Err(err) = self.persist(&items).await {
            warn!(key, "storage: failed to delete item: {err}");
        }
    }
}

fn parse_item(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, "storage: failed to parse stored item: {err}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/storage_tests.rs"]
mod tests;
