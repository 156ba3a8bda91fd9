use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{KeyValueStore, StoredValue};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set_at(&self, key: &str, value: String, written_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), StoredValue::new(value, written_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut guard = self.entries.lock().await;
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok(before - guard.len())
    }
}
