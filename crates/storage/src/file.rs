use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{KeyValueStore, StoredValue};

/// Single JSON document on disk, rewritten through a temp file on every
/// mutation. The in-memory map only takes a mutation once it is on disk.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!(
                    "failed to create parent directory '{}' for store",
                    parent.display()
                )
            })?;
        }

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(path = %path.display(), %error, "store file is corrupt; starting empty");
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read store file '{}'", path.display()))
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn flush(&self, entries: &BTreeMap<String, StoredValue>) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded)
            .await
            .with_context(|| format!("failed to write '{}'", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace '{}'", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set_at(&self, key: &str, value: String, written_at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.entries.lock().await;
        let mut next = guard.clone();
        next.insert(key.to_string(), StoredValue::new(value, written_at));
        self.flush(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.entries.lock().await;
        if !guard.contains_key(key) {
            return Ok(());
        }
        let mut next = guard.clone();
        next.remove(key);
        self.flush(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut guard = self.entries.lock().await;
        let mut next = guard.clone();
        next.retain(|key, _| !key.starts_with(prefix));
        let removed = guard.len() - next.len();
        if removed > 0 {
            self.flush(&next).await?;
            *guard = next;
        }
        Ok(removed)
    }
}
