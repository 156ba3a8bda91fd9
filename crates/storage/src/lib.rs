//! Key-value persistence for dashboard state: session snapshots, cached
//! payloads, and observability ring buffers. Every value is stored as a JSON
//! string together with the time it was written.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod file;
mod memory;
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    pub written_at: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(value: impl Into<String>, written_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            written_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.written_at
    }

    /// An entry is live while its age is strictly below `ttl`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) >= ttl
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;
    async fn set_at(&self, key: &str, value: String, written_at: DateTime<Utc>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Removes every key starting with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.set_at(key, value, Utc::now()).await
    }

    /// Returns the entry only if it is younger than `ttl` at `now`.
    async fn get_fresh(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredValue>> {
        Ok(self
            .get(key)
            .await?
            .filter(|stored| !stored.is_expired(ttl, now)))
    }
}

/// Opens a store from a locator: `memory`, a path ending in `.json`, or a
/// `sqlite:` URL.
pub async fn open_store(locator: &str) -> Result<Arc<dyn KeyValueStore>> {
    let locator = locator.trim();
    if locator.is_empty() || locator.eq_ignore_ascii_case("memory") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if locator.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::new(locator).await?));
    }
    if locator.ends_with(".json") {
        return Ok(Arc::new(FileStore::open(locator).await?));
    }
    Ok(Arc::new(
        SqliteStore::new(&format!("sqlite://{}", locator.replace('\\', "/"))).await?,
    ))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
