//! TTL-bounded fallback copies of the last successfully fetched resources and
//! calls. Never authoritative: a live fetch always overwrites it.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::ResourceType,
    protocol::{EmergencyCall, EmergencyResource},
};
use storage::KeyValueStore;
use tracing::warn;

pub const CACHE_PREFIX: &str = "cache:";
pub const EMERGENCIES_KEY: &str = "cache:emergencies";
pub const DEFAULT_CACHE_TTL_SECS: i64 = 600;

pub fn resources_key(resource_type: ResourceType) -> String {
    format!("{CACHE_PREFIX}resources:{}", resource_type.path_segment())
}

#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_ttl(store, Duration::seconds(DEFAULT_CACHE_TTL_SECS))
    }

    pub fn with_ttl(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, payload: &T) -> Result<()> {
        self.save_at(key, payload, Utc::now()).await
    }

    pub async fn save_at<T: Serialize + ?Sized>(
        &self,
        key: &str,
        payload: &T,
        written_at: DateTime<Utc>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(payload)?;
        self.store.set_at(key, encoded, written_at).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now()).await
    }

    /// A stale, unreadable, or undecodable entry is a miss.
    pub async fn get_at<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let stored = match self.store.get_fresh(key, self.ttl, now).await {
            Ok(stored) => stored?,
            Err(error) => {
                warn!(key, %error, "cache: read failed");
                return None;
            }
        };

        match serde_json::from_str(&stored.value) {
            Ok(payload) => Some(payload),
            Err(error) => {
                warn!(key, %error, "cache: dropping undecodable entry");
                if let Err(error) = self.store.delete(key).await {
                    warn!(key, %error, "cache: delete failed");
                }
                None
            }
        }
    }

    /// Rewrites the first cached record matching `matches`. The entry keeps
    /// its original write time so a patch never extends its lifetime.
    /// Returns whether a record was updated.
    pub async fn update_one<T, P, F>(&self, key: &str, matches: P, mutate: F) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        P: Fn(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let Some(stored) = self.store.get_fresh(key, self.ttl, Utc::now()).await? else {
            return Ok(false);
        };
        let mut records: Vec<T> = match serde_json::from_str(&stored.value) {
            Ok(records) => records,
            Err(_) => return Ok(false),
        };
        let Some(record) = records.iter_mut().find(|record| matches(record)) else {
            return Ok(false);
        };
        mutate(record);
        self.save_at(key, &records, stored.written_at).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete_prefix(CACHE_PREFIX).await?;
        Ok(())
    }

    pub async fn save_resources(
        &self,
        resource_type: ResourceType,
        resources: &[EmergencyResource],
    ) -> Result<()> {
        self.save(&resources_key(resource_type), resources).await
    }

    pub async fn resources(&self, resource_type: ResourceType) -> Option<Vec<EmergencyResource>> {
        self.get(&resources_key(resource_type)).await
    }

    pub async fn save_emergencies(&self, calls: &[EmergencyCall]) -> Result<()> {
        self.save(EMERGENCIES_KEY, calls).await
    }

    pub async fn emergencies(&self) -> Option<Vec<EmergencyCall>> {
        self.get(EMERGENCIES_KEY).await
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
