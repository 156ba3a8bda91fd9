//! Persists a snapshot of the running session so a restarted client can offer
//! to resume it. The backend does not keep per-client progress, so local
//! counters and start time only survive through this record.

use std::{future::Future, sync::Arc, time::Duration as StdDuration};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::protocol::ResetParams;
use storage::KeyValueStore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{DispatchTotals, RunMode, StartParams};

pub const SNAPSHOT_KEY: &str = "session:snapshot";
pub const PROMPT_SHOWN_KEY: &str = "session:resume_prompt_shown";
pub const DEFAULT_FRESHNESS_SECS: i64 = 3_600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub seed: String,
    pub target_dispatches: u32,
    pub max_active_calls: u32,
    pub dispatched: u64,
    pub distance: f64,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    pub last_updated: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn begin(params: &StartParams, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            seed: params.seed.clone(),
            target_dispatches: params.target_dispatches,
            max_active_calls: params.max_active_calls,
            dispatched: 0,
            distance: 0.0,
            started_at: now,
            mode: params.mode,
            last_updated: now,
        }
    }

    /// Resumable only while strictly younger than `window`.
    pub fn is_resumable(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_updated < window
    }

    pub fn totals(&self) -> DispatchTotals {
        DispatchTotals {
            dispatched: self.dispatched,
            distance: self.distance,
        }
    }

    pub fn start_params(&self) -> StartParams {
        StartParams {
            seed: self.seed.clone(),
            target_dispatches: self.target_dispatches,
            max_active_calls: self.max_active_calls,
            mode: self.mode,
        }
    }

    pub fn reset_params(&self) -> ResetParams {
        self.start_params().reset_params()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Resume,
    Decline,
}

pub struct SessionRecovery {
    store: Arc<dyn KeyValueStore>,
    window: Duration,
    run_id: Uuid,
}

impl SessionRecovery {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_window(store, Duration::seconds(DEFAULT_FRESHNESS_SECS))
    }

    pub fn with_window(store: Arc<dyn KeyValueStore>, window: Duration) -> Self {
        Self {
            store,
            window,
            run_id: Uuid::new_v4(),
        }
    }

    /// Identifies this process; the resume prompt is offered at most once
    /// per run id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.store
            .set_at(
                SNAPSHOT_KEY,
                serde_json::to_string(snapshot)?,
                snapshot.last_updated,
            )
            .await
    }

    pub async fn load(&self) -> Result<Option<SessionSnapshot>> {
        let Some(stored) = self.store.get(SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&stored.value) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(error) => {
                warn!(%error, "recovery: discarding unreadable snapshot");
                self.store.delete(SNAPSHOT_KEY).await?;
                Ok(None)
            }
        }
    }

    /// Writes new counters into the stored snapshot. Returns false when no
    /// snapshot exists.
    pub async fn record_progress(&self, totals: DispatchTotals, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut snapshot) = self.load().await? else {
            return Ok(false);
        };
        snapshot.dispatched = totals.dispatched;
        snapshot.distance = totals.distance;
        snapshot.last_updated = now;
        self.save(&snapshot).await?;
        Ok(true)
    }

    /// Adds one dispatch to the stored counters, for dispatches made outside
    /// the orchestrator that owns the session. Returns false when no snapshot
    /// exists.
    pub async fn add_progress(&self, quantity: u32, distance: f64, now: DateTime<Utc>) -> Result<bool> {
        let Some(snapshot) = self.load().await? else {
            return Ok(false);
        };
        let mut totals = snapshot.totals();
        totals.dispatched += u64::from(quantity);
        totals.distance += distance;
        self.record_progress(totals, now).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(SNAPSHOT_KEY).await
    }

    /// Returns the snapshot to offer for resume, if any. A snapshot past the
    /// freshness window is deleted and never offered; one already offered
    /// during this run is not offered again.
    pub async fn offer(&self, now: DateTime<Utc>) -> Result<Option<SessionSnapshot>> {
        let Some(snapshot) = self.load().await? else {
            return Ok(None);
        };
        if !snapshot.is_resumable(now, self.window) {
            info!(
                session = %snapshot.session_id,
                age_secs = (now - snapshot.last_updated).num_seconds(),
                "recovery: snapshot expired"
            );
            self.clear().await?;
            return Ok(None);
        }

        let run_id = self.run_id.to_string();
        if let Some(shown) = self.store.get(PROMPT_SHOWN_KEY).await? {
            if shown.value == run_id {
                debug!(session = %snapshot.session_id, "recovery: prompt already shown");
                return Ok(None);
            }
        }
        self.store.set_at(PROMPT_SHOWN_KEY, run_id, now).await?;
        Ok(Some(snapshot))
    }

    /// Waits for the operator's answer. Declining or letting `timeout`
    /// elapse discards the snapshot.
    pub async fn resolve_prompt<F>(
        &self,
        snapshot: SessionSnapshot,
        decision: F,
        timeout: StdDuration,
    ) -> Result<Option<SessionSnapshot>>
    where
        F: Future<Output = Option<ResumeDecision>>,
    {
        match tokio::time::timeout(timeout, decision).await {
            Ok(Some(ResumeDecision::Resume)) => {
                info!(session = %snapshot.session_id, "recovery: resuming");
                Ok(Some(snapshot))
            }
            Ok(_) => {
                info!(session = %snapshot.session_id, "recovery: resume declined");
                self.clear().await?;
                Ok(None)
            }
            Err(_) => {
                info!(session = %snapshot.session_id, timeout_ms = timeout.as_millis() as u64, "recovery: resume prompt expired");
                self.clear().await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
