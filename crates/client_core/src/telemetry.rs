//! Bounded in-process buffers of request performance samples and surfaced
//! errors, aggregated on demand and optionally persisted to the store.

use std::{collections::BTreeMap, collections::VecDeque, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::error::ErrorKind;
use storage::KeyValueStore;
use tokio::sync::Mutex;

use crate::error::ApiError;

pub const PERF_SAMPLES_KEY: &str = "telemetry:perf_samples";
pub const TRACKED_ERRORS_KEY: &str = "telemetry:tracked_errors";
pub const DEFAULT_PERF_CAPACITY: usize = 500;
pub const DEFAULT_ERROR_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfSample {
    pub url: String,
    pub method: String,
    pub response_time_ms: u64,
    pub status: Option<u16>,
    pub recorded_at: DateTime<Utc>,
}

impl PerfSample {
    pub fn new(url: &str, method: &str, elapsed: Duration, status: Option<u16>) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_string(),
            response_time_ms: elapsed.as_millis() as u64,
            status,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|code| (200..300).contains(&code))
    }

    /// `METHOD /path`, ignoring host and query string.
    pub fn endpoint(&self) -> String {
        let path = url::Url::parse(&self.url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_else(|_| {
                self.url
                    .split('?')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });
        format!("{} {}", self.method, path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub samples: usize,
    pub average_ms: f64,
    pub success_rate: f64,
}

pub struct PerfRecorder {
    samples: Mutex<RingBuffer<PerfSample>>,
}

impl Default for PerfRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PERF_CAPACITY)
    }
}

impl PerfRecorder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub async fn record(&self, sample: PerfSample) {
        self.samples.lock().await.push(sample);
    }

    pub async fn samples(&self) -> Vec<PerfSample> {
        self.samples.lock().await.iter().cloned().collect()
    }

    pub async fn success_rate(&self) -> Option<f64> {
        success_rate(&self.samples().await)
    }

    pub async fn by_endpoint(&self) -> BTreeMap<String, EndpointStats> {
        stats_by_endpoint(&self.samples().await)
    }

    pub async fn persist(&self, store: &Arc<dyn KeyValueStore>) -> Result<()> {
        let encoded = serde_json::to_string(&self.samples().await)?;
        store.set(PERF_SAMPLES_KEY, encoded).await
    }
}

pub fn success_rate(samples: &[PerfSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let ok = samples.iter().filter(|sample| sample.is_success()).count();
    Some(ok as f64 / samples.len() as f64)
}

pub fn stats_by_endpoint(samples: &[PerfSample]) -> BTreeMap<String, EndpointStats> {
    let mut grouped: BTreeMap<String, Vec<&PerfSample>> = BTreeMap::new();
    for sample in samples {
        grouped.entry(sample.endpoint()).or_default().push(sample);
    }

    grouped
        .into_iter()
        .map(|(endpoint, group)| {
            let total_ms: u64 = group.iter().map(|sample| sample.response_time_ms).sum();
            let ok = group.iter().filter(|sample| sample.is_success()).count();
            let stats = EndpointStats {
                samples: group.len(),
                average_ms: total_ms as f64 / group.len() as f64,
                success_rate: ok as f64 / group.len() as f64,
            };
            (endpoint, stats)
        })
        .collect()
}

pub async fn load_perf_samples(store: &Arc<dyn KeyValueStore>) -> Result<Vec<PerfSample>> {
    match store.get(PERF_SAMPLES_KEY).await? {
        Some(stored) => Ok(serde_json::from_str(&stored.value)?),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedError {
    pub kind: ErrorKind,
    pub message: String,
    pub url: String,
    pub method: String,
    pub status: Option<u16>,
    pub retries: u32,
    pub recorded_at: DateTime<Utc>,
}

impl From<&ApiError> for TrackedError {
    fn from(error: &ApiError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            url: error.url.clone(),
            method: error.method.to_string(),
            status: error.status.map(|status| status.as_u16()),
            retries: error.retries,
            recorded_at: Utc::now(),
        }
    }
}

pub struct ErrorTracker {
    errors: Mutex<RingBuffer<TrackedError>>,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self {
            errors: Mutex::new(RingBuffer::new(DEFAULT_ERROR_CAPACITY)),
        }
    }
}

impl ErrorTracker {
    pub async fn track(&self, error: &ApiError) {
        self.errors.lock().await.push(TrackedError::from(error));
    }

    pub async fn recent(&self) -> Vec<TrackedError> {
        self.errors.lock().await.iter().cloned().collect()
    }

    pub async fn persist(&self, store: &Arc<dyn KeyValueStore>) -> Result<()> {
        let encoded = serde_json::to_string(&self.recent().await)?;
        store.set(TRACKED_ERRORS_KEY, encoded).await
    }
}
