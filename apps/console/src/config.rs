use std::{collections::HashMap, fs, str::FromStr, time::Duration};

use client_core::{
    orchestrator::{AUTO_FETCH_MAX_SECS, AUTO_FETCH_MIN_SECS},
    OrchestratorConfig, RequestOptions, RetryPolicy,
};
use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "dashboard.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub control_url: String,
    pub auto_url: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub data_poll_ms: u64,
    pub status_poll_ms: u64,
    pub auto_fetch_secs: u64,
    pub auto_fetch_enabled: bool,
    pub elapsed_tick_ms: u64,
    pub cache_ttl_secs: i64,
    pub session_freshness_secs: i64,
    pub resume_prompt_secs: u64,
    pub store: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_url: "http://localhost:8000".into(),
            auto_url: "http://localhost:8001".into(),
            request_timeout_ms: 10_000,
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            data_poll_ms: 2_000,
            status_poll_ms: 500,
            auto_fetch_secs: 5,
            auto_fetch_enabled: true,
            elapsed_tick_ms: 1_000,
            cache_ttl_secs: 600,
            session_freshness_secs: 3_600,
            resume_prompt_secs: 30,
            store: "sqlite://./data/dashboard.db".into(),
        }
    }
}

impl Settings {
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions::default()
            .with_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_retry(RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            data_interval: Duration::from_millis(self.data_poll_ms),
            status_interval: Duration::from_millis(self.status_poll_ms),
            auto_fetch_interval: Duration::from_secs(self.auto_fetch_secs),
            elapsed_interval: Duration::from_millis(self.elapsed_tick_ms),
            auto_fetch_enabled: self.auto_fetch_enabled,
            cache_fallback: true,
            cache_ttl: chrono::Duration::seconds(self.cache_ttl_secs),
            freshness_window: chrono::Duration::seconds(self.session_freshness_secs),
        }
    }

    pub fn resume_prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.resume_prompt_secs)
    }
}

pub fn load_settings() -> Settings {
    let raw = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(raw.as_deref(), |name| std::env::var(name).ok())
}

/// Layers defaults, then the optional TOML file, then environment variables.
/// Each key accepts a `DASHBOARD_` name and an `APP__` name; the latter wins.
pub fn load_settings_from(raw_toml: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = raw_toml {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    apply(&mut settings, &key, &value);
                }
            }
            Err(error) => warn!(%error, file = SETTINGS_FILE, "config: ignoring malformed settings file"),
        }
    }

    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(value) = env(&format!("DASHBOARD_{upper}")) {
            apply(&mut settings, key, &value);
        }
        if let Some(value) = env(&format!("APP__{upper}")) {
            apply(&mut settings, key, &value);
        }
    }

    if !(AUTO_FETCH_MIN_SECS..=AUTO_FETCH_MAX_SECS).contains(&settings.auto_fetch_secs) {
        warn!(
            value = settings.auto_fetch_secs,
            "config: auto_fetch_secs out of range, using default"
        );
        settings.auto_fetch_secs = Settings::default().auto_fetch_secs;
    }

    settings
}

const KEYS: [&str; 14] = [
    "control_url",
    "auto_url",
    "request_timeout_ms",
    "max_attempts",
    "retry_base_delay_ms",
    "data_poll_ms",
    "status_poll_ms",
    "auto_fetch_secs",
    "auto_fetch_enabled",
    "elapsed_tick_ms",
    "cache_ttl_secs",
    "session_freshness_secs",
    "resume_prompt_secs",
    "store",
];

fn apply(settings: &mut Settings, key: &str, value: &str) {
    match key {
        "control_url" => settings.control_url = value.trim().to_string(),
        "auto_url" => settings.auto_url = value.trim().to_string(),
        "store" => settings.store = value.trim().to_string(),
        "request_timeout_ms" => parse_into(key, value, &mut settings.request_timeout_ms),
        "max_attempts" => parse_into(key, value, &mut settings.max_attempts),
        "retry_base_delay_ms" => parse_into(key, value, &mut settings.retry_base_delay_ms),
        "data_poll_ms" => parse_into(key, value, &mut settings.data_poll_ms),
        "status_poll_ms" => parse_into(key, value, &mut settings.status_poll_ms),
        "auto_fetch_secs" => parse_into(key, value, &mut settings.auto_fetch_secs),
        "auto_fetch_enabled" => parse_into(key, value, &mut settings.auto_fetch_enabled),
        "elapsed_tick_ms" => parse_into(key, value, &mut settings.elapsed_tick_ms),
        "cache_ttl_secs" => parse_into(key, value, &mut settings.cache_ttl_secs),
        "session_freshness_secs" => parse_into(key, value, &mut settings.session_freshness_secs),
        "resume_prompt_secs" => parse_into(key, value, &mut settings.resume_prompt_secs),
        unknown => warn!(key = unknown, "config: unknown setting ignored"),
    }
}

fn parse_into<T: FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "config: malformed value ignored"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
