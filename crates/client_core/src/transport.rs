//! One logical HTTP operation: deadline, retry with capped exponential
//! backoff, error classification, and a performance sample per attempt.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::error::{extract_error_message, ErrorKind};
use tracing::{debug, error, warn};
use url::Url;

use crate::{
    error::{ApiError, ErrorCause},
    telemetry::{ErrorTracker, PerfRecorder, PerfSample},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const MAX_BACKOFF: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `min(base * 2^(attempt-1), max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub options: Option<RequestOptions>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            options: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, pairs: Vec<(String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let encoded = serde_json::to_value(body).map_err(|err| ApiError {
            kind: ErrorKind::Validation,
            message: format!("request body could not be encoded: {err}"),
            url: self.path.clone(),
            method: self.method.clone(),
            status: None,
            retries: 0,
            cause: Some(ErrorCause::Decode(err)),
        })?;
        self.body = Some(encoded);
        Ok(self)
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: StatusCode,
    /// Wall time across all attempts, including backoff sleeps.
    pub response_time: Duration,
    pub retries: u32,
}

struct AttemptFailure {
    kind: ErrorKind,
    message: String,
    status: Option<StatusCode>,
    cause: Option<ErrorCause>,
}

pub struct RequestEngine {
    http: Client,
    base_url: Url,
    defaults: RequestOptions,
    perf: Arc<PerfRecorder>,
    errors: Arc<ErrorTracker>,
}

impl RequestEngine {
    pub fn new(base_url: &str, defaults: RequestOptions) -> Result<Self, url::ParseError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            defaults,
            perf: Arc::new(PerfRecorder::default()),
            errors: Arc::new(ErrorTracker::default()),
        })
    }

    pub fn with_telemetry(mut self, perf: Arc<PerfRecorder>, errors: Arc<ErrorTracker>) -> Self {
        self.perf = perf;
        self.errors = errors;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn defaults(&self) -> RequestOptions {
        self.defaults
    }

    pub fn perf(&self) -> &Arc<PerfRecorder> {
        &self.perf
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    pub fn resolve(&self, request: &ApiRequest) -> Result<Url, url::ParseError> {
        let mut url = self.base_url.join(request.path.trim_start_matches('/'))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<ApiResponse<T>, ApiError> {
        let options = request.options.unwrap_or(self.defaults);
        let url = self.resolve(request).map_err(|err| ApiError {
            kind: ErrorKind::Validation,
            message: format!("invalid request url: {err}"),
            url: request.path.clone(),
            method: request.method.clone(),
            status: None,
            retries: 0,
            cause: Some(ErrorCause::Url(err)),
        })?;
        let method = request.method.clone();
        let max_attempts = options.retry.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let outcome = self.attempt_once(request, &url, options.timeout).await;
            let elapsed = attempt_started.elapsed();

            match outcome {
                Ok((status, body)) => {
                    self.perf
                        .record(PerfSample::new(
                            url.as_str(),
                            method.as_str(),
                            elapsed,
                            Some(status.as_u16()),
                        ))
                        .await;
                    debug!(
                        method = %method,
                        url = %url,
                        status = status.as_u16(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        attempt,
                        will_retry = false,
                        "api: request succeeded"
                    );

                    let data = decode_body::<T>(&body).map_err(|err| ApiError {
                        kind: ErrorKind::Decode,
                        message: format!("unexpected response body: {err}"),
                        url: url.to_string(),
                        method: method.clone(),
                        status: Some(status),
                        retries: attempt - 1,
                        cause: Some(ErrorCause::Decode(err)),
                    });
                    return match data {
                        Ok(data) => Ok(ApiResponse {
                            data,
                            status,
                            response_time: started.elapsed(),
                            retries: attempt - 1,
                        }),
                        Err(err) => {
                            error!(method = %method, url = %url, error = %err, "api: response rejected");
                            self.errors.track(&err).await;
                            Err(err)
                        }
                    };
                }
                Err(failure) => {
                    self.perf
                        .record(PerfSample::new(
                            url.as_str(),
                            method.as_str(),
                            elapsed,
                            failure.status.map(|status| status.as_u16()),
                        ))
                        .await;

                    let will_retry = failure.kind.is_retryable() && attempt < max_attempts;
                    if will_retry {
                        let delay = options.retry.backoff(attempt);
                        warn!(
                            method = %method,
                            url = %url,
                            status = failure.status.map(|status| status.as_u16()),
                            elapsed_ms = elapsed.as_millis() as u64,
                            attempt,
                            will_retry,
                            backoff_ms = delay.as_millis() as u64,
                            kind = ?failure.kind,
                            "api: {}",
                            failure.message
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let err = ApiError {
                        kind: failure.kind,
                        message: failure.message,
                        url: url.to_string(),
                        method: method.clone(),
                        status: failure.status,
                        retries: attempt - 1,
                        cause: failure.cause,
                    };
                    error!(
                        method = %method,
                        url = %url,
                        status = err.status.map(|status| status.as_u16()),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        attempt,
                        will_retry,
                        kind = ?err.kind,
                        "api: {}",
                        err.message
                    );
                    self.errors.track(&err).await;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        request: &ApiRequest,
        url: &Url,
        timeout: Duration,
    ) -> Result<(StatusCode, String), AttemptFailure> {
        let mut builder = self.http.request(request.method.clone(), url.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        // Dropping the in-flight future on deadline aborts the connection.
        let call = async {
            let response = builder.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(AttemptFailure {
                kind: ErrorKind::Timeout,
                message: format!("request timed out after {} ms", timeout.as_millis()),
                status: None,
                cause: Some(ErrorCause::Deadline(timeout)),
            }),
            Ok(Err(err)) => {
                let kind = if err.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Network
                };
                Err(AttemptFailure {
                    kind,
                    message: format!("network error: {err}"),
                    status: err.status(),
                    cause: Some(ErrorCause::Transport(err)),
                })
            }
            Ok(Ok((status, text))) if status.is_success() => Ok((status, text)),
            Ok(Ok((status, text))) => {
                let kind = if status.is_server_error() {
                    ErrorKind::Server
                } else {
                    ErrorKind::Client
                };
                let fallback = format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("error")
                );
                Err(AttemptFailure {
                    kind,
                    message: extract_error_message(&text, &fallback),
                    status: Some(status),
                    cause: None,
                })
            }
        }
    }
}

fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T, serde_json::Error> {
    if body.trim().is_empty() {
        return serde_json::from_str("null");
    }
    serde_json::from_str(body)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
