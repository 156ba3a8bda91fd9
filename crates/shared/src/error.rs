use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure: connect, DNS, reset.
    Network,
    /// Deadline exceeded; the in-flight call was aborted.
    Timeout,
    /// 5xx response.
    Server,
    /// 4xx response.
    Client,
    /// Local precondition failed before any network call.
    Validation,
    /// 2xx response whose body did not match the endpoint type.
    Decode,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }
}

/// Error payload as returned by the backends. Either field may be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    fn best_message(&self) -> Option<String> {
        let detail = match &self.detail {
            Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
            Some(Value::Null) | None => None,
            Some(Value::String(_)) => None,
            Some(other) => Some(other.to_string()),
        };
        detail.or_else(|| {
            self.message
                .as_ref()
                .filter(|text| !text.trim().is_empty())
                .cloned()
        })
    }
}

/// Picks the operator-facing message for a failed response: JSON `detail`,
/// then JSON `message`, then the raw body text, then the status fallback.
pub fn extract_error_message(body: &str, status_fallback: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.best_message() {
            return message;
        }
    }

    let raw = body.trim();
    if !raw.is_empty() {
        return raw.to_string();
    }

    status_fallback.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(i64),
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
}

pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
