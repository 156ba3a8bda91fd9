use std::time::Duration;

use reqwest::{Method, StatusCode};
use shared::error::{ErrorKind, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErrorCause {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("deadline of {0:?} exceeded")]
    Deadline(Duration),
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Failure of one logical request after the retry policy has run its course.
#[derive(Debug, Error)]
#[error("{method} {url} failed ({kind:?}, retries={retries}): {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub url: String,
    pub method: Method,
    pub status: Option<StatusCode>,
    pub retries: u32,
    #[source]
    pub cause: Option<ErrorCause>,
}

impl ApiError {
    pub fn validation(method: Method, url: impl Into<String>, error: ValidationError) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: error.to_string(),
            url: url.into(),
            method,
            status: None,
            retries: 0,
            cause: Some(ErrorCause::Validation(error)),
        }
    }

    pub fn unavailable(method: Method, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            url: url.into(),
            method,
            status: None,
            retries: 0,
            cause: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
