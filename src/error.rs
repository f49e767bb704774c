//! Error types for the copy generation pipeline.
//!
//! Stage workers report failures as [`StageError`], which carries a closed
//! [`ErrorCategory`]. Retry decisions are made by matching on that category, never on
//! message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::StageId;

/// Failure category reported by a stage worker or an internal component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    RateLimit,
    Database,
    ExternalApi,
    Network,
    /// Unknown and internal failures.
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Database => "database",
            ErrorCategory::ExternalApi => "external_api",
            ErrorCategory::Network => "network",
            ErrorCategory::Internal => "internal",
        }
    }

    /// Stable error code used when the caller does not supply one.
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "E_VALIDATION",
            ErrorCategory::Authentication => "E_AUTHENTICATION",
            ErrorCategory::Authorization => "E_AUTHORIZATION",
            ErrorCategory::RateLimit => "E_RATE_LIMIT",
            ErrorCategory::Database => "E_DATABASE",
            ErrorCategory::ExternalApi => "E_EXTERNAL_API",
            ErrorCategory::Network => "E_NETWORK",
            ErrorCategory::Internal => "E_INTERNAL",
        }
    }

    pub fn default_retryable(self) -> bool {
        match self {
            ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Internal => false,
            ErrorCategory::RateLimit
            | ErrorCategory::Database
            | ErrorCategory::ExternalApi
            | ErrorCategory::Network => true,
        }
    }

    /// Base delay before the first retry, `None` for categories that are never retried.
    pub fn default_backoff(self) -> Option<Duration> {
        match self {
            ErrorCategory::RateLimit | ErrorCategory::Database | ErrorCategory::Network => {
                Some(Duration::from_millis(1_000))
            }
            ErrorCategory::ExternalApi => Some(Duration::from_millis(2_000)),
            ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Internal => None,
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            ErrorCategory::Validation | ErrorCategory::RateLimit => Severity::Low,
            ErrorCategory::Network | ErrorCategory::ExternalApi => Severity::Medium,
            ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Database => Severity::High,
            ErrorCategory::Internal => Severity::Critical,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Error raised by a stage worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category} error [{code}]: {message}")]
pub struct StageError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    /// Caller-supplied delay that replaces the computed backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Only honoured for `external_api` failures.
    #[serde(default)]
    pub non_retryable: bool,
}

impl StageError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: category.code().to_string(),
            message: message.into(),
            severity: category.default_severity(),
            retry_after_ms: None,
            non_retryable: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ExternalApi, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, message);
        err.retry_after_ms = retry_after.map(|d| d.as_millis() as u64);
        err
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn mark_non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }

    pub fn is_retryable(&self) -> bool {
        match self.category {
            ErrorCategory::ExternalApi => !self.non_retryable,
            ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::RateLimit
            | ErrorCategory::Database
            | ErrorCategory::Network
            | ErrorCategory::Internal => self.category.default_retryable(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cache entry could not be encoded: {0}")]
    Encoding(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

/// Top-level error for the pipeline API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Stage {stage} failed: {source}")]
    StageFailed {
        stage: StageId,
        #[source]
        source: StageError,
    },

    #[error("A recovery run is already in progress on this queue")]
    RecoveryInProgress,

    #[error("Progress stream error: {0}")]
    Progress(String),

    #[error("Generation aborted")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}
