//! Error types for toolgate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single violated validation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Field the rule applies to (e.g. `name`, `parameters.path.type`)
    pub field: String,
    /// Human-readable description of the violation
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error raised by a tool's own execution function.
///
/// The gateway never rewrites it; callers receive exactly what the tool produced.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Builder: set a machine-readable code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Builder: attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Machine-readable error kind, used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AuthenticationFailed,
    PermissionDenied,
    RateLimitExceeded,
    QuotaExceeded,
    ToolNotFound,
    ValidationFailed,
    HandshakeFailed,
    EncryptionFailed,
    DecryptionFailed,
    ToolFailed,
    Configuration,
    Internal,
}

/// General toolgate error type
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Permission denied: user '{user_id}' may not {action} '{resource}'")]
    PermissionDenied {
        user_id: String,
        action: String,
        resource: String,
    },

    #[error("Rate limit exceeded for '{client_key}', retry after {retry_after_secs}s")]
    RateLimitExceeded {
        client_key: String,
        limit: u32,
        retry_after_secs: u64,
    },

    #[error("Quota exceeded for '{subject_key}': {used}/{limit} used, resets at {}", reset_at.to_rfc3339())]
    QuotaExceeded {
        subject_key: String,
        limit: u64,
        used: u64,
        reset_at: DateTime<Utc>,
    },

    #[error("Tool '{name}' not found{}", reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default())]
    ToolNotFound { name: String, reason: Option<String> },

    #[error("Validation failed: {}", join_issues(issues))]
    ValidationFailed { issues: Vec<ValidationIssue> },

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// Shorthand for a tool lookup miss without extra context
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound {
            name: name.into(),
            reason: None,
        }
    }

    /// Wire-level kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            Self::EncryptionFailed(_) => ErrorKind::EncryptionFailed,
            Self::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            Self::Tool(_) => ErrorKind::ToolFailed,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) => ErrorKind::Internal,
        }
    }

    /// Seconds the caller should wait before retrying, if known
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
