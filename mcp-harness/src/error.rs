//! Error types for the validation harness

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that stop the harness itself (configuration, artifact output).
///
/// Failures of an individual target never surface here; they are recorded as
/// [`CallError`]s in that target's result.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Invalid target base address
    #[error("Invalid target URL '{url}': {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    /// Two targets share a name
    #[error("Duplicate target name '{name}'")]
    DuplicateTarget { name: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// JSON schema could not be compiled
    #[error("Schema error: {message}")]
    SchemaError { message: String },

    /// HTTP client could not be constructed
    #[error("HTTP client error: {message}")]
    ClientError { message: String },

    /// I/O error while writing artifacts
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("JSON error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

impl HarnessError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create a new schema error
    pub fn schema<S: Into<String>>(message: S) -> Self {
        Self::SchemaError {
            message: message.into(),
        }
    }

    /// Create a new HTTP client error
    pub fn client<S: Into<String>>(message: S) -> Self {
        Self::ClientError {
            message: message.into(),
        }
    }
}

/// Why a single protocol call against a target did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    /// Connection-level failure (refused, DNS, broken stream, unexpected HTTP status)
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// Authorization rejected after the credential fallback
    #[error("authorization rejected with HTTP {status}")]
    Auth {
        status: u16,
        credential_attempted: bool,
    },

    /// Response did not parse as a valid envelope of the expected shape
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// Call or target deadline exceeded
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// Well-formed error declared by the target
    #[error("tool invocation error: {message}")]
    ToolInvocation { code: Option<i64>, message: String },

    /// Target no longer recognises the session
    #[error("session rejected with HTTP {status}")]
    SessionRejected { status: u16 },
}

impl CallError {
    /// Short machine-friendly name used in tables and logs
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Transport { .. } => "transport",
            CallError::Auth { .. } => "auth",
            CallError::ProtocolViolation { .. } => "protocol_violation",
            CallError::Timeout { .. } => "timeout",
            CallError::ToolInvocation { .. } => "tool_invocation",
            CallError::SessionRejected { .. } => "session_rejected",
        }
    }

    /// The target answered with a well-formed envelope
    pub fn is_well_formed(&self) -> bool {
        matches!(self, CallError::ToolInvocation { .. })
    }
}
