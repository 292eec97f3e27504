//! Error types for a3s-relay

use thiserror::Error;

/// Errors that can occur while relaying between the chat transport and
/// the agent-session service
#[derive(Debug, Error)]
pub enum RelayError {
    /// Transport request exceeded its client-side timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Network-level transport failure (connect, reset, DNS, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bot API answered with `ok: false`
    #[error("Telegram API error ({status}): {description}")]
    Telegram { status: u16, description: String },

    /// Sender is not on the allow-list
    #[error("User {0} is not authorized")]
    Unauthorized(i64),

    /// Remote agent-session service rejected or failed an operation
    #[error("{operation} failed: {message}")]
    Remote { operation: String, message: String },

    /// Remote session does not exist
    #[error("Session {0} not found")]
    SessionNotFound(String),

    /// Chat has no bound remote session
    #[error("No active session")]
    NoActiveSession,

    /// Child-only operation attempted on a root session
    #[error("Session {0} is a root session and cannot be reset this way; use /reset to delete the whole group")]
    RootSession(String),

    /// User picked an index or option that does not exist
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Build a remote-service error for a named operation
    pub fn remote(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Chat-facing failure line for a user-initiated `operation`
    ///
    /// Remote errors already name their operation, so they are shown as is.
    pub fn user_message(&self, operation: &str) -> String {
        match self {
            Self::Remote { .. } => format!("❌ {}", self),
            other => format!("❌ {} failed: {}", operation, other),
        }
    }

    /// Whether the error is a client-side timeout (expected under long polling)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether the error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
