//! Error types for broker supervision and consumer coordination
//!
//! Only setup failures surface to callers. Steady-state failures inside the
//! monitor and rebuild loops are logged and retried, never returned.

use crate::broker::{BoxError, BrokerError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for mqlink operations
#[derive(Debug, Error)]
pub enum MqError {
    #[error("Failed to connect to broker: {0}")]
    DialFailed(#[source] BrokerError),

    #[error("Failed to open a session: {0}")]
    SessionFailed(#[source] BrokerError),

    #[error("Failed to configure QoS: {0}")]
    QosFailed(#[source] BrokerError),

    #[error("Queue declaration failed: {0}")]
    DeclareFailed(#[source] BoxError),

    #[error("Consumer setup failed: {0}")]
    ConsumerSetupFailed(#[source] BoxError),

    #[error("Listen option `{0}` is required")]
    MissingListenOption(&'static str),

    #[error("Consumers are already listening on this connection")]
    AlreadyListening,

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),
}

impl MqError {
    /// Whether the failure is a connectivity blip worth retrying.
    /// Session, QoS and declaration failures point at configuration instead,
    /// as does a URI that cannot be parsed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MqError::DialFailed(e) if !matches!(e, BrokerError::InvalidUri(_)))
    }

    /// Error text safe to put in logs
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static URI_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z0-9+.\-]*://[^:/@\s]+):[^@\s]+@").expect("static regex is valid")
});

static SECRET_PAIRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|secret)[=:]\s*\S+").expect("static regex is valid")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact broker credentials from text that may carry a connection URI
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = URI_CREDENTIALS
        .replace_all(message, "${1}:***@")
        .to_string();
    sanitized = SECRET_PAIRS.replace_all(&sanitized, "${1}=***").to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for mqlink operations
pub type MqResult<T> = Result<T, MqError>;
