//! Crate-level error type
//!
//! Each layer has its own `thiserror` enum; `SyncError` wraps them so the
//! device facade and the CLI can use `?` across layers.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Longest error text handed to indicators and status output
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passphrase|psk|key|secret|sas|sig)(\s*[=:]\s*)\S+")
        .expect("secret pattern is valid")
});

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Frame error: {0}")]
    Frame(#[from] crate::frame::FrameError),

    #[error("Twin error: {0}")]
    Twin(#[from] crate::twin::TwinError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),

    #[error("Command error: {0}")]
    Command(#[from] crate::telemetry::CommandError),

    #[error("Engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl SyncError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Error text safe to show outside the device
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Mask credential values in `key=value` or `key: value` form
pub fn redact_secrets(text: &str) -> String {
    SECRET_PATTERN.replace_all(text, "${1}${2}***").into_owned()
}

/// Redact credentials and cap the length of an error message
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = redact_secrets(message);

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

pub type SyncResult<T> = Result<T, SyncError>;
