//! # Error Types
//!
//! Only `TerminalConnectionFailure` is expected to cross the component
//! boundary at runtime. Transport errors are retried inside the feed
//! connection and invalid subscriptions are rejected synchronously.

use thiserror::Error;

/// Errors raised by the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A transport-level failure. Retried according to the backoff policy.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A subscription was rejected at creation time.
    #[error("Invalid subscription for widget '{widget_id}': {reason}")]
    InvalidSubscription { widget_id: String, reason: String },

    /// The retry budget was exhausted. The connection stays closed until `reopen()`.
    #[error("Connection closed after {attempts} consecutive failures (last error: {last_error})")]
    TerminalConnectionFailure { attempts: u32, last_error: String },

    /// A topic identifier was empty or blank.
    #[error("Invalid topic identifier: {0:?}")]
    InvalidTopic(String),
}

/// Errors raised while loading [`crate::settings::SyncSettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error occurred: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}
