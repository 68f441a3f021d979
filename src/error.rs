//! Error types for the widget core.

use crate::backend::BackendError;

/// Top-level error type for the widget engine.
#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    /// Local input validation error (bad email, phone, or OTP format).
    /// Never the result of a network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// Authentication gate error (invalid state transition, missing method).
    #[error("auth error: {0}")]
    Auth(String),

    /// Audio decode or playback error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice capture lifecycle error.
    #[error("recording error: {0}")]
    Recording(String),

    /// Backend request failure (typed taxonomy).
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Persistent key-value store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, WidgetError>;
