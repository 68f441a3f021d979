//! Backend contract for the chat, OTP, TTS and STT endpoints.
//!
//! The widget core never talks HTTP directly; everything goes through the
//! [`BackendClient`] trait so tests can run against an in-process fake and
//! hosts can swap transports. [`HttpBackend`] is the production
//! implementation.

pub mod http;

pub use http::HttpBackend;

use crate::auth::AuthMethod;
use async_trait::async_trait;

/// Error code the backend attaches to a 403 that demands authentication.
pub const AUTH_REQUIRED_CODE: &str = "AUTH_REQUIRED";

/// Error code the backend attaches to a 403 caused by an expired
/// subscription. Explicitly not an auth signal.
pub const SUBSCRIPTION_EXPIRED_CODE: &str = "SUBSCRIPTION_EXPIRED";

/// Typed backend failure taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// 403 carrying the auth-required marker, or an explicit auth demand.
    #[error("authentication required{}", fmt_suffix(.message))]
    AuthRequired {
        /// Optional backend-supplied notice.
        message: Option<String>,
    },

    /// 403 caused by a subscription/billing failure. Reported verbatim;
    /// never engages the gate.
    #[error("subscription error: {message}")]
    SubscriptionExpired {
        /// Backend-supplied message, shown to the user as-is.
        message: String,
    },

    /// 403 without a recognized marker. Policy for this case is
    /// configurable (`auth.treat_bare_403_as_auth_required`).
    #[error("forbidden{}", fmt_suffix(.message))]
    Forbidden {
        /// Optional backend-supplied notice.
        message: Option<String>,
    },

    /// 429 from the backend.
    #[error("rate limited")]
    RateLimited,

    /// 413 from the backend (audio payload too large).
    #[error("payload too large")]
    PayloadTooLarge,

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// Any other non-2xx response.
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or status text.
        message: String,
    },

    /// Transport-level failure (DNS, connection, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be parsed.
    #[error("malformed response: {0}")]
    Decode(String),
}

fn fmt_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {m}"),
        None => String::new(),
    }
}

/// Per-widget configuration fetched from the backend at startup.
#[derive(Debug, Clone, Default)]
pub struct WidgetBackendConfig {
    /// Which auth method this widget uses. Resolved once per instance.
    pub auth_method: Option<AuthMethod>,
    /// Optional text shown when the gate engages.
    pub require_auth_text: Option<String>,
    /// Whether the gate must engage before the first message.
    pub require_auth_from_start: bool,
    /// Whether the gate must engage regardless of the message counter.
    pub require_auth: bool,
}

/// An audio clip as delivered by the backend: raw bytes plus the declared
/// content type (decoded from base64 at the transport layer).
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Raw encoded audio bytes.
    pub bytes: bytes::Bytes,
    /// Declared MIME type, e.g. `audio/mpeg` or `audio/wav`.
    pub content_type: String,
}

/// A verified identity attached to chat queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub method: AuthMethod,
    pub identifier: String,
}

/// A successful chat-query response.
#[derive(Debug, Clone)]
pub struct QueryReply {
    /// The bot's answer text.
    pub answer: String,
    /// Optional spoken version of the answer.
    pub audio: Option<AudioClip>,
    /// Whether the backend demands authentication before the next turn.
    pub requires_auth_next: bool,
    /// Auth method hint accompanying `requires_auth_next`.
    pub auth_method: Option<AuthMethod>,
}

/// Backend contract. All operations are async and fail with the typed
/// [`BackendError`] taxonomy.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Fetch per-widget configuration.
    async fn get_config(&self, chatbot_id: &str) -> Result<WidgetBackendConfig, BackendError>;

    /// Check whether a previously verified identity is still valid.
    async fn validate_session(
        &self,
        method: AuthMethod,
        identifier: &str,
        chatbot_id: &str,
    ) -> Result<bool, BackendError>;

    /// Dispatch an OTP to the given target.
    async fn send_otp(
        &self,
        method: AuthMethod,
        identifier: &str,
        chatbot_id: &str,
    ) -> Result<(), BackendError>;

    /// Verify an OTP code. `Ok(false)` means the code was wrong.
    async fn verify_otp(
        &self,
        method: AuthMethod,
        identifier: &str,
        code: &str,
        chatbot_id: &str,
    ) -> Result<bool, BackendError>;

    /// Send a chat query and return the bot reply.
    async fn query(
        &self,
        chatbot_id: &str,
        text: &str,
        session_id: &str,
        identity: Option<&Identity>,
    ) -> Result<QueryReply, BackendError>;

    /// Transcribe a recorded audio payload.
    async fn transcribe(
        &self,
        payload: &[u8],
        format_hint: &str,
    ) -> Result<String, BackendError>;

    /// Synthesize speech for the given text.
    async fn synthesize(&self, text: &str) -> Result<AudioClip, BackendError>;
}
