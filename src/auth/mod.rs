//! Authentication gate: message counting, OTP challenge, persisted gate state.
//!
//! The gate decides, for every outgoing message, whether sending is
//! permitted, and drives the OTP protocol end to end. All gate state that
//! must survive a host restart (message counter, gate flag, resend-window
//! start, verified identity) lives in the [`KeyValueStore`]; the in-memory
//! state machine is reconstructed from it on [`AuthGate::initialize`].

pub mod validate;

use crate::backend::{BackendClient, BackendError, Identity, WidgetBackendConfig};
use crate::config::AuthConfig;
use crate::error::{Result, WidgetError};
use crate::store::{KeyValueStore, keys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// How the user proves their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// OTP delivered by email.
    Email,
    /// OTP delivered to a phone number (WhatsApp channel).
    Phone,
}

impl AuthMethod {
    /// Stable wire identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }

    /// Parse a backend-supplied method name. `whatsapp` is an alias for
    /// the phone channel.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "phone" | "whatsapp" => Some(Self::Phone),
            _ => None,
        }
    }
}

/// Gate state. Exactly one variant is active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No gate triggered yet; sending is permitted.
    Open,
    /// The gate is engaged; the user must verify before sending again.
    Gated,
    /// An OTP has been dispatched and not yet verified.
    AwaitingOtp {
        /// The email address or phone number the code was sent to.
        target: String,
        /// When the code was dispatched.
        sent_at: DateTime<Utc>,
        /// When a resend becomes permitted.
        resend_deadline: DateTime<Utc>,
    },
    /// Identity verified. Never left automatically.
    Verified {
        method: AuthMethod,
        identifier: String,
    },
}

/// Outcome of the most recent OTP verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtpAttemptOutcome {
    #[default]
    Pending,
    Success,
    Invalid,
    Error,
}

/// Fixed-length entry buffer for the OTP code, one slot per digit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpCodeBuffer {
    slots: Vec<Option<char>>,
}

impl OtpCodeBuffer {
    #[must_use]
    pub fn new(length: usize) -> Self {
        Self {
            slots: vec![None; length],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Set one slot to a digit.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an out-of-range slot or a non-digit.
    pub fn set_slot(&mut self, index: usize, digit: char) -> Result<()> {
        if !digit.is_ascii_digit() {
            return Err(WidgetError::Validation(format!(
                "'{digit}' is not a digit"
            )));
        }
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            WidgetError::Validation(format!("OTP slot {index} is out of range"))
        })?;
        *slot = Some(digit);
        Ok(())
    }

    /// Clear one slot.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an out-of-range slot.
    pub fn clear_slot(&mut self, index: usize) -> Result<()> {
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            WidgetError::Validation(format!("OTP slot {index} is out of range"))
        })?;
        *slot = None;
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// The assembled code, if every slot is filled.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        if !self.is_complete() {
            return None;
        }
        Some(self.slots.iter().flatten().collect())
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<char>] {
        &self.slots
    }
}

/// The live OTP challenge while the gate is in `AwaitingOtp`.
#[derive(Debug, Clone)]
pub struct OtpChallenge {
    /// Digit entry buffer.
    pub code: OtpCodeBuffer,
    /// Outcome of the latest verification attempt.
    pub outcome: OtpAttemptOutcome,
}

impl OtpChallenge {
    #[must_use]
    fn new(length: usize) -> Self {
        Self {
            code: OtpCodeBuffer::new(length),
            outcome: OtpAttemptOutcome::Pending,
        }
    }
}

/// A backend indication that authentication is (or may be) required.
#[derive(Debug, Clone)]
pub enum AuthSignal {
    /// The chat response explicitly flagged the next turn as auth-gated.
    RequiresAuthNext {
        /// Method hint accompanying the flag.
        method: Option<AuthMethod>,
    },
    /// A query failed; whether this engages the gate depends on the error.
    Failure(BackendError),
}

/// Per-widget authentication gate.
pub struct AuthGate {
    chatbot_id: String,
    session_id: String,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn BackendClient>,
    config: AuthConfig,
    method: AuthMethod,
    /// Whether the method came from backend config (and is thus immutable)
    /// rather than the fallback default.
    method_resolved: bool,
    state: AuthState,
    challenge: Option<OtpChallenge>,
}

impl AuthGate {
    /// Create a gate in the `Open` state. Call [`initialize`](Self::initialize)
    /// before use to reconstruct persisted state.
    #[must_use]
    pub fn new(
        chatbot_id: impl Into<String>,
        session_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn BackendClient>,
        config: AuthConfig,
    ) -> Self {
        Self {
            chatbot_id: chatbot_id.into(),
            session_id: session_id.into(),
            store,
            backend,
            config,
            method: AuthMethod::Email,
            method_resolved: false,
            state: AuthState::Open,
            challenge: None,
        }
    }

    /// Reconstruct gate state from the store and revalidate any saved
    /// identity with the backend.
    ///
    /// Returns a user-facing notice when a previously verified session has
    /// expired. Backend failure here is non-fatal: the widget degrades to
    /// the gated experience.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store itself is unreadable.
    pub async fn initialize(
        &mut self,
        widget_config: &WidgetBackendConfig,
    ) -> Result<Option<String>> {
        if let Some(method) = widget_config.auth_method {
            self.method = method;
            self.method_resolved = true;
        }

        if let Some(identifier) = self.store.get(&keys::identity(self.method))? {
            match self
                .backend
                .validate_session(self.method, &identifier, &self.chatbot_id)
                .await
            {
                Ok(true) => {
                    info!("saved {} identity revalidated", self.method.as_str());
                    self.enter_verified(identifier)?;
                    return Ok(None);
                }
                Ok(false) => {
                    info!("saved identity no longer valid, re-entering gate");
                }
                Err(e) => {
                    warn!("session revalidation failed: {e}");
                }
            }
            self.store.remove(&keys::identity(self.method))?;
            self.state = AuthState::Gated;
            return Ok(Some(
                "Your session has expired. Please verify again to continue.".to_owned(),
            ));
        }

        if widget_config.require_auth_from_start || widget_config.require_auth {
            self.state = AuthState::Gated;
        } else if self.gate_flag_persisted()? {
            self.state = AuthState::Gated;
        } else if self.message_count()? >= self.config.message_threshold {
            self.state = AuthState::Gated;
        }
        Ok(None)
    }

    /// Whether sending a message is currently permitted.
    #[must_use]
    pub fn may_proceed(&self) -> bool {
        matches!(self.state, AuthState::Open | AuthState::Verified { .. })
    }

    /// Record one user-originated message. While unverified this increments
    /// the persisted counter; reaching the threshold engages the gate.
    ///
    /// Returns the counter value after the update.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn record_outgoing_message(&mut self) -> Result<u32> {
        if matches!(self.state, AuthState::Verified { .. }) {
            return self.message_count();
        }
        // Read-modify-write against the latest persisted value so multiple
        // widget instances sharing one store stay consistent.
        let count = self.message_count()?.saturating_add(1);
        let key = keys::message_count(&self.chatbot_id, &self.session_id);
        self.store.set(&key, &count.to_string())?;
        if count >= self.config.message_threshold && self.state == AuthState::Open {
            info!("message threshold reached ({count}), engaging auth gate");
            self.state = AuthState::Gated;
        }
        Ok(count)
    }

    /// Request (or re-request) an OTP for `target`.
    ///
    /// Valid only while the gate is engaged and no resend cool-down is
    /// active. The identifier is validated locally first; a validation
    /// failure performs no network call.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed identifier, an auth error
    /// for an invalid state or active cool-down, or the backend failure.
    pub async fn request_otp(&mut self, target: &str) -> Result<()> {
        if !matches!(
            self.state,
            AuthState::Gated | AuthState::AwaitingOtp { .. }
        ) {
            return Err(WidgetError::Auth(
                "no authentication gate is active".to_owned(),
            ));
        }
        let remaining = self.resend_remaining_secs()?;
        if remaining > 0 {
            return Err(WidgetError::Auth(format!(
                "please wait {remaining}s before requesting another code"
            )));
        }

        let target = target.trim().to_owned();
        validate::validate_identifier(self.method, &target)?;

        self.backend
            .send_otp(self.method, &target, &self.chatbot_id)
            .await?;

        let now = Utc::now();
        self.store.set(
            &keys::otp_resend_started(&self.chatbot_id, &self.session_id),
            &now.timestamp().to_string(),
        )?;
        self.state = AuthState::AwaitingOtp {
            target,
            sent_at: now,
            resend_deadline: now
                + chrono::Duration::seconds(self.config.resend_cooldown_secs as i64),
        };
        self.challenge = Some(OtpChallenge::new(self.config.otp_length));
        info!("OTP dispatched via {}", self.method.as_str());
        Ok(())
    }

    /// Seconds left in the resend cool-down window, reconstructed from the
    /// persisted window-start timestamp. Zero when no window is active, so a
    /// host restart never shortens or restarts the window.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn resend_remaining_secs(&self) -> Result<u64> {
        let key = keys::otp_resend_started(&self.chatbot_id, &self.session_id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(0);
        };
        let Ok(started) = raw.parse::<i64>() else {
            return Ok(0);
        };
        let elapsed = Utc::now().timestamp() - started;
        if elapsed < 0 {
            return Ok(self.config.resend_cooldown_secs);
        }
        Ok(self
            .config
            .resend_cooldown_secs
            .saturating_sub(elapsed as u64))
    }

    /// Verify an OTP code.
    ///
    /// On success the verified identifier is persisted, the gate flag and
    /// message counter are cleared, and the gate becomes `Verified`. On a
    /// wrong code the gate stays in `AwaitingOtp` and nothing persisted
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed code, an auth error when
    /// no challenge is active, or the backend failure.
    pub async fn verify_otp(&mut self, code: &str) -> Result<bool> {
        let AuthState::AwaitingOtp { target, .. } = &self.state else {
            return Err(WidgetError::Auth("no OTP challenge is active".to_owned()));
        };
        let target = target.clone();
        validate::validate_otp_code(code, self.config.otp_length)?;

        match self
            .backend
            .verify_otp(self.method, &target, code, &self.chatbot_id)
            .await
        {
            Ok(true) => {
                self.store.set(&keys::identity(self.method), &target)?;
                self.enter_verified(target)?;
                Ok(true)
            }
            Ok(false) => {
                if let Some(challenge) = &mut self.challenge {
                    challenge.outcome = OtpAttemptOutcome::Invalid;
                }
                Ok(false)
            }
            Err(e) => {
                if let Some(challenge) = &mut self.challenge {
                    challenge.outcome = OtpAttemptOutcome::Error;
                }
                Err(e.into())
            }
        }
    }

    /// Explicit user cancellation of the OTP entry: back to `Gated`.
    pub fn cancel_otp(&mut self) {
        if matches!(self.state, AuthState::AwaitingOtp { .. }) {
            self.state = AuthState::Gated;
            self.challenge = None;
        }
    }

    /// Apply a backend auth signal. Engages the gate and persists the gate
    /// flag for auth-required signals; subscription failures leave the state
    /// untouched. Returns whether the gate was engaged.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate flag cannot be persisted.
    pub fn apply_backend_auth_signal(&mut self, signal: &AuthSignal) -> Result<bool> {
        let engage = match signal {
            AuthSignal::RequiresAuthNext { .. } => true,
            AuthSignal::Failure(BackendError::AuthRequired { .. }) => true,
            AuthSignal::Failure(BackendError::Forbidden { .. }) => {
                self.config.treat_bare_403_as_auth_required
            }
            AuthSignal::Failure(_) => false,
        };
        if !engage {
            return Ok(false);
        }
        // Verified is never left automatically; an in-flight OTP entry is
        // not discarded either.
        if matches!(
            self.state,
            AuthState::Verified { .. } | AuthState::AwaitingOtp { .. }
        ) {
            return Ok(false);
        }
        if let AuthSignal::RequiresAuthNext {
            method: Some(method),
        } = signal
        {
            if !self.method_resolved {
                self.method = *method;
                self.method_resolved = true;
            }
        }
        self.state = AuthState::Gated;
        self.store.set(
            &keys::gate_flag(&self.chatbot_id, &self.session_id),
            "1",
        )?;
        info!("auth gate engaged by backend signal");
        Ok(true)
    }

    /// Whether a gate flag from a prior session is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn gate_flag_persisted(&self) -> Result<bool> {
        let key = keys::gate_flag(&self.chatbot_id, &self.session_id);
        Ok(self.store.get(&key)?.is_some())
    }

    /// Current unauthenticated message count from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn message_count(&self) -> Result<u32> {
        let key = keys::message_count(&self.chatbot_id, &self.session_id);
        Ok(self
            .store
            .get(&key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// The verified identity, if any, for attaching to chat queries.
    #[must_use]
    pub fn verified_identity(&self) -> Option<Identity> {
        match &self.state {
            AuthState::Verified { method, identifier } => Some(Identity {
                method: *method,
                identifier: identifier.clone(),
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    #[must_use]
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    #[must_use]
    pub fn challenge(&self) -> Option<&OtpChallenge> {
        self.challenge.as_ref()
    }

    #[must_use]
    pub fn challenge_mut(&mut self) -> Option<&mut OtpChallenge> {
        self.challenge.as_mut()
    }

    fn enter_verified(&mut self, identifier: String) -> Result<()> {
        self.store
            .remove(&keys::gate_flag(&self.chatbot_id, &self.session_id))?;
        self.store
            .remove(&keys::message_count(&self.chatbot_id, &self.session_id))?;
        self.store
            .remove(&keys::otp_resend_started(&self.chatbot_id, &self.session_id))?;
        if let Some(challenge) = &mut self.challenge {
            challenge.outcome = OtpAttemptOutcome::Success;
        }
        self.challenge = None;
        self.state = AuthState::Verified {
            method: self.method,
            identifier,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::store::MemoryKv;
    use crate::test_utils::FakeBackend;

    fn gate_with(store: Arc<MemoryKv>, backend: Arc<FakeBackend>) -> AuthGate {
        AuthGate::new("bot", "sess", store, backend, AuthConfig::default())
    }

    fn resolved_config() -> WidgetBackendConfig {
        WidgetBackendConfig {
            auth_method: Some(AuthMethod::Email),
            ..WidgetBackendConfig::default()
        }
    }

    #[tokio::test]
    async fn counter_engages_gate_at_threshold() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, backend);
        gate.initialize(&resolved_config()).await.unwrap();

        assert!(gate.may_proceed());
        assert_eq!(gate.record_outgoing_message().unwrap(), 1);
        assert!(gate.may_proceed());
        assert_eq!(gate.record_outgoing_message().unwrap(), 2);
        assert_eq!(*gate.state(), AuthState::Gated);
        assert!(!gate.may_proceed());
    }

    #[tokio::test]
    async fn persisted_counter_re_enters_gate_after_reload() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());

        {
            let mut gate = gate_with(Arc::clone(&store), Arc::clone(&backend));
            gate.initialize(&resolved_config()).await.unwrap();
            gate.record_outgoing_message().unwrap();
            gate.record_outgoing_message().unwrap();
        }

        // Fresh instance over the same store simulates a page reload.
        let mut reloaded = gate_with(store, backend);
        reloaded.initialize(&resolved_config()).await.unwrap();
        assert_eq!(*reloaded.state(), AuthState::Gated);
    }

    #[tokio::test]
    async fn request_otp_rejects_bad_identifier_without_network() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, Arc::clone(&backend));
        gate.initialize(&resolved_config()).await.unwrap();
        gate.record_outgoing_message().unwrap();
        gate.record_outgoing_message().unwrap();

        let err = gate.request_otp("not-an-email").await.unwrap_err();
        assert!(matches!(err, WidgetError::Validation(_)));
        assert_eq!(backend.otp_sends(), 0);
    }

    #[tokio::test]
    async fn request_otp_enforces_cooldown() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, Arc::clone(&backend));
        gate.initialize(&resolved_config()).await.unwrap();
        gate.record_outgoing_message().unwrap();
        gate.record_outgoing_message().unwrap();

        gate.request_otp("user@example.com").await.unwrap();
        assert!(matches!(gate.state(), AuthState::AwaitingOtp { .. }));
        assert_eq!(backend.otp_sends(), 1);

        let err = gate.request_otp("user@example.com").await.unwrap_err();
        assert!(matches!(err, WidgetError::Auth(_)));
        assert_eq!(backend.otp_sends(), 1);
    }

    #[tokio::test]
    async fn resend_window_is_reconstructed_from_persisted_timestamp() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let gate = gate_with(Arc::clone(&store), backend);

        // Window started 30s ago (of a 60s window), as after a reload.
        let started = Utc::now().timestamp() - 30;
        store
            .set(
                &keys::otp_resend_started("bot", "sess"),
                &started.to_string(),
            )
            .unwrap();

        let remaining = gate.resend_remaining_secs().unwrap();
        assert!((29..=31).contains(&remaining), "remaining = {remaining}");
    }

    #[tokio::test]
    async fn verify_otp_success_resets_persisted_state() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(Arc::clone(&store), backend);
        gate.initialize(&resolved_config()).await.unwrap();
        gate.record_outgoing_message().unwrap();
        gate.record_outgoing_message().unwrap();
        gate.request_otp("user@example.com").await.unwrap();

        assert!(gate.verify_otp("123456").await.unwrap());
        assert!(matches!(gate.state(), AuthState::Verified { .. }));
        assert!(gate.may_proceed());
        assert_eq!(gate.message_count().unwrap(), 0);
        assert!(!gate.gate_flag_persisted().unwrap());
        assert_eq!(
            store.get(&keys::identity(AuthMethod::Email)).unwrap(),
            Some("user@example.com".to_owned())
        );
        assert!(gate.challenge().is_none());
    }

    #[tokio::test]
    async fn verify_otp_wrong_code_keeps_state() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(Arc::clone(&store), backend);
        gate.initialize(&resolved_config()).await.unwrap();
        gate.record_outgoing_message().unwrap();
        gate.record_outgoing_message().unwrap();
        gate.request_otp("user@example.com").await.unwrap();
        let count_before = gate.message_count().unwrap();

        assert!(!gate.verify_otp("000000").await.unwrap());
        assert!(matches!(gate.state(), AuthState::AwaitingOtp { .. }));
        assert_eq!(gate.message_count().unwrap(), count_before);
        assert_eq!(
            gate.challenge().unwrap().outcome,
            OtpAttemptOutcome::Invalid
        );
        assert!(store.get(&keys::identity(AuthMethod::Email)).unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_code_is_rejected_locally() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, Arc::clone(&backend));
        gate.initialize(&resolved_config()).await.unwrap();
        gate.record_outgoing_message().unwrap();
        gate.record_outgoing_message().unwrap();
        gate.request_otp("user@example.com").await.unwrap();

        let err = gate.verify_otp("12ab56").await.unwrap_err();
        assert!(matches!(err, WidgetError::Validation(_)));
        assert_eq!(backend.otp_verifications(), 0);
    }

    #[tokio::test]
    async fn auth_signal_engages_and_persists_gate() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, backend);
        gate.initialize(&resolved_config()).await.unwrap();

        let engaged = gate
            .apply_backend_auth_signal(&AuthSignal::Failure(BackendError::AuthRequired {
                message: None,
            }))
            .unwrap();
        assert!(engaged);
        assert_eq!(*gate.state(), AuthState::Gated);
        assert!(gate.gate_flag_persisted().unwrap());
    }

    #[tokio::test]
    async fn subscription_failure_is_not_an_auth_signal() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, backend);
        gate.initialize(&resolved_config()).await.unwrap();

        let engaged = gate
            .apply_backend_auth_signal(&AuthSignal::Failure(BackendError::SubscriptionExpired {
                message: "plan lapsed".to_owned(),
            }))
            .unwrap();
        assert!(!engaged);
        assert_eq!(*gate.state(), AuthState::Open);
        assert!(!gate.gate_flag_persisted().unwrap());
    }

    #[tokio::test]
    async fn bare_403_policy_is_configurable() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut config = AuthConfig::default();
        config.treat_bare_403_as_auth_required = false;
        let mut gate = AuthGate::new("bot", "sess", store, backend, config);
        gate.initialize(&resolved_config()).await.unwrap();

        let engaged = gate
            .apply_backend_auth_signal(&AuthSignal::Failure(BackendError::Forbidden {
                message: None,
            }))
            .unwrap();
        assert!(!engaged);
        assert_eq!(*gate.state(), AuthState::Open);
    }

    #[tokio::test]
    async fn revalidation_failure_degrades_to_gated() {
        let store = Arc::new(MemoryKv::new());
        store
            .set(&keys::identity(AuthMethod::Email), "user@example.com")
            .unwrap();
        let backend = Arc::new(FakeBackend::new());
        backend.set_session_valid(false);
        let mut gate = gate_with(Arc::clone(&store), backend);

        let notice = gate.initialize(&resolved_config()).await.unwrap();
        assert!(notice.is_some());
        assert_eq!(*gate.state(), AuthState::Gated);
        assert!(store.get(&keys::identity(AuthMethod::Email)).unwrap().is_none());
    }

    #[tokio::test]
    async fn revalidation_success_enters_verified() {
        let store = Arc::new(MemoryKv::new());
        store
            .set(&keys::identity(AuthMethod::Email), "user@example.com")
            .unwrap();
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, backend);

        let notice = gate.initialize(&resolved_config()).await.unwrap();
        assert!(notice.is_none());
        assert!(matches!(gate.state(), AuthState::Verified { .. }));
    }

    #[tokio::test]
    async fn require_auth_from_start_gates_immediately() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, backend);
        let config = WidgetBackendConfig {
            auth_method: Some(AuthMethod::Phone),
            require_auth_from_start: true,
            ..WidgetBackendConfig::default()
        };
        gate.initialize(&config).await.unwrap();
        assert_eq!(*gate.state(), AuthState::Gated);
        assert_eq!(gate.method(), AuthMethod::Phone);
    }

    #[tokio::test]
    async fn cancel_otp_returns_to_gated() {
        let store = Arc::new(MemoryKv::new());
        let backend = Arc::new(FakeBackend::new());
        let mut gate = gate_with(store, backend);
        gate.initialize(&resolved_config()).await.unwrap();
        gate.record_outgoing_message().unwrap();
        gate.record_outgoing_message().unwrap();
        gate.request_otp("user@example.com").await.unwrap();

        gate.cancel_otp();
        assert_eq!(*gate.state(), AuthState::Gated);
        assert!(gate.challenge().is_none());
    }

    #[test]
    fn otp_buffer_slot_operations() {
        let mut buffer = OtpCodeBuffer::new(6);
        assert!(buffer.is_empty());
        assert!(!buffer.is_complete());
        assert_eq!(buffer.code(), None);

        for (i, d) in "123456".chars().enumerate() {
            buffer.set_slot(i, d).unwrap();
        }
        assert!(buffer.is_complete());
        assert_eq!(buffer.code().as_deref(), Some("123456"));

        buffer.clear_slot(2).unwrap();
        assert!(!buffer.is_complete());
        assert_eq!(buffer.code(), None);

        assert!(buffer.set_slot(0, 'x').is_err());
        assert!(buffer.set_slot(9, '1').is_err());
    }

    #[test]
    fn auth_method_parsing() {
        assert_eq!(AuthMethod::parse("email"), Some(AuthMethod::Email));
        assert_eq!(AuthMethod::parse("Phone"), Some(AuthMethod::Phone));
        assert_eq!(AuthMethod::parse("whatsapp"), Some(AuthMethod::Phone));
        assert_eq!(AuthMethod::parse("carrier-pigeon"), None);
    }
}
