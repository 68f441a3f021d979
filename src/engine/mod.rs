//! Conversation orchestration: one outgoing message end to end.
//!
//! The engine is the per-widget state container. It owns the transcript,
//! the auth gate, the playback controller, and the recording controller;
//! every embedded widget instance gets its own engine, so two widgets on
//! one page can only interact through the shared [`KeyValueStore`].

use crate::audio::{AudioController, PlaybackSink};
use crate::auth::{AuthGate, AuthSignal, AuthState};
use crate::backend::{AudioClip, BackendClient, BackendError};
use crate::config::WidgetConfig;
use crate::error::{Result, WidgetError};
use crate::recording::{CaptureDevice, RecordingController, RecordingEvent, RecordingFailure};
use crate::store::{KeyValueStore, ensure_session_id};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Shown in the transcript when a chat query fails for a reason that does
/// not engage the gate.
const GENERIC_FAILURE_TEXT: &str = "Something went wrong. Please try again.";

const NO_SPEECH_NOTICE: &str = "No speech detected. Please try again.";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSender {
    User,
    Bot,
}

/// Text-reveal progress for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationStatus {
    /// Not yet started revealing.
    Pending,
    /// Text reveal in progress.
    Animating,
    /// Fully revealed.
    Done,
}

/// One transcript entry. Ordering is append-only; entries are mutated only
/// to advance animation status and to attach lazily fetched reply audio.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender: MessageSender,
    pub text: String,
    pub audio: Option<AudioClip>,
    pub timestamp: DateTime<Utc>,
    pub animation: AnimationStatus,
}

/// Events surfaced to the embedding layer.
#[derive(Debug, Clone)]
pub enum WidgetEvent {
    /// A user-facing notice (expired session, subscription problem,
    /// no-speech condition).
    Notice(String),
    /// The gate UI should be surfaced.
    GateRequired,
    /// A voice recording produced this transcript; goes to the composer.
    Transcript(String),
    /// A voice recording failed. `user_message()` gives the display text.
    RecordingFailed(RecordingFailure),
}

/// Result of a send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty input; nothing happened.
    Ignored,
    /// The message went out and a reply was appended at `reply_index`.
    Sent { reply_index: usize },
    /// The gate blocked the send (or the reply demanded auth).
    GateRequired,
    /// A subscription failure blocked this turn; state unchanged.
    SubscriptionBlocked { message: String },
    /// A generic failure message was appended to the transcript.
    Failed,
}

/// Per-widget conversation engine.
pub struct ConversationEngine {
    chatbot_id: String,
    session_id: String,
    backend: Arc<dyn BackendClient>,
    config: WidgetConfig,
    auth: AuthGate,
    audio: AudioController,
    recording: RecordingController,
    recording_rx: Option<mpsc::Receiver<RecordingEvent>>,
    messages: Vec<ChatMessage>,
    gate_notice: Option<String>,
    gate_latched_at_load: bool,
    events_tx: mpsc::Sender<WidgetEvent>,
}

impl ConversationEngine {
    /// Wire up an engine and the receiver for its widget events.
    ///
    /// # Errors
    ///
    /// Returns an error if the session id cannot be read or created.
    pub fn new(
        chatbot_id: impl Into<String>,
        config: WidgetConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn BackendClient>,
        sink: Arc<dyn PlaybackSink>,
        capture: Arc<dyn CaptureDevice>,
    ) -> Result<(Self, mpsc::Receiver<WidgetEvent>)> {
        let chatbot_id = chatbot_id.into();
        let session_id = ensure_session_id(&*store)?;

        let auth = AuthGate::new(
            chatbot_id.clone(),
            session_id.clone(),
            Arc::clone(&store),
            Arc::clone(&backend),
            config.auth.clone(),
        );
        let audio = AudioController::new(sink, config.audio.start_muted);
        let (recording, recording_rx) =
            RecordingController::new(capture, Arc::clone(&backend), config.recording.clone());
        let (events_tx, events_rx) = mpsc::channel(16);

        Ok((
            Self {
                chatbot_id,
                session_id,
                backend,
                config,
                auth,
                audio,
                recording,
                recording_rx: Some(recording_rx),
                messages: Vec::new(),
                gate_notice: None,
                gate_latched_at_load: false,
                events_tx,
            },
            events_rx,
        ))
    }

    /// Fetch backend widget config, reconstruct persisted gate state, and
    /// start forwarding recording outcomes. Call once before use.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable. Backend unavailability
    /// is non-fatal: the widget degrades to defaults.
    pub async fn initialize(&mut self) -> Result<()> {
        let widget_config = match self.backend.get_config(&self.chatbot_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to fetch widget config, using defaults: {e}");
                crate::backend::WidgetBackendConfig::default()
            }
        };
        self.gate_notice = widget_config.require_auth_text.clone();
        self.gate_latched_at_load = self.auth.gate_flag_persisted()?;

        if let Some(notice) = self.auth.initialize(&widget_config).await? {
            self.emit(WidgetEvent::Notice(notice)).await;
        }

        if let Some(mut rx) = self.recording_rx.take() {
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let forwarded = match event {
                        RecordingEvent::Transcript(text) => WidgetEvent::Transcript(text),
                        RecordingEvent::NoSpeech => {
                            WidgetEvent::Notice(NO_SPEECH_NOTICE.to_owned())
                        }
                        RecordingEvent::Failed(reason) => WidgetEvent::RecordingFailed(reason),
                    };
                    if events_tx.send(forwarded).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    /// Send one user message end to end.
    ///
    /// A gated send is rejected before anything happens: no transcript
    /// append, no network call. Otherwise active playback stops, the
    /// message counter advances, and the reply (or a failure) lands in the
    /// transcript.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures; backend failures resolve
    /// into a [`SendOutcome`].
    pub async fn send(&mut self, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        if !self.auth.may_proceed() {
            self.emit(WidgetEvent::GateRequired).await;
            return Ok(SendOutcome::GateRequired);
        }

        self.audio.stop().await;
        self.messages.push(ChatMessage {
            sender: MessageSender::User,
            text: text.to_owned(),
            audio: None,
            timestamp: Utc::now(),
            animation: AnimationStatus::Done,
        });
        self.auth.record_outgoing_message()?;

        let identity = self.auth.verified_identity();
        match self
            .backend
            .query(&self.chatbot_id, text, &self.session_id, identity.as_ref())
            .await
        {
            Ok(reply) => {
                let reply_index = self.messages.len();
                let clip = reply.audio.clone();
                self.messages.push(ChatMessage {
                    sender: MessageSender::Bot,
                    text: reply.answer,
                    audio: reply.audio,
                    timestamp: Utc::now(),
                    animation: AnimationStatus::Animating,
                });

                if reply.requires_auth_next {
                    self.auth.apply_backend_auth_signal(&AuthSignal::RequiresAuthNext {
                        method: reply.auth_method,
                    })?;
                    self.emit(WidgetEvent::GateRequired).await;
                }

                if self.config.audio.enabled {
                    if let Some(clip) = clip {
                        self.audio.play(&clip, reply_index).await;
                    }
                }
                Ok(SendOutcome::Sent { reply_index })
            }
            Err(BackendError::SubscriptionExpired { message }) => {
                self.emit(WidgetEvent::Notice(message.clone())).await;
                Ok(SendOutcome::SubscriptionBlocked { message })
            }
            Err(e) => {
                // Either the gate engages or a failure message is appended,
                // never both.
                let engaged = self
                    .auth
                    .apply_backend_auth_signal(&AuthSignal::Failure(e.clone()))?;
                if engaged {
                    if let BackendError::AuthRequired {
                        message: Some(message),
                    } = e
                    {
                        self.emit(WidgetEvent::Notice(message)).await;
                    }
                    self.emit(WidgetEvent::GateRequired).await;
                    Ok(SendOutcome::GateRequired)
                } else {
                    warn!("chat query failed: {e}");
                    self.messages.push(ChatMessage {
                        sender: MessageSender::Bot,
                        text: GENERIC_FAILURE_TEXT.to_owned(),
                        audio: None,
                        timestamp: Utc::now(),
                        animation: AnimationStatus::Animating,
                    });
                    Ok(SendOutcome::Failed)
                }
            }
        }
    }

    /// Mark a message's text reveal as complete.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range index.
    pub fn mark_message_done(&mut self, index: usize) -> Result<()> {
        let message = self.messages.get_mut(index).ok_or_else(|| {
            WidgetError::Validation(format!("message index {index} is out of range"))
        })?;
        message.animation = AnimationStatus::Done;
        Ok(())
    }

    /// Whether the inline gate/OTP affordance may appear.
    ///
    /// Hidden while the most recent bot message is still revealing, so the
    /// prompt never materializes mid-sentence. Exception: a gate latched
    /// before this load shows immediately.
    #[must_use]
    pub fn gate_prompt_visible(&self) -> bool {
        if !matches!(
            self.auth.state(),
            AuthState::Gated | AuthState::AwaitingOtp { .. }
        ) {
            return false;
        }
        if self.gate_latched_at_load {
            return true;
        }
        !self.last_bot_message_revealing()
    }

    fn last_bot_message_revealing(&self) -> bool {
        self.messages
            .iter()
            .rev()
            .find(|m| m.sender == MessageSender::Bot)
            .is_some_and(|m| m.animation != AnimationStatus::Done)
    }

    /// Lazily synthesize audio for the most recent bot message when the
    /// reply carried none. Returns whether a clip was attached.
    ///
    /// # Errors
    ///
    /// Returns the backend failure if synthesis fails.
    pub async fn ensure_reply_audio(&mut self) -> Result<bool> {
        if !self.config.audio.enabled {
            return Ok(false);
        }
        let Some(index) = self
            .messages
            .iter()
            .rposition(|m| m.sender == MessageSender::Bot)
        else {
            return Ok(false);
        };
        if self.messages[index].audio.is_some() {
            return Ok(false);
        }
        let clip = self.backend.synthesize(&self.messages[index].text).await?;
        self.messages[index].audio = Some(clip);
        Ok(true)
    }

    /// Play (or toggle off) the clip attached to a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message has no audio attached.
    pub async fn play_message(&mut self, index: usize) -> Result<()> {
        if !self.config.audio.enabled {
            return Ok(());
        }
        let clip = self
            .messages
            .get(index)
            .and_then(|m| m.audio.clone())
            .ok_or_else(|| WidgetError::Audio(format!("message {index} has no audio")))?;
        self.audio.play(&clip, index).await;
        Ok(())
    }

    /// Begin a voice recording; the transcript arrives as a
    /// [`WidgetEvent::Transcript`].
    ///
    /// # Errors
    ///
    /// Returns an error when the gate blocks it or a recording is active.
    pub fn start_recording(&self) -> Result<()> {
        if !self.auth.may_proceed() {
            return Err(WidgetError::Auth(
                "authentication required before recording".to_owned(),
            ));
        }
        self.recording.start()
    }

    /// Stop and finalize the active recording.
    ///
    /// # Errors
    ///
    /// Returns an error when no recording is active.
    pub fn stop_recording(&self) -> Result<()> {
        self.recording.stop()
    }

    pub async fn stop_playback(&self) {
        self.audio.stop().await;
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.set_muted(muted);
    }

    /// Flip the mute flag; returns the new value.
    pub fn toggle_muted(&self) -> bool {
        self.audio.toggle_muted()
    }

    async fn emit(&self, event: WidgetEvent) {
        let _ = self.events_tx.send(event).await;
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn auth_mut(&mut self) -> &mut AuthGate {
        &mut self.auth
    }

    #[must_use]
    pub fn audio(&self) -> &AudioController {
        &self.audio
    }

    #[must_use]
    pub fn recording(&self) -> &RecordingController {
        &self.recording
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Backend-configured text for the gate prompt, if any.
    #[must_use]
    pub fn gate_notice(&self) -> Option<&str> {
        self.gate_notice.as_deref()
    }
}
