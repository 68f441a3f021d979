//! Colloquy: embeddable chat widget core.
//!
//! This crate is the access-control and session-concurrency engine of an
//! embeddable conversational widget:
//!
//! - **AuthGate**: a per-session message counter that makes authentication
//!   mandatory after a threshold, plus an OTP challenge/verification
//!   protocol with resend throttling and gate state that survives host
//!   restarts
//! - **AudioController**: single-flight playback of bot reply clips with a
//!   live mute toggle
//! - **RecordingController**: bounded voice capture with a hard deadline
//!   and hand-off to transcription
//! - **ConversationEngine**: orchestrates a message end to end: gate
//!   check, playback teardown, backend query, reply append, and the
//!   animation-gated prompt transition
//!
//! Presentation (theming, layout, markdown) and the backend service itself
//! are the host's concern; the widget reaches them through the
//! [`backend::BackendClient`] and [`store::KeyValueStore`] contracts.

pub mod audio;
pub mod auth;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod recording;
pub mod store;
pub mod test_utils;

pub use audio::AudioController;
pub use auth::{AuthGate, AuthMethod, AuthState};
pub use backend::{BackendClient, BackendError, HttpBackend};
pub use config::WidgetConfig;
pub use engine::{ChatMessage, ConversationEngine, SendOutcome, WidgetEvent};
pub use error::{Result, WidgetError};
pub use recording::{RecordingController, RecordingEvent, RecordingLifecycle};
pub use store::{FileKv, KeyValueStore, MemoryKv};
