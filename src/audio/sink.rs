//! Playback adapter contract.
//!
//! The controller never touches an audio device directly; it drives a
//! [`PlaybackSink`] that turns an encoded clip into a running playback and
//! hands back a [`PlaybackHandle`]. Operations resolve to completion or
//! failure rather than firing callbacks.

use crate::backend::AudioClip;
use async_trait::async_trait;

/// A running (or prepared) playback.
#[async_trait]
pub trait PlaybackHandle: Send + Sync {
    /// Mute or unmute the live resource. Takes effect immediately, not on
    /// the next playback.
    fn set_muted(&self, muted: bool);

    /// Pause and release the underlying resource. Resolves once the
    /// resource is fully torn down. Idempotent.
    async fn stop(&self);

    /// Resolves when playback is over for any reason (natural end or stop).
    async fn wait_ended(&self);

    /// Whether playback has already finished.
    fn is_ended(&self) -> bool;
}

/// Outcome of starting playback.
pub struct StartedPlayback {
    /// Control handle for the new playback.
    pub handle: Box<dyn PlaybackHandle>,
    /// False when a host autoplay policy prepared the clip without sound
    /// (no prior user interaction). Not an error.
    pub audible: bool,
}

/// Turns an encoded clip into a running playback.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Decode `clip` and begin playback, initially muted per `muted`.
    async fn start(&self, clip: &AudioClip, muted: bool) -> anyhow::Result<StartedPlayback>;
}
