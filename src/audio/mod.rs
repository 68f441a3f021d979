//! Single-flight audio playback.
//!
//! The controller owns at most one live playback slot. Starting a new clip
//! always tears the previous one down first, so two resources are never
//! audible at once; the global mute flag is applied to the live resource
//! immediately, not on the next playback.

pub mod decode;
pub mod playback;
pub mod sink;

pub use playback::CpalSink;
pub use sink::{PlaybackHandle, PlaybackSink, StartedPlayback};

use crate::backend::AudioClip;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

struct Slot {
    message_index: usize,
    handle: Arc<dyn PlaybackHandle>,
    generation: u64,
}

struct ControllerInner {
    muted: bool,
    slot: Option<Slot>,
    generation: u64,
}

/// Single-flight playback controller.
///
/// Playback failures are not surfaced to the caller: a failed start clears
/// the slot and logs, per the degraded-but-recoverable error policy.
pub struct AudioController {
    sink: Arc<dyn PlaybackSink>,
    inner: Arc<Mutex<ControllerInner>>,
}

fn lock_inner(inner: &Mutex<ControllerInner>) -> MutexGuard<'_, ControllerInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AudioController {
    #[must_use]
    pub fn new(sink: Arc<dyn PlaybackSink>, start_muted: bool) -> Self {
        Self {
            sink,
            inner: Arc::new(Mutex::new(ControllerInner {
                muted: start_muted,
                slot: None,
                generation: 0,
            })),
        }
    }

    /// Play `clip` for the message at `message_index`.
    ///
    /// Requesting the index that is already playing stops it instead
    /// (toggle-to-stop). Otherwise any existing slot is torn down, strictly
    /// before the new resource starts.
    pub async fn play(&self, clip: &AudioClip, message_index: usize) {
        let (old, start_new, muted, generation) = {
            let mut inner = lock_inner(&self.inner);
            let toggled = inner
                .slot
                .as_ref()
                .is_some_and(|s| s.message_index == message_index);
            let old = inner.slot.take();
            if toggled {
                (old, false, inner.muted, 0)
            } else {
                inner.generation += 1;
                (old, true, inner.muted, inner.generation)
            }
        };

        if let Some(old) = old {
            old.handle.stop().await;
        }
        if !start_new {
            return;
        }

        let started = match self.sink.start(clip, muted).await {
            Ok(started) => started,
            Err(e) => {
                warn!("playback failed to start, clearing slot: {e}");
                return;
            }
        };
        if !started.audible {
            debug!("autoplay blocked; clip prepared but not audible");
        }

        let handle: Arc<dyn PlaybackHandle> = Arc::from(started.handle);
        {
            let mut inner = lock_inner(&self.inner);
            if let Some(stale) = inner.slot.replace(Slot {
                message_index,
                handle: Arc::clone(&handle),
                generation,
            }) {
                let stale_handle = stale.handle;
                tokio::spawn(async move { stale_handle.stop().await });
            }
        }

        // Clear the slot when the clip ends on its own.
        let watcher_inner = Arc::clone(&self.inner);
        let watcher_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            watcher_handle.wait_ended().await;
            let released = {
                let mut inner = lock_inner(&watcher_inner);
                match &inner.slot {
                    Some(slot) if slot.generation == generation => inner.slot.take(),
                    _ => None,
                }
            };
            if let Some(slot) = released {
                slot.handle.stop().await;
            }
        });
    }

    /// Stop and release any active playback. Idempotent.
    pub async fn stop(&self) {
        let old = lock_inner(&self.inner).slot.take();
        if let Some(old) = old {
            old.handle.stop().await;
        }
    }

    /// Update the global mute flag and apply it to a live slot immediately.
    pub fn set_muted(&self, muted: bool) {
        let mut inner = lock_inner(&self.inner);
        inner.muted = muted;
        if let Some(slot) = &inner.slot {
            slot.handle.set_muted(muted);
        }
    }

    /// Flip the mute flag; returns the new value.
    pub fn toggle_muted(&self) -> bool {
        let mut inner = lock_inner(&self.inner);
        inner.muted = !inner.muted;
        if let Some(slot) = &inner.slot {
            slot.handle.set_muted(inner.muted);
        }
        inner.muted
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        lock_inner(&self.inner).muted
    }

    /// Index of the message whose clip is currently in the slot.
    #[must_use]
    pub fn playing_index(&self) -> Option<usize> {
        lock_inner(&self.inner).slot.as_ref().map(|s| s.message_index)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{FakeSink, test_clip};
    use std::time::Duration;

    #[tokio::test]
    async fn new_playback_tears_down_old_first() {
        let sink = Arc::new(FakeSink::new());
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.play(&test_clip(), 0).await;
        controller.play(&test_clip(), 1).await;

        assert_eq!(controller.playing_index(), Some(1));
        let events = sink.events();
        assert_eq!(events, vec!["start:0", "stop:0", "start:1"]);
    }

    #[tokio::test]
    async fn same_index_toggles_playback_off() {
        let sink = Arc::new(FakeSink::new());
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.play(&test_clip(), 3).await;
        assert_eq!(controller.playing_index(), Some(3));

        controller.play(&test_clip(), 3).await;
        assert_eq!(controller.playing_index(), None);
        assert_eq!(sink.events(), vec!["start:0", "stop:0"]);
    }

    #[tokio::test]
    async fn mute_applies_to_live_handle() {
        let sink = Arc::new(FakeSink::new());
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.play(&test_clip(), 0).await;
        let handle = sink.last_handle().unwrap();
        assert!(!handle.is_muted());

        controller.set_muted(true);
        assert!(handle.is_muted());
        assert!(controller.is_muted());

        assert!(!controller.toggle_muted());
        assert!(!handle.is_muted());
    }

    #[tokio::test]
    async fn new_slot_honors_global_mute() {
        let sink = Arc::new(FakeSink::new());
        let controller = AudioController::new(Arc::clone(&sink) as _, true);

        controller.play(&test_clip(), 0).await;
        assert!(sink.last_handle().unwrap().is_muted());
    }

    #[tokio::test]
    async fn end_of_clip_clears_slot() {
        let sink = Arc::new(FakeSink::new());
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.play(&test_clip(), 0).await;
        sink.last_handle().unwrap().finish();

        // Give the watcher task a turn to observe the end.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.playing_index(), None);
    }

    #[tokio::test]
    async fn start_failure_clears_slot_without_error() {
        let sink = Arc::new(FakeSink::new());
        sink.fail_next_start();
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.play(&test_clip(), 0).await;
        assert_eq!(controller.playing_index(), None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sink = Arc::new(FakeSink::new());
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.stop().await;
        controller.play(&test_clip(), 0).await;
        controller.stop().await;
        controller.stop().await;
        assert_eq!(controller.playing_index(), None);
    }

    #[tokio::test]
    async fn inaudible_start_keeps_slot_prepared() {
        let sink = Arc::new(FakeSink::new());
        sink.set_inaudible(true);
        let controller = AudioController::new(Arc::clone(&sink) as _, false);

        controller.play(&test_clip(), 0).await;
        // Autoplay-blocked playback is a soft condition: slot kept.
        assert_eq!(controller.playing_index(), Some(0));
    }
}
