//! Bounded voice capture with hand-off to transcription.
//!
//! The controller owns the capture lifecycle: `Idle → Recording →
//! Finalizing → Idle`. A recording is bounded by a hard deadline that
//! auto-stops it, and every exit path (explicit stop, deadline, device
//! error, teardown) releases the capture device, disarms the deadline, and
//! returns the lifecycle to `Idle`. Results are delivered on an event
//! channel rather than scattered callbacks.

pub mod capture;

pub use capture::CpalRecorder;

use crate::backend::{BackendClient, BackendError};
use crate::config::RecordingConfig;
use crate::error::{Result, WidgetError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capture lifecycle. Only one recording may exist per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingLifecycle {
    #[default]
    Idle,
    Recording,
    Finalizing,
}

/// Why a recording produced no transcript. Each maps to a distinct
/// user-facing message; all of them resolve the lifecycle back to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingFailure {
    /// Transcription timed out.
    Timeout,
    /// The audio payload exceeded the backend limit.
    PayloadTooLarge,
    /// The backend rate-limited the request.
    RateLimited,
    /// The backend failed server-side.
    Server,
    /// Anything else (device failure, transport error).
    Unknown,
}

impl RecordingFailure {
    fn from_backend(err: &BackendError) -> Self {
        match err {
            BackendError::Timeout => Self::Timeout,
            BackendError::PayloadTooLarge => Self::PayloadTooLarge,
            BackendError::RateLimited => Self::RateLimited,
            BackendError::Server { .. } => Self::Server,
            _ => Self::Unknown,
        }
    }

    /// User-facing message for this failure.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Timeout => "Transcription timed out. Please try again.",
            Self::PayloadTooLarge => "That recording is too long to transcribe.",
            Self::RateLimited => "Too many requests. Please wait a moment and try again.",
            Self::Server => "Transcription is unavailable right now. Please try again later.",
            Self::Unknown => "Could not transcribe that recording. Please try again.",
        }
    }
}

/// Result of one finalized recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEvent {
    /// A non-empty transcript, trimmed.
    Transcript(String),
    /// The recording transcribed to nothing.
    NoSpeech,
    /// Capture or transcription failed.
    Failed(RecordingFailure),
}

/// Capture adapter contract. Implementations push encoded chunks into the
/// channel until cancelled, flushing any final payload before returning.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Whether this device can produce the given MIME encoding.
    fn supports_encoding(&self, mime: &str) -> bool;

    /// Run the capture loop. Returns once the token is cancelled and all
    /// buffered audio has been flushed to `chunk_tx`.
    async fn capture(
        &self,
        encoding: &str,
        chunk_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Voice recording controller.
pub struct RecordingController {
    device: Arc<dyn CaptureDevice>,
    backend: Arc<dyn BackendClient>,
    config: RecordingConfig,
    lifecycle: Arc<Mutex<RecordingLifecycle>>,
    cancel: Mutex<Option<CancellationToken>>,
    events_tx: mpsc::Sender<RecordingEvent>,
}

fn set_lifecycle(lifecycle: &Mutex<RecordingLifecycle>, value: RecordingLifecycle) {
    match lifecycle.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

impl RecordingController {
    /// Create a controller and the receiver its events are delivered on.
    #[must_use]
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        backend: Arc<dyn BackendClient>,
        config: RecordingConfig,
    ) -> (Self, mpsc::Receiver<RecordingEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        (
            Self {
                device,
                backend,
                config,
                lifecycle: Arc::new(Mutex::new(RecordingLifecycle::Idle)),
                cancel: Mutex::new(None),
                events_tx,
            },
            events_rx,
        )
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> RecordingLifecycle {
        match self.lifecycle.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Begin a recording.
    ///
    /// The caller is expected to gate this on `AuthGate::may_proceed`.
    ///
    /// # Errors
    ///
    /// Returns an error if a recording is already active (the original
    /// capture continues unaffected) or no configured encoding is
    /// supported by the device.
    pub fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .map_err(|e| WidgetError::Recording(format!("lifecycle lock poisoned: {e}")))?;
            if *lifecycle != RecordingLifecycle::Idle {
                return Err(WidgetError::Recording(
                    "a recording is already active".to_owned(),
                ));
            }
            *lifecycle = RecordingLifecycle::Recording;
        }

        let Some(encoding) = self
            .config
            .preferred_encodings
            .iter()
            .find(|e| self.device.supports_encoding(e))
            .cloned()
        else {
            set_lifecycle(&self.lifecycle, RecordingLifecycle::Idle);
            return Err(WidgetError::Recording(
                "no supported capture encoding".to_owned(),
            ));
        };

        let cancel = CancellationToken::new();
        {
            let mut slot = self
                .cancel
                .lock()
                .map_err(|e| WidgetError::Recording(format!("cancel lock poisoned: {e}")))?;
            *slot = Some(cancel.clone());
        }

        info!("recording started ({encoding})");
        tokio::spawn(run_recording(
            Arc::clone(&self.device),
            Arc::clone(&self.backend),
            encoding,
            self.config.max_duration(),
            Arc::clone(&self.lifecycle),
            cancel,
            self.events_tx.clone(),
        ));
        Ok(())
    }

    /// Stop the active recording and finalize it.
    ///
    /// # Errors
    ///
    /// Returns an error when no recording is active.
    pub fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .map_err(|e| WidgetError::Recording(format!("lifecycle lock poisoned: {e}")))?;
            if *lifecycle != RecordingLifecycle::Recording {
                return Err(WidgetError::Recording("no active recording".to_owned()));
            }
            *lifecycle = RecordingLifecycle::Finalizing;
        }
        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        Ok(())
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        // Teardown counts as an exit path: release the capture task.
        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }
}

async fn run_recording(
    device: Arc<dyn CaptureDevice>,
    backend: Arc<dyn BackendClient>,
    encoding: String,
    max_duration: std::time::Duration,
    lifecycle: Arc<Mutex<RecordingLifecycle>>,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<RecordingEvent>,
) {
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(64);
    let device_cancel = cancel.child_token();

    let capture_task = {
        let device = Arc::clone(&device);
        let encoding = encoding.clone();
        let device_cancel = device_cancel.clone();
        tokio::spawn(async move { device.capture(&encoding, chunk_tx, device_cancel).await })
    };

    let mut chunks: Vec<Bytes> = Vec::new();
    let deadline = tokio::time::sleep(max_duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            maybe = chunk_rx.recv() => match maybe {
                Some(chunk) => chunks.push(chunk),
                // Device closed its channel: finished or errored.
                None => break,
            },
            _ = cancel.cancelled() => break,
            _ = &mut deadline => {
                info!("recording deadline reached, auto-stopping");
                break;
            }
        }
    }

    set_lifecycle(&lifecycle, RecordingLifecycle::Finalizing);
    device_cancel.cancel();

    // The device flushes its final payload on cancellation; collect it.
    while let Some(chunk) = chunk_rx.recv().await {
        chunks.push(chunk);
    }

    let device_failed = match capture_task.await {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            warn!("capture device error: {e}");
            true
        }
        Err(e) => {
            warn!("capture task aborted: {e}");
            true
        }
    };

    let event = finalize(&*backend, &chunks, &encoding, device_failed).await;
    let _ = events_tx.send(event).await;
    set_lifecycle(&lifecycle, RecordingLifecycle::Idle);
}

async fn finalize(
    backend: &dyn BackendClient,
    chunks: &[Bytes],
    encoding: &str,
    device_failed: bool,
) -> RecordingEvent {
    let payload: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    if payload.is_empty() {
        return if device_failed {
            RecordingEvent::Failed(RecordingFailure::Unknown)
        } else {
            RecordingEvent::NoSpeech
        };
    }

    match backend.transcribe(&payload, encoding).await {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() {
                RecordingEvent::NoSpeech
            } else {
                RecordingEvent::Transcript(text.to_owned())
            }
        }
        Err(e) => {
            warn!("transcription failed: {e}");
            RecordingEvent::Failed(RecordingFailure::from_backend(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{FakeBackend, FakeCapture};
    use std::time::Duration;

    fn fast_config() -> RecordingConfig {
        RecordingConfig {
            max_duration_ms: 10_000,
            ..RecordingConfig::default()
        }
    }

    #[tokio::test]
    async fn stop_delivers_trimmed_transcript_and_returns_to_idle() {
        let device = Arc::new(FakeCapture::with_chunks(vec![vec![1, 2], vec![3]]));
        let backend = Arc::new(FakeBackend::new());
        backend.set_transcript("  hello there  ");
        let (controller, mut events) =
            RecordingController::new(Arc::clone(&device) as _, backend, fast_config());

        controller.start().unwrap();
        assert_eq!(controller.lifecycle(), RecordingLifecycle::Recording);
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop().unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, RecordingEvent::Transcript("hello there".to_owned()));
        assert_eq!(controller.lifecycle(), RecordingLifecycle::Idle);
        assert_eq!(device.active_captures(), 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_capture_continues() {
        let device = Arc::new(FakeCapture::with_chunks(vec![vec![1]]));
        let backend = Arc::new(FakeBackend::new());
        let (controller, mut events) =
            RecordingController::new(Arc::clone(&device) as _, backend, fast_config());

        controller.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.start().is_err());
        assert_eq!(controller.lifecycle(), RecordingLifecycle::Recording);
        assert_eq!(device.active_captures(), 1);

        controller.stop().unwrap();
        let _ = events.recv().await.unwrap();
        assert_eq!(device.active_captures(), 0);
    }

    #[tokio::test]
    async fn deadline_auto_stops_and_finalizes_exactly_once() {
        let device = Arc::new(FakeCapture::with_chunks(vec![vec![1, 2, 3]]));
        let backend = Arc::new(FakeBackend::new());
        backend.set_transcript("timed out message");
        let config = RecordingConfig {
            max_duration_ms: 50,
            ..RecordingConfig::default()
        };
        let (controller, mut events) =
            RecordingController::new(Arc::clone(&device) as _, Arc::clone(&backend) as _, config);

        controller.start().unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            RecordingEvent::Transcript("timed out message".to_owned())
        );
        assert_eq!(backend.transcribe_calls(), 1);
        assert_eq!(controller.lifecycle(), RecordingLifecycle::Idle);
        assert_eq!(device.active_captures(), 0);

        // No second finalize arrives.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_transcript_reports_no_speech() {
        let device = Arc::new(FakeCapture::with_chunks(vec![vec![9]]));
        let backend = Arc::new(FakeBackend::new());
        backend.set_transcript("   ");
        let (controller, mut events) =
            RecordingController::new(device, backend, fast_config());

        controller.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.stop().unwrap();

        assert_eq!(events.recv().await.unwrap(), RecordingEvent::NoSpeech);
    }

    #[tokio::test]
    async fn transcription_failures_map_to_reasons_and_reset_lifecycle() {
        let cases = [
            (BackendError::Timeout, RecordingFailure::Timeout),
            (BackendError::PayloadTooLarge, RecordingFailure::PayloadTooLarge),
            (BackendError::RateLimited, RecordingFailure::RateLimited),
            (
                BackendError::Server {
                    status: 500,
                    message: "boom".to_owned(),
                },
                RecordingFailure::Server,
            ),
            (
                BackendError::Network("down".to_owned()),
                RecordingFailure::Unknown,
            ),
        ];

        for (backend_err, expected) in cases {
            let device = Arc::new(FakeCapture::with_chunks(vec![vec![1]]));
            let backend = Arc::new(FakeBackend::new());
            backend.set_transcribe_error(backend_err);
            let (controller, mut events) =
                RecordingController::new(Arc::clone(&device) as _, backend, fast_config());

            controller.start().unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.stop().unwrap();

            assert_eq!(
                events.recv().await.unwrap(),
                RecordingEvent::Failed(expected)
            );
            assert_eq!(controller.lifecycle(), RecordingLifecycle::Idle);
            assert_eq!(device.active_captures(), 0);
        }
    }

    #[tokio::test]
    async fn device_failure_releases_and_reports_unknown() {
        let device = Arc::new(FakeCapture::failing());
        let backend = Arc::new(FakeBackend::new());
        let (controller, mut events) =
            RecordingController::new(Arc::clone(&device) as _, backend, fast_config());

        controller.start().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RecordingEvent::Failed(RecordingFailure::Unknown)
        );
        assert_eq!(controller.lifecycle(), RecordingLifecycle::Idle);
        assert_eq!(device.active_captures(), 0);
    }

    #[tokio::test]
    async fn unsupported_encodings_reject_start() {
        let device = Arc::new(FakeCapture::with_chunks(vec![]));
        device.set_supported(vec![]);
        let backend = Arc::new(FakeBackend::new());
        let (controller, _events) = RecordingController::new(device, backend, fast_config());

        assert!(controller.start().is_err());
        assert_eq!(controller.lifecycle(), RecordingLifecycle::Idle);
    }

    #[tokio::test]
    async fn stop_without_recording_is_an_error() {
        let device = Arc::new(FakeCapture::with_chunks(vec![]));
        let backend = Arc::new(FakeBackend::new());
        let (controller, _events) = RecordingController::new(device, backend, fast_config());
        assert!(controller.stop().is_err());
    }

    #[test]
    fn failure_messages_are_distinct() {
        let all = [
            RecordingFailure::Timeout,
            RecordingFailure::PayloadTooLarge,
            RecordingFailure::RateLimited,
            RecordingFailure::Server,
            RecordingFailure::Unknown,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.user_message(), b.user_message());
            }
        }
    }
}
