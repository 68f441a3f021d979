//! Shared test doubles used across unit and integration tests.
//!
//! An in-process backend, playback sink, and capture device with
//! controllable behavior and call logs, so gate, playback, and recording
//! flows can be exercised without a network or audio hardware.

use crate::audio::sink::{PlaybackHandle, PlaybackSink, StartedPlayback};
use crate::backend::{
    AudioClip, BackendClient, BackendError, Identity, QueryReply, WidgetBackendConfig,
};
use crate::auth::AuthMethod;
use crate::recording::CaptureDevice;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A tiny clip payload for playback tests.
#[must_use]
pub fn test_clip() -> AudioClip {
    AudioClip {
        bytes: Bytes::from_static(&[0, 1, 2, 3]),
        content_type: "audio/wav".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Backend

struct FakeBackendInner {
    widget_config: WidgetBackendConfig,
    session_valid: bool,
    accepted_code: String,
    otp_sends: u32,
    otp_verifications: u32,
    query_log: Vec<String>,
    query_identities: Vec<Option<Identity>>,
    next_query_error: Option<BackendError>,
    requires_auth_next: bool,
    reply_text: String,
    reply_audio: Option<AudioClip>,
    transcript: String,
    transcribe_error: Option<BackendError>,
    transcribe_calls: u32,
    synthesize_calls: u32,
}

/// Configurable in-process backend.
pub struct FakeBackend {
    inner: Mutex<FakeBackendInner>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeBackendInner {
                widget_config: WidgetBackendConfig {
                    auth_method: Some(AuthMethod::Email),
                    ..WidgetBackendConfig::default()
                },
                session_valid: true,
                accepted_code: "123456".to_owned(),
                otp_sends: 0,
                otp_verifications: 0,
                query_log: Vec::new(),
                query_identities: Vec::new(),
                next_query_error: None,
                requires_auth_next: false,
                reply_text: "Hello! How can I help?".to_owned(),
                reply_audio: None,
                transcript: "hello".to_owned(),
                transcribe_error: None,
                transcribe_calls: 0,
                synthesize_calls: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeBackendInner> {
        self.inner.lock().expect("fake backend lock")
    }

    pub fn set_widget_config(&self, config: WidgetBackendConfig) {
        self.lock().widget_config = config;
    }

    pub fn set_session_valid(&self, valid: bool) {
        self.lock().session_valid = valid;
    }

    pub fn set_accepted_code(&self, code: &str) {
        self.lock().accepted_code = code.to_owned();
    }

    pub fn set_reply_text(&self, text: &str) {
        self.lock().reply_text = text.to_owned();
    }

    pub fn set_reply_audio(&self, clip: Option<AudioClip>) {
        self.lock().reply_audio = clip;
    }

    pub fn set_requires_auth_next(&self, value: bool) {
        self.lock().requires_auth_next = value;
    }

    /// Fail the next `query` call with `err`, then recover.
    pub fn fail_next_query(&self, err: BackendError) {
        self.lock().next_query_error = Some(err);
    }

    pub fn set_transcript(&self, text: &str) {
        self.lock().transcript = text.to_owned();
    }

    pub fn set_transcribe_error(&self, err: BackendError) {
        self.lock().transcribe_error = Some(err);
    }

    #[must_use]
    pub fn otp_sends(&self) -> u32 {
        self.lock().otp_sends
    }

    #[must_use]
    pub fn otp_verifications(&self) -> u32 {
        self.lock().otp_verifications
    }

    #[must_use]
    pub fn transcribe_calls(&self) -> u32 {
        self.lock().transcribe_calls
    }

    #[must_use]
    pub fn synthesize_calls(&self) -> u32 {
        self.lock().synthesize_calls
    }

    /// Texts of all chat queries received, in order.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.lock().query_log.clone()
    }

    /// Identity attached to each query, in order.
    #[must_use]
    pub fn query_identities(&self) -> Vec<Option<Identity>> {
        self.lock().query_identities.clone()
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn get_config(&self, _chatbot_id: &str) -> Result<WidgetBackendConfig, BackendError> {
        Ok(self.lock().widget_config.clone())
    }

    async fn validate_session(
        &self,
        _method: AuthMethod,
        _identifier: &str,
        _chatbot_id: &str,
    ) -> Result<bool, BackendError> {
        Ok(self.lock().session_valid)
    }

    async fn send_otp(
        &self,
        _method: AuthMethod,
        _identifier: &str,
        _chatbot_id: &str,
    ) -> Result<(), BackendError> {
        self.lock().otp_sends += 1;
        Ok(())
    }

    async fn verify_otp(
        &self,
        _method: AuthMethod,
        _identifier: &str,
        code: &str,
        _chatbot_id: &str,
    ) -> Result<bool, BackendError> {
        let mut inner = self.lock();
        inner.otp_verifications += 1;
        Ok(code == inner.accepted_code)
    }

    async fn query(
        &self,
        _chatbot_id: &str,
        text: &str,
        _session_id: &str,
        identity: Option<&Identity>,
    ) -> Result<QueryReply, BackendError> {
        let mut inner = self.lock();
        inner.query_log.push(text.to_owned());
        inner.query_identities.push(identity.cloned());
        if let Some(err) = inner.next_query_error.take() {
            return Err(err);
        }
        Ok(QueryReply {
            answer: inner.reply_text.clone(),
            audio: inner.reply_audio.clone(),
            requires_auth_next: inner.requires_auth_next,
            auth_method: None,
        })
    }

    async fn transcribe(&self, _payload: &[u8], _format_hint: &str) -> Result<String, BackendError> {
        let mut inner = self.lock();
        inner.transcribe_calls += 1;
        if let Some(err) = inner.transcribe_error.clone() {
            return Err(err);
        }
        Ok(inner.transcript.clone())
    }

    async fn synthesize(&self, _text: &str) -> Result<AudioClip, BackendError> {
        self.lock().synthesize_calls += 1;
        Ok(test_clip())
    }
}

// ---------------------------------------------------------------------------
// Playback sink

/// Shared state of one fake playback, visible to tests.
pub struct FakeHandleShared {
    id: usize,
    muted: AtomicBool,
    over_tx: watch::Sender<bool>,
    over_rx: watch::Receiver<bool>,
    events: Arc<Mutex<Vec<String>>>,
}

impl FakeHandleShared {
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Simulate natural end-of-clip.
    pub fn finish(&self) {
        let _ = self.over_tx.send(true);
    }
}

struct FakeHandle(Arc<FakeHandleShared>);

#[async_trait]
impl PlaybackHandle for FakeHandle {
    fn set_muted(&self, muted: bool) {
        self.0.muted.store(muted, Ordering::Relaxed);
    }

    async fn stop(&self) {
        if !*self.0.over_rx.borrow() {
            self.0
                .events
                .lock()
                .expect("fake sink events lock")
                .push(format!("stop:{}", self.0.id));
        }
        let _ = self.0.over_tx.send(true);
    }

    async fn wait_ended(&self) {
        let mut rx = self.0.over_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn is_ended(&self) -> bool {
        *self.0.over_rx.borrow()
    }
}

struct FakeSinkInner {
    next_id: usize,
    handles: Vec<Arc<FakeHandleShared>>,
    fail_next: bool,
    inaudible: bool,
}

/// Playback sink recording start/stop ordering.
pub struct FakeSink {
    events: Arc<Mutex<Vec<String>>>,
    inner: Mutex<FakeSinkInner>,
}

impl Default for FakeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            inner: Mutex::new(FakeSinkInner {
                next_id: 0,
                handles: Vec::new(),
                fail_next: false,
                inaudible: false,
            }),
        }
    }

    /// Chronological `start:<id>` / `stop:<id>` event log.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("fake sink events lock").clone()
    }

    pub fn fail_next_start(&self) {
        self.inner.lock().expect("fake sink lock").fail_next = true;
    }

    pub fn set_inaudible(&self, inaudible: bool) {
        self.inner.lock().expect("fake sink lock").inaudible = inaudible;
    }

    /// The most recently started playback.
    #[must_use]
    pub fn last_handle(&self) -> Option<Arc<FakeHandleShared>> {
        self.inner
            .lock()
            .expect("fake sink lock")
            .handles
            .last()
            .cloned()
    }
}

#[async_trait]
impl PlaybackSink for FakeSink {
    async fn start(&self, _clip: &AudioClip, muted: bool) -> anyhow::Result<StartedPlayback> {
        let mut inner = self.inner.lock().expect("fake sink lock");
        if inner.fail_next {
            inner.fail_next = false;
            anyhow::bail!("simulated playback start failure");
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let (over_tx, over_rx) = watch::channel(false);
        let shared = Arc::new(FakeHandleShared {
            id,
            muted: AtomicBool::new(muted),
            over_tx,
            over_rx,
            events: Arc::clone(&self.events),
        });
        self.events
            .lock()
            .expect("fake sink events lock")
            .push(format!("start:{id}"));
        inner.handles.push(Arc::clone(&shared));

        Ok(StartedPlayback {
            handle: Box::new(FakeHandle(shared)),
            audible: !inner.inaudible,
        })
    }
}

// ---------------------------------------------------------------------------
// Capture device

struct FakeCaptureInner {
    chunks: Vec<Vec<u8>>,
    fail: bool,
    supported: Vec<String>,
}

/// Capture device that emits canned chunks and tracks live captures.
pub struct FakeCapture {
    inner: Mutex<FakeCaptureInner>,
    active: AtomicUsize,
}

impl FakeCapture {
    /// A device that emits the given chunks, then runs until cancelled.
    #[must_use]
    pub fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            inner: Mutex::new(FakeCaptureInner {
                chunks,
                fail: false,
                supported: vec!["audio/wav".to_owned()],
            }),
            active: AtomicUsize::new(0),
        }
    }

    /// A device whose capture fails immediately.
    #[must_use]
    pub fn failing() -> Self {
        let capture = Self::with_chunks(Vec::new());
        capture.inner.lock().expect("fake capture lock").fail = true;
        capture
    }

    pub fn set_supported(&self, encodings: Vec<String>) {
        self.inner.lock().expect("fake capture lock").supported = encodings;
    }

    /// Number of capture loops currently running.
    #[must_use]
    pub fn active_captures(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    fn supports_encoding(&self, mime: &str) -> bool {
        self.inner
            .lock()
            .expect("fake capture lock")
            .supported
            .iter()
            .any(|s| s == mime)
    }

    async fn capture(
        &self,
        _encoding: &str,
        chunk_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let result = async {
            let (chunks, fail) = {
                let inner = self.inner.lock().expect("fake capture lock");
                (inner.chunks.clone(), inner.fail)
            };
            if fail {
                anyhow::bail!("simulated capture device failure");
            }
            for chunk in chunks {
                if chunk_tx.send(chunk.into()).await.is_err() {
                    break;
                }
            }
            cancel.cancelled().await;
            Ok(())
        }
        .await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
