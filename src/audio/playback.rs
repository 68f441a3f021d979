//! Clip playback to system speakers via cpal.
//!
//! Each clip gets a dedicated playback thread owning the output stream; the
//! async [`PlaybackHandle`] controls it through shared flags, so mute and
//! stop take effect mid-clip.

use crate::audio::decode;
use crate::audio::sink::{PlaybackHandle, PlaybackSink, StartedPlayback};
use crate::backend::AudioClip;
use crate::config::AudioConfig;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info};

/// Playback sink backed by a cpal output stream.
pub struct CpalSink {
    output_device: Option<String>,
}

impl CpalSink {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            output_device: config.output_device.clone(),
        }
    }
}

struct PlayState {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

struct CpalHandle {
    muted: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    over_rx: watch::Receiver<bool>,
}

#[async_trait]
impl PlaybackHandle for CpalHandle {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.wait_ended().await;
    }

    async fn wait_ended(&self) {
        let mut rx = self.over_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn is_ended(&self) -> bool {
        *self.over_rx.borrow()
    }
}

#[async_trait]
impl PlaybackSink for CpalSink {
    async fn start(&self, clip: &AudioClip, muted: bool) -> anyhow::Result<StartedPlayback> {
        let decoded = decode::decode_clip(&clip.bytes, &clip.content_type)?;
        let samples = decoded.to_mono();
        let sample_rate = decoded.sample_rate;

        let muted_flag = Arc::new(AtomicBool::new(muted));
        let stopped = Arc::new(AtomicBool::new(false));
        let (over_tx, over_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let thread_muted = Arc::clone(&muted_flag);
        let thread_stopped = Arc::clone(&stopped);
        let device_name = self.output_device.clone();
        std::thread::spawn(move || {
            run_playback(
                samples,
                sample_rate,
                device_name,
                thread_muted,
                thread_stopped,
                over_tx,
                ready_tx,
            );
        });

        ready_rx
            .await
            .map_err(|_| anyhow::anyhow!("playback thread exited before starting"))??;

        Ok(StartedPlayback {
            handle: Box::new(CpalHandle {
                muted: muted_flag,
                stopped,
                over_rx,
            }),
            audible: true,
        })
    }
}

fn open_output_device(device_name: Option<&str>) -> anyhow::Result<cpal::Device> {
    let host = cpal::default_host();
    match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| anyhow::anyhow!("cannot enumerate devices: {e}"))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow::anyhow!("output device '{name}' not found")),
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("no default output device")),
    }
}

fn run_playback(
    samples: Vec<f32>,
    sample_rate: u32,
    device_name: Option<String>,
    muted: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    over_tx: watch::Sender<bool>,
    ready_tx: tokio::sync::oneshot::Sender<anyhow::Result<()>>,
) {
    let state = Arc::new(Mutex::new(PlayState {
        samples,
        position: 0,
        finished: false,
    }));

    let built = build_stream(&state, sample_rate, device_name.as_deref(), &muted);
    let stream = match built {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            let _ = over_tx.send(true);
            return;
        }
    };

    loop {
        std::thread::sleep(std::time::Duration::from_millis(10));
        if stopped.load(Ordering::Relaxed) {
            break;
        }
        let finished = state.lock().map(|s| s.finished).unwrap_or(true);
        if finished {
            break;
        }
    }

    drop(stream);
    let _ = over_tx.send(true);
}

fn build_stream(
    state: &Arc<Mutex<PlayState>>,
    sample_rate: u32,
    device_name: Option<&str>,
    muted: &Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream> {
    let device = open_output_device(device_name)?;
    let device_desc = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("playing clip on output device: {device_desc}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let cb_state = Arc::clone(state);
    let cb_muted = Arc::clone(muted);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut st = match cb_state.lock() {
                    Ok(st) => st,
                    Err(_) => return,
                };
                // Mute silences output but keeps the clip advancing.
                let silent = cb_muted.load(Ordering::Relaxed);
                for sample in data.iter_mut() {
                    if st.position < st.samples.len() {
                        *sample = if silent { 0.0 } else { st.samples[st.position] };
                        st.position += 1;
                    } else {
                        *sample = 0.0;
                        st.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| anyhow::anyhow!("failed to build output stream: {e}"))?;

    stream
        .play()
        .map_err(|e| anyhow::anyhow!("failed to start output stream: {e}"))?;
    Ok(stream)
}
