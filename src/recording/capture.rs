//! Microphone capture using cpal.
//!
//! Captures at the device's native sample rate, downsamples to the
//! configured rate, and flushes a single 16-bit WAV payload when the
//! capture is cancelled.

use crate::config::RecordingConfig;
use crate::recording::CaptureDevice;
use async_trait::async_trait;
use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Capture device backed by a cpal input stream, producing WAV payloads.
pub struct CpalRecorder {
    input_device: Option<String>,
    target_sample_rate: u32,
}

impl CpalRecorder {
    #[must_use]
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
            target_sample_rate: config.sample_rate,
        }
    }

    fn open_input_device(&self) -> anyhow::Result<cpal::Device> {
        let host = cpal::default_host();
        match self.input_device.as_deref() {
            Some(name) => host
                .input_devices()
                .map_err(|e| anyhow::anyhow!("cannot enumerate devices: {e}"))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| anyhow::anyhow!("input device '{name}' not found")),
            None => host
                .default_input_device()
                .ok_or_else(|| anyhow::anyhow!("no default input device")),
        }
    }
}

#[async_trait]
impl CaptureDevice for CpalRecorder {
    fn supports_encoding(&self, mime: &str) -> bool {
        matches!(
            mime.split(';').next().unwrap_or_default().trim(),
            "audio/wav" | "audio/x-wav" | "audio/wave"
        )
    }

    async fn capture(
        &self,
        _encoding: &str,
        chunk_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let device = self.open_input_device()?;
        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());

        let default_config = device
            .default_input_config()
            .map_err(|e| anyhow::anyhow!("no default input config: {e}"))?;
        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "capturing from '{device_name}': native {}Hz/{}ch -> {}Hz mono",
            native_rate, native_channels, self.target_sample_rate
        );

        let buffer: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let cb_buffer = Arc::clone(&buffer);
        let target_rate = self.target_sample_rate;

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    if let Ok(mut buf) = cb_buffer.lock() {
                        buf.extend_from_slice(&samples);
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| anyhow::anyhow!("failed to build input stream: {e}"))?;

        stream
            .play()
            .map_err(|e| anyhow::anyhow!("failed to start input stream: {e}"))?;

        cancel.cancelled().await;
        drop(stream);

        let samples = buffer
            .lock()
            .map_err(|e| anyhow::anyhow!("capture buffer lock poisoned: {e}"))?
            .clone();
        if samples.is_empty() {
            return Ok(());
        }

        let wav = encode_wav(&samples, self.target_sample_rate)?;
        info!("captured {} samples ({} bytes WAV)", samples.len(), wav.len());
        let _ = chunk_tx.send(wav.into()).await;
        Ok(())
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler; sufficient for speech payloads.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Encode mono f32 samples as a 16-bit PCM WAV file in memory.
fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| anyhow::anyhow!("failed to create WAV writer: {e}"))?;
        for &sample in samples {
            let clamped = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(clamped)
                .map_err(|e| anyhow::anyhow!("failed to write WAV sample: {e}"))?;
        }
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("failed to finalize WAV: {e}"))?;
    }
    Ok(cursor.into_inner())
}
