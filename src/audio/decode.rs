//! Audio payload decoding via symphonia.
//!
//! Backend clips arrive as encoded bytes plus a declared content type
//! (wav or mp3 in practice). Decoding yields interleaved f32 samples for
//! the output device.

use crate::error::{Result, WidgetError};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded PCM audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
}

impl DecodedAudio {
    /// Downmix to mono by averaging channels.
    #[must_use]
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples.clone();
        }
        let ch = self.channels as usize;
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

fn hint_for(content_type: &str) -> Hint {
    let mut hint = Hint::new();
    match content_type.split(';').next().unwrap_or_default().trim() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => {
            hint.with_extension("wav");
        }
        "audio/mpeg" | "audio/mp3" => {
            hint.with_extension("mp3");
        }
        _ => {}
    }
    hint
}

/// Decode an encoded clip into PCM.
///
/// # Errors
///
/// Returns an error if the container cannot be probed or the stream fails
/// to decode.
pub fn decode_clip(bytes: &[u8], content_type: &str) -> Result<DecodedAudio> {
    let cursor = std::io::Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &hint_for(content_type),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| WidgetError::Audio(format!("unrecognized audio payload: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| WidgetError::Audio("audio payload has no track".to_owned()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| WidgetError::Audio(format!("unsupported codec: {e}")))?;

    let mut samples = Vec::new();
    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(WidgetError::Audio(format!("read failed: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt frame is skipped, not fatal.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(WidgetError::Audio(format!("decode failed: {e}"))),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let buf = sample_buf.get_or_insert_with(|| {
            SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
        });
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    if samples.is_empty() {
        return Err(WidgetError::Audio("audio payload decoded to nothing".to_owned()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    /// Build a small in-memory WAV file (16-bit mono).
    fn wav_fixture(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_wav_payload() {
        let bytes = wav_fixture(&[0, 16_384, -16_384, 0], 16_000);
        let decoded = decode_clip(&bytes, "audio/wav").unwrap();
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples.len(), 4);
        assert!((decoded.samples[1] - 0.5).abs() < 0.01);
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(decode_clip(b"definitely not audio", "audio/wav").is_err());
        assert!(decode_clip(&[], "audio/mpeg").is_err());
    }

    #[test]
    fn mono_downmix_averages_channels() {
        let stereo = DecodedAudio {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 16_000,
            channels: 2,
        };
        let mono = stereo.to_mono();
        assert_eq!(mono, vec![0.5, 0.5]);
    }
}
