//! Configuration types for the widget core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for one embedded widget instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    /// Authentication gate settings.
    pub auth: AuthConfig,
    /// Audio playback settings.
    pub audio: AudioConfig,
    /// Voice recording settings.
    pub recording: RecordingConfig,
    /// Backend endpoint settings.
    pub backend: BackendConfig,
}

/// Authentication gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Number of unauthenticated messages allowed before the gate engages.
    pub message_threshold: u32,
    /// OTP resend cool-down window in seconds.
    ///
    /// The window start is persisted as a wall-clock timestamp, so a host
    /// restart reconstructs the remaining seconds instead of resetting it.
    pub resend_cooldown_secs: u64,
    /// Number of digits in an OTP code.
    pub otp_length: usize,
    /// Whether a 403 without an auth or subscription marker engages the gate.
    ///
    /// Defensive fallback; backends with a strict error contract can turn
    /// this off.
    pub treat_bare_403_as_auth_required: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            message_threshold: 2,
            resend_cooldown_secs: 60,
            otp_length: 6,
            treat_bare_403_as_auth_required: true,
        }
    }
}

/// Audio playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Whether bot replies are played aloud at all.
    pub enabled: bool,
    /// Whether playback starts muted.
    pub start_muted: bool,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_muted: false,
            output_device: None,
        }
    }
}

/// Voice recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Hard ceiling on a single recording, in milliseconds. The capture
    /// task auto-stops when it elapses.
    pub max_duration_ms: u64,
    /// Payload encodings in preference order; the first one the capture
    /// device supports is used.
    pub preferred_encodings: Vec<String>,
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: 30_000,
            preferred_encodings: vec![
                "audio/wav".to_owned(),
                "audio/ogg;codecs=opus".to_owned(),
                "audio/mp4".to_owned(),
            ],
            sample_rate: 16_000,
            input_device: None,
        }
    }
}

impl RecordingConfig {
    /// The hard recording deadline as a [`Duration`].
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Backend endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the chat/OTP/TTS/STT backend.
    pub api_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.example.com".to_owned(),
            request_timeout_secs: 30,
        }
    }
}

impl WidgetConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::WidgetError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::WidgetError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/colloquy/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("colloquy").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("colloquy")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/colloquy-config/config.toml")
        }
    }
}
