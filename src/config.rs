//! Application configuration
//!
//! All sections default to the values the pipelines were tuned with, so a
//! partial TOML file only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::CompressionProfile;
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub codec: CodecConfig,
    pub session: SessionConfig,
    pub playback: PlaybackConfig,
    pub telemetry: TelemetryConfig,
    pub network: NetworkConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/config.toml` for this application
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "mic-broadcast", "mic-broadcast")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject configurations the pipelines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audio.frame_size == 0 {
            return Err(Error::Config("audio.frame_size must be > 0".into()));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be > 0".into()));
        }
        if self.session.capacity == 0 {
            return Err(Error::Config("session.capacity must be > 0".into()));
        }
        if self.network.mtu == 0 {
            return Err(Error::Config("network.mtu must be > 0".into()));
        }
        if self.session.write_failure_limit == 0 {
            return Err(Error::Config("session.write_failure_limit must be > 0".into()));
        }
        if self.playback.min_delay > self.playback.max_delay {
            return Err(Error::Config(
                "playback.min_delay must not exceed playback.max_delay".into(),
            ));
        }
        if self.playback.max_delay > self.playback.jitter_capacity {
            return Err(Error::Config(
                "playback.max_delay must not exceed playback.jitter_capacity".into(),
            ));
        }
        if !self.playback.render_ring_capacity.is_power_of_two() {
            return Err(Error::Config(
                "playback.render_ring_capacity must be a power of two".into(),
            ));
        }
        Ok(())
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device id (`input:<name>`); default device when unset
    pub input_device: Option<String>,
    /// Output device id (`output:<name>`); default device when unset
    pub output_device: Option<String>,
    pub sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
    /// Bounded capacity of the capture → control channel, in packets
    pub channel_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            channel_capacity: CAPTURE_CHANNEL_CAPACITY,
        }
    }
}

impl AudioConfig {
    /// Duration of one frame at the configured rate
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(self.frame_size as u64 * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

/// Compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub profile: CompressionProfile,
    /// Follow profile suggestions raised by latency alerts
    pub adaptive_profile: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            profile: CompressionProfile::Medium,
            adaptive_profile: true,
        }
    }
}

/// Session pool and admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub capacity: usize,
    pub inactivity_threshold_ms: u64,
    pub admission_deadline_ms: u64,
    /// Consecutive write failures before a session is drained
    pub write_failure_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_SESSIONS,
            inactivity_threshold_ms: INACTIVITY_THRESHOLD_MS,
            admission_deadline_ms: ADMISSION_DEADLINE_MS,
            write_failure_limit: WRITE_FAILURE_LIMIT,
        }
    }
}

impl SessionConfig {
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }

    pub fn admission_deadline(&self) -> Duration {
        Duration::from_millis(self.admission_deadline_ms)
    }
}

/// Receiver-side playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum frames held in the jitter buffer
    pub jitter_capacity: usize,
    /// Frames buffered before playback starts
    pub min_delay: usize,
    /// Upper bound for the adaptive target depth
    pub max_delay: usize,
    pub reassembly_timeout_ms: u64,
    /// Frames queued between the control task and the output stream
    pub render_ring_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            jitter_capacity: JITTER_BUFFER_CAPACITY,
            min_delay: JITTER_MIN_DELAY,
            max_delay: JITTER_MAX_DELAY,
            reassembly_timeout_ms: REASSEMBLY_TIMEOUT_MS,
            render_ring_capacity: RING_BUFFER_CAPACITY,
        }
    }
}

impl PlaybackConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }
}

/// Telemetry windows and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub audio_latency_threshold_ms: f64,
    pub transport_latency_threshold_ms: f64,
    pub processing_time_threshold_ms: f64,
    pub battery_threshold_percent: f64,
    pub signal_threshold_percent: f64,
    pub latency_window: usize,
    pub cpu_window: usize,
    /// Inter-arrival intervals considered for buffer health
    pub health_window: usize,
    pub max_acceptable_stddev_ms: f64,
    pub signal_poll_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            audio_latency_threshold_ms: 100.0,
            transport_latency_threshold_ms: 200.0,
            processing_time_threshold_ms: 50.0,
            battery_threshold_percent: 20.0,
            signal_threshold_percent: 30.0,
            latency_window: 50,
            cpu_window: 10,
            health_window: 10,
            max_acceptable_stddev_ms: 50.0,
            signal_poll_interval_ms: 1000,
        }
    }
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mtu: usize,
    pub bind_address: String,
    pub udp_port: u16,
    /// Receivers the sender requests admission for at start-up
    pub receivers: Vec<String>,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            bind_address: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            receivers: Vec::new(),
            send_buffer_size: 1 << 20,
            recv_buffer_size: 1 << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.capacity, 7);
        assert_eq!(config.session.inactivity_threshold(), Duration::from_millis(5000));
        assert_eq!(config.session.admission_deadline(), Duration::from_millis(10_000));
        assert_eq!(config.codec.profile, CompressionProfile::Medium);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [session]
            capacity = 3

            [codec]
            profile = "high"
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.session.capacity, 3);
        assert_eq!(config.session.inactivity_threshold_ms, 5000);
        assert_eq!(config.codec.profile, CompressionProfile::High);
        assert_eq!(config.network.mtu, DEFAULT_MTU);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.audio.frame_size, config.audio.frame_size);
        assert_eq!(parsed.playback.max_delay, config.playback.max_delay);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.session.capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = AppConfig::default();
        config.playback.min_delay = 10;
        config.playback.max_delay = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frame_duration() {
        let audio = AudioConfig {
            sample_rate: 48_000,
            frame_size: 480,
            ..Default::default()
        };
        assert_eq!(audio.frame_duration(), Duration::from_millis(10));
    }
}
