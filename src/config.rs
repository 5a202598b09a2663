//! Configuration loading and types for loopcap
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/loopcap/config.toml)
//! 3. Environment variables (LOOPCAP_*)
//! 4. CLI arguments (highest priority)

use crate::error::{LoopcapError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Loopcap Configuration
#
# Location: ~/.config/loopcap/config.toml
# Every key is optional. Environment variables (LOOPCAP_*) override the file,
# CLI flags override both.

# Directory that receives the WAV chunk files
# (default: <data dir>/loopcap/chunks)
# data_dir = "/var/lib/loopcap"

# Log filter directive, same syntax as RUST_LOG (env: LOOPCAP_LOG)
# log_level = "loopcap=debug"

[capture]
# Length of each chunk handed to the consumer, in seconds (env: LOOPCAP_CHUNK_SECONDS)
chunk_duration_secs = 120

# Length of each blocking device read, in seconds (env: LOOPCAP_SEGMENT_SECONDS)
segment_duration_secs = 1

# Requested sample rate in Hz; the device may grant another (env: LOOPCAP_SAMPLE_RATE)
sample_rate = 44100

# Requested channel count, 1 or 2 (env: LOOPCAP_CHANNELS)
channels = 2

# How long stop waits for the recording thread before giving up on it
stop_timeout_secs = 5

# Slack on top of the segment duration before a read is declared failed
read_timeout_secs = 5

[device]
# Explicit device index from `loopcap devices` (env: LOOPCAP_DEVICE_ID)
# id = 3

# Case-insensitive substring of the device name (env: LOOPCAP_DEVICE_NAME)
# name = "monitor"
"#;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    /// Directory for chunk files; None means the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// EnvFilter directive used by the binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Recording parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_secs: f64,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: f64,

    /// Requested sample rate; treated as a preference during negotiation
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Requested channel count; treated as a preference during negotiation
    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: f64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: f64,
}

/// Device overrides consulted by the selector
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_chunk_duration() -> f64 {
    120.0
}

fn default_segment_duration() -> f64 {
    1.0
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u16 {
    2
}

fn default_stop_timeout() -> f64 {
    5.0
}

fn default_read_timeout() -> f64 {
    5.0
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: default_chunk_duration(),
            segment_duration_secs: default_segment_duration(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            stop_timeout_secs: default_stop_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl CaptureConfig {
    /// Number of frames per chunk at the negotiated rate (at least one)
    pub fn chunk_frames(&self, sample_rate: u32) -> usize {
        frames_for(self.chunk_duration_secs, sample_rate)
    }

    /// Number of frames per device read at the negotiated rate (at least one)
    pub fn segment_frames(&self, sample_rate: u32) -> usize {
        frames_for(self.segment_duration_secs, sample_rate)
    }

    /// Out-of-range values fall back to the default
    pub fn stop_timeout(&self) -> Duration {
        seconds_or(self.stop_timeout_secs, default_stop_timeout())
    }

    /// Upper bound on a single blocking read of one segment
    pub fn read_timeout(&self) -> Duration {
        seconds_or(
            self.segment_duration_secs + self.read_timeout_secs,
            default_segment_duration() + default_read_timeout(),
        )
    }
}

fn is_positive(seconds: f64) -> bool {
    seconds.is_finite() && seconds > 0.0
}

fn is_non_negative(seconds: f64) -> bool {
    seconds.is_finite() && seconds >= 0.0
}

fn seconds_or(seconds: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

fn frames_for(seconds: f64, sample_rate: u32) -> usize {
    ((seconds * sample_rate as f64).round() as usize).max(1)
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "loopcap")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the platform data directory
    pub fn platform_data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "loopcap")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    /// Directory that receives chunk files
    pub fn chunk_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::platform_data_dir().join("chunks"))
    }

    /// Reject values the capture engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let c = &self.capture;
        if !is_positive(c.chunk_duration_secs) {
            return Err(LoopcapError::Config(format!(
                "chunk_duration_secs must be positive, got {}",
                c.chunk_duration_secs
            )));
        }
        if !is_positive(c.segment_duration_secs) {
            return Err(LoopcapError::Config(format!(
                "segment_duration_secs must be positive, got {}",
                c.segment_duration_secs
            )));
        }
        if c.segment_duration_secs > c.chunk_duration_secs {
            return Err(LoopcapError::Config(format!(
                "segment_duration_secs ({}) must not exceed chunk_duration_secs ({})",
                c.segment_duration_secs, c.chunk_duration_secs
            )));
        }
        for (key, value) in [
            ("stop_timeout_secs", c.stop_timeout_secs),
            ("read_timeout_secs", c.read_timeout_secs),
        ] {
            if !is_non_negative(value) {
                return Err(LoopcapError::Config(format!(
                    "{} must be a finite number of seconds, got {}",
                    key, value
                )));
            }
        }
        if c.sample_rate == 0 {
            return Err(LoopcapError::Config("sample_rate must be positive".to_string()));
        }
        if !(1..=2).contains(&c.channels) {
            return Err(LoopcapError::Config(format!(
                "channels must be 1 or 2, got {}",
                c.channels
            )));
        }
        Ok(())
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;

            config = toml::from_str(&contents)
                .map_err(|e| LoopcapError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply LOOPCAP_* overrides obtained through `lookup`
///
/// Unparseable values are ignored with a warning so a typo in the
/// environment never prevents the engine from starting.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
        let raw = raw?;
        match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                None
            }
        }
    }

    if let Some(v) = parsed("LOOPCAP_CHUNK_SECONDS", lookup("LOOPCAP_CHUNK_SECONDS")) {
        config.capture.chunk_duration_secs = v;
    }
    if let Some(v) = parsed("LOOPCAP_SEGMENT_SECONDS", lookup("LOOPCAP_SEGMENT_SECONDS")) {
        config.capture.segment_duration_secs = v;
    }
    if let Some(v) = parsed("LOOPCAP_SAMPLE_RATE", lookup("LOOPCAP_SAMPLE_RATE")) {
        config.capture.sample_rate = v;
    }
    if let Some(v) = parsed("LOOPCAP_CHANNELS", lookup("LOOPCAP_CHANNELS")) {
        config.capture.channels = v;
    }
    if let Some(v) = parsed("LOOPCAP_DEVICE_ID", lookup("LOOPCAP_DEVICE_ID")) {
        config.device.id = Some(v);
    }
    if let Some(name) = lookup("LOOPCAP_DEVICE_NAME").filter(|n| !n.trim().is_empty()) {
        config.device.name = Some(name);
    }
    if let Some(dir) = lookup("LOOPCAP_DATA_DIR").filter(|d| !d.trim().is_empty()) {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Some(level) = lookup("LOOPCAP_LOG").filter(|l| !l.trim().is_empty()) {
        config.log_level = Some(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.capture.chunk_duration_secs, 120.0);
        assert_eq!(config.capture.segment_duration_secs, 1.0);
        assert_eq!(config.capture.sample_rate, 44100);
        assert_eq!(config.capture.channels, 2);
        assert!(config.device.id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_text_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.capture.chunk_duration_secs, 120.0);
        assert_eq!(config.capture.channels, 2);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            data_dir = "/tmp/chunks"

            [capture]
            chunk_duration_secs = 30
            channels = 1

            [device]
            name = "monitor"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capture.chunk_duration_secs, 30.0);
        assert_eq!(config.capture.channels, 1);
        assert_eq!(config.capture.sample_rate, 44100); // default
        assert_eq!(config.device.name.as_deref(), Some("monitor"));
        assert_eq!(config.chunk_dir(), PathBuf::from("/tmp/chunks"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                ("LOOPCAP_CHUNK_SECONDS", "60"),
                ("LOOPCAP_SEGMENT_SECONDS", "0.5"),
                ("LOOPCAP_SAMPLE_RATE", "48000"),
                ("LOOPCAP_CHANNELS", "1"),
                ("LOOPCAP_DEVICE_ID", "4"),
                ("LOOPCAP_DEVICE_NAME", "BlackHole"),
                ("LOOPCAP_DATA_DIR", "/srv/audio"),
            ]),
        );
        assert_eq!(config.capture.chunk_duration_secs, 60.0);
        assert_eq!(config.capture.segment_duration_secs, 0.5);
        assert_eq!(config.capture.sample_rate, 48000);
        assert_eq!(config.capture.channels, 1);
        assert_eq!(config.device.id, Some(4));
        assert_eq!(config.device.name.as_deref(), Some("BlackHole"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/audio")));
    }

    #[test]
    fn test_invalid_env_value_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[("LOOPCAP_SAMPLE_RATE", "fast"), ("LOOPCAP_DEVICE_ID", "-1")]),
        );
        assert_eq!(config.capture.sample_rate, 44100);
        assert!(config.device.id.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.capture.channels = 6;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.chunk_duration_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.segment_duration_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.segment_duration_secs = 40.0;
        config.capture.chunk_duration_secs = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_timeouts() {
        let config: Config = toml::from_str("[capture]\nstop_timeout_secs = inf").unwrap();
        assert!(matches!(config.validate(), Err(LoopcapError::Config(_))));

        let config: Config = toml::from_str("[capture]\nread_timeout_secs = nan").unwrap();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.read_timeout_secs = -1.0;
        assert!(config.validate().is_err());

        config.capture.read_timeout_secs = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeouts_never_panic() {
        let capture = CaptureConfig {
            stop_timeout_secs: f64::INFINITY,
            read_timeout_secs: 1e300,
            ..CaptureConfig::default()
        };
        assert_eq!(capture.stop_timeout(), Duration::from_secs(5));
        assert_eq!(capture.read_timeout(), Duration::from_secs(6));

        let capture = CaptureConfig {
            segment_duration_secs: 0.5,
            read_timeout_secs: 2.0,
            ..CaptureConfig::default()
        };
        assert_eq!(capture.read_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_long_segments_are_accepted() {
        let mut config = Config::default();
        config.capture.segment_duration_secs = 40.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unreadable_config_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(dir.path())).unwrap_err();
        assert!(matches!(err, LoopcapError::Io(_)));
    }

    #[test]
    fn test_frame_counts() {
        let capture = CaptureConfig {
            chunk_duration_secs: 2.0,
            segment_duration_secs: 0.5,
            ..CaptureConfig::default()
        };
        assert_eq!(capture.chunk_frames(48000), 96000);
        assert_eq!(capture.segment_frames(48000), 24000);
        assert_eq!(capture.segment_frames(0), 1);
    }
}
