//! Pipeline configuration.
//!
//! Every section defaults to the production constants, so an empty JSON
//! object (`{}`) is a complete configuration. Durations are written as
//! integer milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration file could not be used.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration for one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub connection: ConnectionConfig,
    pub store: StoreConfig,
    pub interpolation: InterpolationConfig,
    pub fallback: FallbackConfig,
}

impl PipelineConfig {
    /// Loads a JSON configuration file; missing keys take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigFileError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let interpolation = &self.interpolation;
        if interpolation.min_duration > interpolation.max_duration {
            return Err(ConfigFileError::Invalid(format!(
                "interpolation.min_duration ({}ms) exceeds max_duration ({}ms)",
                interpolation.min_duration.as_millis(),
                interpolation.max_duration.as_millis()
            )));
        }
        for (name, period) in [
            ("interpolation.frame_interval", interpolation.frame_interval),
            ("fallback.poll_interval", self.fallback.poll_interval),
        ] {
            if period.is_zero() {
                return Err(ConfigFileError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        for (name, scale) in [
            ("interpolation.distance_scale_ms", interpolation.distance_scale_ms),
            ("interpolation.velocity_scale_ms", interpolation.velocity_scale_ms),
        ] {
            if !scale.is_finite() || scale < 0.0 {
                return Err(ConfigFileError::Invalid(format!("{name} must be a non-negative number")));
            }
        }
        Ok(())
    }
}

/// Reconnection and handshake timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Fixed delay before each reconnect attempt (default: 5s)
    #[serde(with = "duration_ms")]
    pub reconnect_interval: Duration,

    /// Consecutive failures tolerated before giving up (default: 5)
    pub max_reconnect_attempts: u32,

    /// Re-send the snapshot request once if nothing arrived by then (default: 3s)
    #[serde(with = "duration_ms")]
    pub snapshot_retry_after: Duration,

    /// Clear the UI "connecting" flag after this long (default: 3s)
    #[serde(with = "duration_ms")]
    pub connecting_soft_timeout: Duration,

    /// Delay between teardown and reconnect on a manual reconnect (default: 1s)
    #[serde(with = "duration_ms")]
    pub manual_reconnect_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            snapshot_retry_after: Duration::from_secs(3),
            connecting_soft_timeout: Duration::from_secs(3),
            manual_reconnect_grace: Duration::from_secs(1),
        }
    }
}

/// Cache retention and freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Entries older than this are dropped at load (default: 24h)
    #[serde(with = "duration_ms")]
    pub retention: Duration,

    /// A vehicle is "online" if updated within this window (default: 5min)
    #[serde(with = "duration_ms")]
    pub online_timeout: Duration,

    /// Key the serialized cache is stored under
    pub storage_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            online_timeout: Duration::from_secs(5 * 60),
            storage_key: "vehicle_locations_cache".to_string(),
        }
    }
}

/// Marker animation tuning.
///
/// The two duration heuristics use unrelated scaling constants; both are
/// tunable rather than derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    #[serde(with = "duration_ms")]
    pub min_duration: Duration,

    #[serde(with = "duration_ms")]
    pub max_duration: Duration,

    /// Updates closer together than this are dropped while idle (default: 100ms)
    #[serde(with = "duration_ms")]
    pub throttle_window: Duration,

    /// Milliseconds of animation per degree moved, without a velocity hint
    pub distance_scale_ms: f64,

    /// Milliseconds per second of travel time, with a velocity hint
    pub velocity_scale_ms: f64,

    /// Tick period while any marker is animating (default: 16ms)
    #[serde(with = "duration_ms")]
    pub frame_interval: Duration,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_millis(500),
            max_duration: Duration::from_millis(2000),
            throttle_window: Duration::from_millis(100),
            distance_scale_ms: 10_000.0,
            velocity_scale_ms: 1_000.0,
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Disconnected-view self-healing poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,

    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(10),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.connection.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.snapshot_retry_after, Duration::from_secs(3));
        assert_eq!(config.store.retention, Duration::from_secs(86_400));
        assert_eq!(config.store.online_timeout, Duration::from_secs(300));
        assert_eq!(config.interpolation.min_duration, Duration::from_millis(500));
        assert_eq!(config.fallback.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "connection": { "maxReconnectAttempts": 3, "reconnect_interval": 250 },
            "store": { "online_timeout": 60000 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.connection.reconnect_interval, Duration::from_millis(250));
        // Unknown casing is ignored, default kept
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.store.online_timeout, Duration::from_secs(60));
        assert_eq!(config.store.storage_key, "vehicle_locations_cache");
    }

    #[test]
    fn test_roundtrip_through_file() {
        let mut config = PipelineConfig::default();
        config.interpolation.frame_interval = Duration::from_millis(33);

        let path = std::env::temp_dir().join(format!("fleetview-config-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        let loaded = PipelineConfig::from_json_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unusable_values_rejected_on_load() {
        let path = std::env::temp_dir().join(format!("fleetview-bad-config-{}.json", std::process::id()));

        std::fs::write(&path, r#"{"interpolation": {"min_duration": 3000}}"#).unwrap();
        let inverted = PipelineConfig::from_json_file(&path);

        std::fs::write(&path, r#"{"interpolation": {"frame_interval": 0}}"#).unwrap();
        let busy = PipelineConfig::from_json_file(&path);

        std::fs::write(&path, r#"{"fallback": {"poll_interval": 0}}"#).unwrap();
        let busy_poll = PipelineConfig::from_json_file(&path);
        let _ = std::fs::remove_file(&path);

        assert!(matches!(inverted, Err(ConfigFileError::Invalid(msg)) if msg.contains("min_duration")));
        assert!(matches!(busy, Err(ConfigFileError::Invalid(msg)) if msg.contains("frame_interval")));
        assert!(matches!(busy_poll, Err(ConfigFileError::Invalid(msg)) if msg.contains("poll_interval")));
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = PipelineConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigFileError::Io(_)));
    }
}
