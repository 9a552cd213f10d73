use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A breaker configuration that cannot work as written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerConfigError {
    #[error("breaker name must not be empty")]
    EmptyName,
    #[error("{name}: error_threshold_percentage must be 0-100, got {value}")]
    ThresholdOutOfRange { name: String, value: u8 },
    #[error("{name}: buckets must be at least 1")]
    NoBuckets { name: String },
    #[error("{name}: window {window:?} is too short for {buckets} buckets")]
    WindowTooShort { name: String, window: Duration, buckets: u32 },
    #[error("{name}: timeout must be non-zero")]
    ZeroTimeout { name: String },
}

/// Per-dependency breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub name: String,
    /// Longest a single call may run before it is abandoned and counted as a failure.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Failure rate (0-100) at or above which the circuit opens.
    pub error_threshold_percentage: u8,
    /// How long the circuit stays open before a trial call is allowed.
    #[serde(with = "millis")]
    pub reset_timeout: Duration,
    /// Minimum samples in the window before the failure rate is considered.
    pub volume_threshold: u32,
    /// Length of the rolling window.
    #[serde(with = "millis")]
    pub window: Duration,
    pub buckets: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            timeout: Duration::from_secs(10),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 5,
            window: Duration::from_secs(10),
            buckets: 10,
        }
    }
}

impl BreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Uploads to the asset store: slow calls tolerated, opens a little later.
    pub fn asset_upload() -> Self {
        Self {
            name: "asset-upload".to_string(),
            timeout: Duration::from_secs(30),
            error_threshold_percentage: 60,
            reset_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn asset_delete() -> Self {
        Self {
            name: "asset-delete".to_string(),
            timeout: Duration::from_secs(10),
            error_threshold_percentage: 70,
            reset_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Generic third-party HTTP API.
    pub fn external_api(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Width of one rolling-window bucket.
    pub fn bucket_width(&self) -> Duration {
        self.window / self.buckets.max(1)
    }

    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        let name = || self.name.clone();
        if self.name.is_empty() {
            return Err(BreakerConfigError::EmptyName);
        }
        if self.error_threshold_percentage > 100 {
            return Err(BreakerConfigError::ThresholdOutOfRange {
                name: name(),
                value: self.error_threshold_percentage,
            });
        }
        if self.buckets == 0 {
            return Err(BreakerConfigError::NoBuckets { name: name() });
        }
        if self.bucket_width().is_zero() {
            return Err(BreakerConfigError::WindowTooShort {
                name: name(),
                window: self.window,
                buckets: self.buckets,
            });
        }
        if self.timeout.is_zero() {
            return Err(BreakerConfigError::ZeroTimeout { name: name() });
        }
        Ok(())
    }
}

/// Durations as integer milliseconds in configuration files.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        let upload = BreakerConfig::asset_upload();
        assert_eq!(upload.timeout, Duration::from_secs(30));
        assert_eq!(upload.error_threshold_percentage, 60);
        assert_eq!(upload.reset_timeout, Duration::from_secs(60));
        assert_eq!(upload.volume_threshold, 5);

        let delete = BreakerConfig::asset_delete();
        assert_eq!(delete.error_threshold_percentage, 70);

        let api = BreakerConfig::external_api("geo");
        assert_eq!(api.name, "geo");
        assert_eq!(api.timeout, Duration::from_secs(5));
    }

    #[test]
    fn validation_rejects_inconsistent_values() {
        assert!(BreakerConfig::default().validate().is_ok());

        let mut bad = BreakerConfig::default();
        bad.error_threshold_percentage = 101;
        assert_eq!(
            bad.validate(),
            Err(BreakerConfigError::ThresholdOutOfRange {
                name: "default".to_string(),
                value: 101
            })
        );

        let mut bad = BreakerConfig::default();
        bad.buckets = 0;
        assert!(matches!(bad.validate(), Err(BreakerConfigError::NoBuckets { .. })));

        let mut bad = BreakerConfig::default();
        bad.window = Duration::from_nanos(5);
        assert!(matches!(bad.validate(), Err(BreakerConfigError::WindowTooShort { .. })));

        let unnamed = BreakerConfig::named("");
        assert_eq!(unnamed.validate(), Err(BreakerConfigError::EmptyName));
    }

    #[test]
    fn durations_are_millis_on_the_wire() {
        let json = serde_json::to_value(BreakerConfig::default()).unwrap();
        assert_eq!(json["timeout"], 10_000);
        let partial: BreakerConfig =
            serde_json::from_value(serde_json::json!({"name": "x", "reset_timeout": 1500})).unwrap();
        assert_eq!(partial.name, "x");
        assert_eq!(partial.reset_timeout, Duration::from_millis(1500));
        assert_eq!(partial.volume_threshold, 5);
    }
}
