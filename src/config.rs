//! Relay configuration.
//!
//! Both ends of a link read the same file so they agree on the fragmentation
//! format. Every field has a default, so an empty JSON object is a valid
//! configuration.
//!
//! # Example
//!
//! ```
//! use apdu_ble_relay::{FragmentationFormat, RelayConfig};
//!
//! let config = RelayConfig::from_json(r#"{ "format": "offset", "capacity": 185 }"#).unwrap();
//! assert_eq!(config.format, FragmentationFormat::Offset);
//! assert_eq!(config.capacity, 185);
//! assert_eq!(config.connect_timeout_ms, 120_000);
//! ```

use crate::ble::FragmentationFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default fragment capacity, the largest ATT attribute value.
pub const DEFAULT_CAPACITY: usize = 512;

/// Default bound on establishing the link.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 120_000;

/// Default bound on the MaxMemory probe.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 120_000;

/// Default number of attempts for a GATT acknowledgement.
pub const DEFAULT_ACK_RETRY_ATTEMPTS: u32 = 3;

/// Default depth of each bounded channel.
pub const DEFAULT_CHANNEL_DEPTH: usize = 16;

/// Relay settings shared by the central and peripheral roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Fragmentation wire format.
    pub format: FragmentationFormat,
    /// Peripheral fragment capacity, also served on MaxMemory.
    pub capacity: usize,
    /// Bound on the client connect.
    pub connect_timeout_ms: u64,
    /// Bound on the client MaxMemory probe.
    pub probe_timeout_ms: u64,
    /// Capacity used when the probe fails, and ceiling for probed values.
    pub fallback_capacity: usize,
    /// Attempts made for a GATT response while the stack is busy.
    pub ack_retry_attempts: u32,
    /// Depth of each bounded channel between the wireless and card domains.
    pub channel_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            format: FragmentationFormat::default(),
            capacity: DEFAULT_CAPACITY,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            fallback_capacity: DEFAULT_CAPACITY,
            ack_retry_attempts: DEFAULT_ACK_RETRY_ATTEMPTS,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

impl RelayConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.format.min_capacity();
        if self.capacity < min {
            return Err(ConfigError::CapacityTooSmall {
                field: "capacity",
                capacity: self.capacity,
                min,
            });
        }
        if self.fallback_capacity < min {
            return Err(ConfigError::CapacityTooSmall {
                field: "fallback_capacity",
                capacity: self.fallback_capacity,
                min,
            });
        }
        if self.capacity > u32::MAX as usize {
            return Err(ConfigError::CapacityTooLarge {
                capacity: self.capacity,
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("connect_timeout_ms"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("probe_timeout_ms"));
        }
        if self.ack_retry_attempts == 0 {
            return Err(ConfigError::ZeroValue("ack_retry_attempts"));
        }
        if self.channel_depth == 0 {
            return Err(ConfigError::ZeroValue("channel_depth"));
        }
        Ok(())
    }

    /// Connect bound as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Probe bound as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A capacity leaves no room for payload under the chosen format.
    CapacityTooSmall {
        field: &'static str,
        capacity: usize,
        min: usize,
    },
    /// Capacity does not fit the 4-byte MaxMemory value.
    CapacityTooLarge { capacity: usize },
    /// A field that must be positive is zero.
    ZeroValue(&'static str),
    /// The file could not be read.
    Io(String),
    /// The JSON could not be parsed.
    InvalidFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityTooSmall {
                field,
                capacity,
                min,
            } => write!(f, "{} too small: {} (min {})", field, capacity, min),
            Self::CapacityTooLarge { capacity } => {
                write!(f, "capacity too large: {} (max {})", capacity, u32::MAX)
            }
            Self::ZeroValue(field) => write!(f, "{} must be greater than zero", field),
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Default Tests ====================

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.format, FragmentationFormat::Sequenced);
        assert_eq!(config.capacity, 512);
        assert_eq!(config.connect_timeout(), Duration::from_secs(120));
        assert_eq!(config.probe_timeout(), Duration::from_secs(120));
        assert_eq!(config.fallback_capacity, 512);
        assert_eq!(config.ack_retry_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(RelayConfig::from_json("{}").unwrap(), RelayConfig::default());
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_sequenced_capacity_four_rejected() {
        let result = RelayConfig::from_json(r#"{ "capacity": 4 }"#);
        assert!(matches!(
            result,
            Err(ConfigError::CapacityTooSmall {
                field: "capacity",
                capacity: 4,
                min: 5
            })
        ));
    }

    #[test]
    fn test_offset_capacity_one_accepted() {
        let config =
            RelayConfig::from_json(r#"{ "format": "offset", "capacity": 1, "fallback_capacity": 1 }"#)
                .unwrap();
        assert_eq!(config.capacity, 1);
    }

    #[test]
    fn test_zero_values_rejected() {
        for field in [
            "connect_timeout_ms",
            "probe_timeout_ms",
            "ack_retry_attempts",
            "channel_depth",
        ] {
            let json = format!(r#"{{ "{}": 0 }}"#, field);
            assert_eq!(
                RelayConfig::from_json(&json),
                Err(ConfigError::ZeroValue(field))
            );
        }
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            RelayConfig::from_json(r#"{ "format": "interleaved" }"#),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            RelayConfig::load("/nonexistent/relay.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = RelayConfig {
            format: FragmentationFormat::Offset,
            capacity: 20,
            ..RelayConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"offset\""));
        assert_eq!(RelayConfig::from_json(&json).unwrap(), config);
    }
}
