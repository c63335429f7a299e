//! Configuration for the poller.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use regpoll_common::config::{LoggingConfig, ZenohConfig};
use regpoll_common::{Format, KEY_PREFIX};

use crate::catalog::DecoderRegistry;
use crate::expr::Expression;
use crate::schema::{DeviceDecoder, RegisterKind};
use crate::transport::ConnectParams;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] regpoll_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shared connection, opened at startup when present
    #[serde(default)]
    pub connection: Option<ConnectParams>,

    /// Per-request transport timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Decoders added to the built-in catalog
    #[serde(default)]
    pub decoders: Vec<DeviceDecoder>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,

    /// Snapshot publishing over Zenoh
    #[serde(default)]
    pub publish: Option<PublishConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_request_timeout_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: None,
            request_timeout_ms: default_request_timeout_ms(),
            decoders: Vec::new(),
            devices: Vec::new(),
            collectors: Vec::new(),
            publish: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// A decoder attached to a unit id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,

    /// Decoder id from the catalog
    pub decoder: String,

    /// Unit id (default: the decoder's default unit id)
    #[serde(default)]
    pub unit_id: Option<u8>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, decoder: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            decoder: decoder.into(),
            unit_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            enabled: default_enabled(),
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn with_interval(mut self, poll_interval_ms: u32) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// An ad-hoc poller over one fixed address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub id: String,

    #[serde(default = "default_collector_name")]
    pub name: String,

    pub register_type: RegisterKind,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    pub start_address: u16,

    /// Number of addresses to read (default: 1)
    #[serde(default = "default_count")]
    pub count: u16,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u32,

    /// Conversion over the raw array
    #[serde(default = "default_conversion")]
    pub conversion: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CollectorConfig {
    pub fn new(id: impl Into<String>, register_type: RegisterKind, start_address: u16, count: u16) -> Self {
        Self {
            id: id.into(),
            name: default_collector_name(),
            register_type,
            unit_id: default_unit_id(),
            start_address,
            count,
            poll_interval_ms: default_poll_interval_ms(),
            conversion: default_conversion(),
            enabled: default_enabled(),
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_interval(mut self, poll_interval_ms: u32) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_conversion(mut self, conversion: impl Into<String>) -> Self {
        self.conversion = conversion.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the range and compile the conversion.
    pub fn compile(&self) -> Result<Expression, String> {
        let limit = self.register_type.window_limit();
        if self.count == 0 || self.count > limit {
            return Err(format!("count must be 1-{}", limit));
        }
        if self.start_address as u32 + self.count as u32 - 1 > u16::MAX as u32 {
            return Err("range overflows the 16-bit address space".to_string());
        }
        Expression::compile(&self.conversion).map_err(|e| e.to_string())
    }
}

fn default_poll_interval_ms() -> u32 {
    1000
}

fn default_enabled() -> bool {
    true
}

fn default_unit_id() -> u8 {
    1
}

fn default_count() -> u16 {
    1
}

fn default_collector_name() -> String {
    "New Collector".to_string()
}

fn default_conversion() -> String {
    "at(0)".to_string()
}

/// Snapshot publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Key expression prefix (default: "regpoll")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_publish_interval_ms")]
    pub interval_ms: u64,

    /// Payload format: "json" or "cbor"
    #[serde(default)]
    pub format: Format,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

fn default_publish_interval_ms() -> u64 {
    1000
}

impl EngineConfig {
    /// Load and validate configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: EngineConfig = regpoll_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Decoder registry: the built-in catalog plus configured decoders.
    pub fn registry(&self) -> Result<DecoderRegistry, ConfigError> {
        DecoderRegistry::with_extra(self.decoders.iter().cloned())
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(ConnectParams::Rtu {
            data_bits,
            stop_bits,
            ..
        }) = &self.connection
        {
            if !(5..=8).contains(data_bits) {
                return Err(ConfigError::Validation(format!(
                    "invalid data_bits {} (use 5-8)",
                    data_bits
                )));
            }
            if !(1..=2).contains(stop_bits) {
                return Err(ConfigError::Validation(format!(
                    "invalid stop_bits {} (use 1 or 2)",
                    stop_bits
                )));
            }
        }

        let registry = self.registry()?;

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Device id cannot be empty".to_string(),
                ));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device id '{}'",
                    device.id
                )));
            }
            if registry.get(&device.decoder).is_none() {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': unknown decoder '{}'",
                    device.id, device.decoder
                )));
            }
            if device.poll_interval_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': poll_interval_ms must be greater than zero",
                    device.id
                )));
            }
        }

        let mut ids = HashSet::new();
        for collector in &self.collectors {
            if collector.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Collector id cannot be empty".to_string(),
                ));
            }
            if !ids.insert(collector.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate collector id '{}'",
                    collector.id
                )));
            }
            if collector.poll_interval_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "Collector '{}': poll_interval_ms must be greater than zero",
                    collector.id
                )));
            }
            collector.compile().map_err(|reason| {
                ConfigError::Validation(format!("Collector '{}': {}", collector.id, reason))
            })?;
        }

        if let Some(publish) = &self.publish {
            if publish.interval_ms == 0 {
                return Err(ConfigError::Validation(
                    "publish.interval_ms must be greater than zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Parity;

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            connection: { type: "tcp", host: "192.168.1.10" },
            devices: [
                { id: "meter", decoder: "pzem-004t-v3", unit_id: 3 },
                { id: "inverter", decoder: "solax-monitoring", poll_interval_ms: 5000, enabled: false },
            ],
            collectors: [
                {
                    id: "c1",
                    register_type: "holding",
                    start_address: 10,
                    count: 2,
                    conversion: "u32be(0)",
                },
            ],
            publish: { key_prefix: "site/a", format: "cbor" },
            logging: { level: "debug" },
        }"#;

        let config: EngineConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.connection, Some(ConnectParams::tcp("192.168.1.10", 502)));
        assert_eq!(config.request_timeout(), Duration::from_millis(2000));

        assert_eq!(config.devices[0].unit_id, Some(3));
        assert_eq!(config.devices[0].poll_interval_ms, 1000);
        assert!(config.devices[0].enabled);
        assert!(!config.devices[1].enabled);

        let collector = &config.collectors[0];
        assert_eq!(collector.name, "New Collector");
        assert_eq!(collector.unit_id, 1);
        assert_eq!(collector.register_type, RegisterKind::Holding);

        let publish = config.publish.as_ref().unwrap();
        assert_eq!(publish.key_prefix, "site/a");
        assert_eq!(publish.format, Format::Cbor);
        assert_eq!(publish.interval_ms, 1000);
        assert_eq!(publish.zenoh.mode, "peer");
    }

    #[test]
    fn test_parse_rtu_connection() {
        let json = r#"{
            connection: { type: "rtu", port: "/dev/ttyUSB0", baud_rate: 19200, parity: "odd", stop_bits: 2 },
        }"#;

        let config: EngineConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        match config.connection {
            Some(ConnectParams::Rtu {
                baud_rate,
                parity,
                stop_bits,
                ..
            }) => {
                assert_eq!(baud_rate, 19200);
                assert_eq!(parity, Parity::Odd);
                assert_eq!(stop_bits, 2);
            }
            _ => panic!("Expected RTU connection"),
        }
    }

    #[test]
    fn test_invalid_parity_rejected_by_parser() {
        let json = r#"{ connection: { type: "rtu", port: "/dev/ttyUSB0", parity: "mark" } }"#;
        assert!(json5::from_str::<EngineConfig>(json).is_err());
    }

    #[test]
    fn test_unknown_decoder_rejected() {
        let config = EngineConfig {
            devices: vec![DeviceConfig::new("x", "no-such-decoder")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown decoder"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = EngineConfig {
            devices: vec![
                DeviceConfig::new("meter", "pzem-004t-v3"),
                DeviceConfig::new("meter", "solax-control"),
            ],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = EngineConfig {
            collectors: vec![CollectorConfig::new("c", RegisterKind::Coil, 0, 8).with_interval(0)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collector_range_checks() {
        assert!(CollectorConfig::new("c", RegisterKind::Holding, 0, 0).compile().is_err());
        assert!(CollectorConfig::new("c", RegisterKind::Holding, 0, 101).compile().is_err());
        assert!(CollectorConfig::new("c", RegisterKind::Coil, 0, 1900).compile().is_ok());
        assert!(CollectorConfig::new("c", RegisterKind::Input, 0xFFFF, 2).compile().is_err());
        assert!(
            CollectorConfig::new("c", RegisterKind::Input, 0, 1)
                .with_conversion("at(0")
                .compile()
                .is_err()
        );
    }

    #[test]
    fn test_config_decoders_extend_catalog() {
        let json = r#"{
            decoders: [
                {
                    id: "boiler",
                    name: "Boiler",
                    fields: [
                        { address: 0, type: "holding", name: "Flow", data_type: "int16", unit: "°C", scale: 0.1 },
                    ],
                },
            ],
            devices: [ { id: "b1", decoder: "boiler" } ],
        }"#;

        let config: EngineConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        let registry = config.registry().unwrap();
        assert_eq!(registry.get("boiler").unwrap().default_unit_id, 1);
        assert!(registry.get("pzem-004t-v3").is_some());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            EngineConfig::load_from_file("/nonexistent/regpoll.json5"),
            Err(ConfigError::Load(_))
        ));
    }
}
