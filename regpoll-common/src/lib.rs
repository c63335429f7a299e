//! regpoll common library
//!
//! Shared pieces of the regpoll register poller:
//!
//! - [`config`] - JSON5 configuration loading, logging and Zenoh settings
//! - [`value`] - Field value model shared by decoded and display values
//! - [`snapshot`] - Device, collector and traffic snapshots
//! - [`serialization`] - JSON/CBOR snapshot encoding
//! - [`keyexpr`] - Key expressions for published snapshots
//! - [`session`] - Zenoh session setup
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod serialization;
pub mod session;
pub mod snapshot;
pub mod value;

pub use config::{LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use keyexpr::{KEY_PREFIX, KeyExprBuilder, ParsedKeyExpr, SnapshotKind, parse_key_expr};
pub use serialization::{Format, decode, decode_auto, encode};
pub use session::connect;
pub use snapshot::{CollectorSnapshot, DeviceSnapshot, TrafficStats};
pub use value::{FieldValue, current_timestamp_millis};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Supports two
/// output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Logging(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Logging(e.to_string()))?;
        }
    }

    Ok(())
}
