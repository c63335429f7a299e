use std::path::PathBuf;
use thiserror::Error;

use crate::serialization::Format;

/// Errors shared by the regpoll crates.
///
/// Config and logging failures are fatal at startup; the rest surface
/// per publish or per key and are logged by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {origin}: {message}")]
    ConfigParse { origin: String, message: String },

    #[error("Failed to initialize tracing: {0}")]
    Logging(String),

    #[error("Invalid Zenoh settings: {0}")]
    ZenohConfig(String),

    #[error("Zenoh error: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("Failed to encode {format} payload: {message}")]
    Encode { format: Format, message: String },

    #[error("Failed to decode {format} payload: {message}")]
    Decode { format: Format, message: String },

    #[error("Invalid key expression: {0}")]
    KeyExpr(String),
}

impl Error {
    pub(crate) fn encode(format: Format, e: impl std::fmt::Display) -> Self {
        Error::Encode {
            format,
            message: e.to_string(),
        }
    }

    pub(crate) fn decode(format: Format, e: impl std::fmt::Display) -> Self {
        Error::Decode {
            format,
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
