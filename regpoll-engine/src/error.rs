use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned by the scheduler API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown decoder: {0}")]
    UnknownDecoder(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown collector: {0}")]
    UnknownCollector(String),

    #[error("Device '{0}' already exists")]
    DuplicateDevice(String),

    #[error("Collector '{0}' already exists")]
    DuplicateCollector(String),

    #[error("Poll interval of '{0}' must be greater than zero")]
    InvalidInterval(String),

    #[error("Collector '{id}': {reason}")]
    InvalidCollector { id: String, reason: String },

    #[error("{0}")]
    InvalidWrite(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
