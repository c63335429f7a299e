//! Register transport abstraction.
//!
//! A transport performs one request/response exchange per call and fails fast.
//! Framing, CRC and timeouts live behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::RegisterKind;

pub mod memory;
pub mod modbus;

pub use memory::MemoryTransport;
pub use modbus::ModbusTransport;

/// Transport failures. The message is what ends up in a device's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Modbus exception: {0}")]
    Exception(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Values returned by a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterData {
    /// Holding or input registers.
    Words(Vec<u16>),
    /// Coils or discrete inputs.
    Bits(Vec<bool>),
}

impl RegisterData {
    pub fn len(&self) -> usize {
        match self {
            RegisterData::Words(w) => w.len(),
            RegisterData::Bits(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the data on the wire: two bytes per word, eight bits per byte.
    pub fn payload_bytes(&self) -> u64 {
        match self {
            RegisterData::Words(w) => 2 * w.len() as u64,
            RegisterData::Bits(b) => (b.len() as u64).div_ceil(8),
        }
    }
}

/// Values to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteValues {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

impl WriteValues {
    pub fn len(&self) -> usize {
        match self {
            WriteValues::Words(w) => w.len(),
            WriteValues::Bits(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload_bytes(&self) -> u64 {
        match self {
            WriteValues::Words(w) => 2 * w.len() as u64,
            WriteValues::Bits(b) => (b.len() as u64).div_ceil(8),
        }
    }

    /// Check that the values suit the register kind.
    pub fn check_kind(&self, kind: RegisterKind) -> Result<(), TransportError> {
        match (kind, self) {
            (RegisterKind::Holding, WriteValues::Words(_)) | (RegisterKind::Coil, WriteValues::Bits(_)) => {
                Ok(())
            }
            (RegisterKind::Input | RegisterKind::Discrete, _) => Err(TransportError::InvalidRequest(
                format!("{} registers are read-only", kind),
            )),
            _ => Err(TransportError::InvalidRequest(format!(
                "value type does not match {} registers",
                kind
            ))),
        }
    }
}

/// Link type of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Tcp,
    Rtu,
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Connection parameters (TCP or RTU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectParams {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl ConnectParams {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ConnectParams::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        match self {
            ConnectParams::Tcp { .. } => ConnectionMode::Tcp,
            ConnectParams::Rtu { .. } => ConnectionMode::Rtu,
        }
    }

    /// Short human-readable endpoint description.
    pub fn endpoint(&self) -> String {
        match self {
            ConnectParams::Tcp { host, port } => format!("{}:{}", host, port),
            ConnectParams::Rtu {
                port, baud_rate, ..
            } => format!("{} @ {}", port, baud_rate),
        }
    }
}

/// One request/response register exchange.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Open the link, replacing any previous one.
    async fn connect(&mut self, params: &ConnectParams) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Read `count` addresses starting at `start` from one unit.
    async fn read(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<RegisterData, TransportError>;

    async fn write(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        values: &WriteValues,
    ) -> Result<(), TransportError>;
}
