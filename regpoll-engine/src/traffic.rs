//! Approximate frame sizes used for traffic accounting.
//!
//! TCP frames carry a 7-byte MBAP header, RTU frames a 1-byte address and a
//! 2-byte CRC around the PDU.

use crate::transport::ConnectionMode;

pub use regpoll_common::TrafficStats;

/// Read request: function code, start address and quantity.
pub fn read_request_bytes(mode: ConnectionMode) -> u64 {
    match mode {
        ConnectionMode::Tcp => 12,
        ConnectionMode::Rtu => 8,
    }
}

/// Read response: function code, byte count and the payload.
pub fn read_response_bytes(mode: ConnectionMode, payload: u64) -> u64 {
    match mode {
        ConnectionMode::Tcp => 7 + 2 + payload,
        ConnectionMode::Rtu => 3 + payload + 2,
    }
}

/// Write request. A single value has a fixed size, several values carry a
/// byte count and the payload.
pub fn write_request_bytes(mode: ConnectionMode, values: usize, payload: u64) -> u64 {
    match (mode, values) {
        (ConnectionMode::Tcp, 1) => 12,
        (ConnectionMode::Tcp, _) => 7 + 6 + payload,
        (ConnectionMode::Rtu, 1) => 8,
        (ConnectionMode::Rtu, _) => 7 + payload + 2,
    }
}

/// Write response echoes the address and value or quantity.
pub fn write_response_bytes(mode: ConnectionMode) -> u64 {
    match mode {
        ConnectionMode::Tcp => 12,
        ConnectionMode::Rtu => 8,
    }
}
