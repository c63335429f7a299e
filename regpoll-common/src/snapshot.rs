//! Read-only snapshots of poller state, as shown to users and published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::FieldValue;

/// Approximate wire traffic since the last successful connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_messages: u64,
    pub rx_messages: u64,
}

impl TrafficStats {
    /// Account for one request/response exchange.
    pub fn record_exchange(&mut self, request_bytes: u64, response_bytes: u64) {
        self.tx_bytes += request_bytes;
        self.rx_bytes += response_bytes;
        self.tx_messages += 1;
        self.rx_messages += 1;
    }
}

/// State of one schema-driven polling target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub decoder: String,
    pub unit_id: u8,
    pub poll_interval_ms: u32,
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,

    /// Scaled and rounded values keyed by field name.
    #[serde(default)]
    pub raw_values: BTreeMap<String, FieldValue>,

    /// Formatted values keyed by field name.
    #[serde(default)]
    pub display_values: BTreeMap<String, FieldValue>,
}

impl DeviceSnapshot {
    pub fn new(id: impl Into<String>, decoder: impl Into<String>, unit_id: u8, poll_interval_ms: u32) -> Self {
        Self {
            id: id.into(),
            decoder: decoder.into(),
            unit_id,
            poll_interval_ms,
            enabled: false,
            last_error: None,
            last_update: None,
            raw_values: BTreeMap::new(),
            display_values: BTreeMap::new(),
        }
    }
}

/// State of one ad-hoc single-window poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSnapshot {
    pub id: String,
    pub name: String,
    pub register_type: String,
    pub unit_id: u8,
    pub start_address: u16,
    pub count: u16,
    pub poll_interval_ms: u32,
    pub conversion: String,
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<FieldValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}
