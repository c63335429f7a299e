//! Register decode and poll-scheduling engine.
//!
//! Polls Modbus devices (TCP or RTU/serial) over one shared connection,
//! decodes register words into scaled, labelled values according to
//! per-device decoders, and keeps per-device state for display.
//!
//! # Layout
//!
//! - [`schema`] - field and decoder model
//! - [`catalog`] - decoder registry and built-in decoders
//! - [`expr`] - sandboxed transform and conversion expressions
//! - [`codec`] - raw words to typed values
//! - [`planner`] - fields to read windows
//! - [`transport`] - register transport trait, Modbus and in-memory backends
//! - [`serializer`] - exclusive access to the shared connection
//! - [`scheduler`] - per-device and per-collector polling
//! - [`publisher`] - snapshot publishing over Zenoh
//!
//! # Key Expressions
//!
//! ```text
//! regpoll/device/<id>
//! regpoll/collector/<id>
//! regpoll/@/traffic
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod expr;
pub mod manual;
pub mod planner;
pub mod publisher;
pub mod scheduler;
pub mod schema;
pub mod serializer;
pub mod traffic;
pub mod transport;

pub use catalog::DecoderRegistry;
pub use codec::{CodecError, DecodedValue, decode};
pub use config::{CollectorConfig, ConfigError, DeviceConfig, EngineConfig};
pub use error::EngineError;
pub use expr::{ExprError, Expression};
pub use planner::{ReadWindow, plan};
pub use scheduler::PollScheduler;
pub use schema::{DataType, DeviceDecoder, FieldSchema, RegisterKind, SchemaError, WordOrder};
pub use serializer::{ExclusiveAccess, TransportSerializer};
pub use transport::{
    ConnectParams, MemoryTransport, ModbusTransport, RegisterData, RegisterTransport,
    TransportError, WriteValues,
};
