//! Declarative register schema: field descriptions and device decoders.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::expr::Expression;

/// Errors raised while building or registering decoders.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Decoder '{decoder}': duplicate field name '{field}'")]
    DuplicateField { decoder: String, field: String },

    #[error("Decoder '{decoder}': field '{field}' at {address} overflows the 16-bit address space")]
    AddressOverflow {
        decoder: String,
        field: String,
        address: u16,
    },

    #[error("Decoder '{decoder}': field '{field}' reads {kind} but is typed {data_type}")]
    BitKindNotBoolean {
        decoder: String,
        field: String,
        kind: RegisterKind,
        data_type: DataType,
    },

    #[error("Duplicate decoder id '{0}'")]
    DuplicateDecoder(String),

    #[error("Decoder id cannot be empty")]
    EmptyDecoderId,

    #[error(transparent)]
    Expression(#[from] crate::expr::ExprError),
}

/// Modbus register kinds, each with its own address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (read/write, 16-bit)
    Holding,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
}

impl RegisterKind {
    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
        }
    }

    /// Coils and discrete inputs carry bits instead of words.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }

    /// Only holding registers and coils accept writes.
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Holding | RegisterKind::Coil)
    }

    /// Largest number of addresses a single read request may cover.
    ///
    /// Derived from the 253-byte PDU limit, rounded down.
    pub fn window_limit(&self) -> u16 {
        if self.is_bit() { 1900 } else { 100 }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegisterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "holding" => Ok(RegisterKind::Holding),
            "input" => Ok(RegisterKind::Input),
            "coil" => Ok(RegisterKind::Coil),
            "discrete" => Ok(RegisterKind::Discrete),
            other => Err(format!(
                "unknown register type '{}' (use holding, input, coil or discrete)",
                other
            )),
        }
    }
}

/// Numeric interpretation of one field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    #[serde(alias = "uint16")]
    U16,
    /// Signed 16-bit integer
    #[serde(alias = "int16")]
    I16,
    /// Unsigned 32-bit integer (2 registers)
    #[serde(alias = "uint32")]
    U32,
    /// Signed 32-bit integer (2 registers)
    #[serde(alias = "int32")]
    I32,
    /// IEEE 754 float (2 registers)
    #[serde(alias = "float32")]
    F32,
    /// Single bit, or a register read as zero/non-zero
    #[serde(alias = "boolean")]
    Bool,
}

impl DataType {
    /// Number of 16-bit words (or bits) the type occupies.
    pub fn word_width(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 | DataType::Bool => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::U32 => "u32",
            DataType::I32 => "i32",
            DataType::F32 => "f32",
            DataType::Bool => "bool",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Word order of two-register values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WordOrder {
    /// High word first.
    #[default]
    BigEndian,
    /// Low word first.
    LittleEndian,
}

/// Immutable description of one register field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Starting address (0-based)
    pub address: u16,

    /// Register kind the field is read from
    #[serde(rename = "type")]
    pub kind: RegisterKind,

    /// Name, unique within its decoder
    pub name: String,

    #[serde(default)]
    pub data_type: DataType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Multiplier applied to the raw number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,

    /// Decimal places kept after scaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,

    #[serde(default)]
    pub word_order: WordOrder,

    /// Display transform evaluated on the scaled value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Expression>,

    /// Labels for enumerated values
    #[serde(
        default,
        rename = "map",
        deserialize_with = "deserialize_enum_map",
        skip_serializing_if = "Option::is_none"
    )]
    pub enum_map: Option<BTreeMap<i64, String>>,
}

/// Enum map keys arrive as strings in JSON5 objects.
fn deserialize_enum_map<'de, D>(deserializer: D) -> Result<Option<BTreeMap<i64, String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let raw: Option<BTreeMap<String, String>> = Option::deserialize(deserializer)?;
    raw.map(|labels| {
        labels
            .into_iter()
            .map(|(key, label)| {
                key.trim()
                    .parse::<i64>()
                    .map(|value| (value, label))
                    .map_err(|_| D::Error::custom(format!("enum map key '{}' is not an integer", key)))
            })
            .collect()
    })
    .transpose()
}

impl FieldSchema {
    /// Create a field with no scaling or display rules.
    pub fn new(address: u16, kind: RegisterKind, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            address,
            kind,
            name: name.into(),
            data_type,
            unit: None,
            scale: None,
            precision: None,
            word_order: WordOrder::BigEndian,
            transform: None,
            enum_map: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn little_endian(mut self) -> Self {
        self.word_order = WordOrder::LittleEndian;
        self
    }

    /// Attach a display transform, compiling it first.
    pub fn with_transform(mut self, source: &str) -> Result<Self, SchemaError> {
        self.transform = Some(Expression::compile(source)?);
        Ok(self)
    }

    pub fn with_map<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        self.enum_map = Some(labels.into_iter().map(|(k, v)| (k, v.into())).collect());
        self
    }

    /// Number of addresses the field occupies.
    pub fn width(&self) -> u16 {
        self.data_type.word_width()
    }

    /// Last address covered by the field, computed without overflow.
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.width() as u32 - 1
    }

    fn validate(&self, decoder: &str) -> Result<(), SchemaError> {
        if self.end_address() > u16::MAX as u32 {
            return Err(SchemaError::AddressOverflow {
                decoder: decoder.to_string(),
                field: self.name.clone(),
                address: self.address,
            });
        }

        if self.kind.is_bit() && self.data_type != DataType::Bool {
            return Err(SchemaError::BitKindNotBoolean {
                decoder: decoder.to_string(),
                field: self.name.clone(),
                kind: self.kind,
                data_type: self.data_type,
            });
        }

        Ok(())
    }
}

/// Named, ordered collection of fields describing one device model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDecoder {
    pub id: String,

    #[serde(rename = "name")]
    pub display_name: String,

    #[serde(default = "default_unit_id")]
    pub default_unit_id: u8,

    pub fields: Vec<FieldSchema>,
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceDecoder {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, default_unit_id: u8) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            default_unit_id,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check field names and address ranges.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.id.is_empty() {
            return Err(SchemaError::EmptyDecoderId);
        }

        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    decoder: self.id.clone(),
                    field: field.name.clone(),
                });
            }
            field.validate(&self.id)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_width() {
        assert_eq!(DataType::U16.word_width(), 1);
        assert_eq!(DataType::Bool.word_width(), 1);
        assert_eq!(DataType::I32.word_width(), 2);
        assert_eq!(DataType::F32.word_width(), 2);
    }

    #[test]
    fn test_window_limits() {
        assert_eq!(RegisterKind::Holding.window_limit(), 100);
        assert_eq!(RegisterKind::Input.window_limit(), 100);
        assert_eq!(RegisterKind::Coil.window_limit(), 1900);
        assert_eq!(RegisterKind::Discrete.window_limit(), 1900);
    }

    #[test]
    fn test_register_kind_parse() {
        assert_eq!("Holding".parse::<RegisterKind>(), Ok(RegisterKind::Holding));
        assert_eq!("discrete".parse::<RegisterKind>(), Ok(RegisterKind::Discrete));
        assert!("analog".parse::<RegisterKind>().is_err());
        assert!(RegisterKind::Coil.is_writable());
        assert!(!RegisterKind::Input.is_writable());
    }

    #[test]
    fn test_address_overflow_rejected() {
        let decoder = DeviceDecoder::new("edge", "Edge", 1).with_field(FieldSchema::new(
            0xFFFF,
            RegisterKind::Holding,
            "Counter",
            DataType::U32,
        ));

        assert!(matches!(
            decoder.validate(),
            Err(SchemaError::AddressOverflow { address: 0xFFFF, .. })
        ));

        let ok = DeviceDecoder::new("edge", "Edge", 1).with_field(FieldSchema::new(
            0xFFFE,
            RegisterKind::Holding,
            "Counter",
            DataType::U32,
        ));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let decoder = DeviceDecoder::new("dup", "Dup", 1)
            .with_field(FieldSchema::new(0, RegisterKind::Input, "Voltage", DataType::U16))
            .with_field(FieldSchema::new(1, RegisterKind::Input, "Voltage", DataType::U16));

        assert!(matches!(
            decoder.validate(),
            Err(SchemaError::DuplicateField { .. })
        ));
    }

    #[test]
    fn test_bit_kind_requires_bool() {
        let decoder = DeviceDecoder::new("bits", "Bits", 1)
            .with_field(FieldSchema::new(0, RegisterKind::Coil, "Relay", DataType::U16));

        assert!(matches!(
            decoder.validate(),
            Err(SchemaError::BitKindNotBoolean { .. })
        ));
    }

    #[test]
    fn test_parse_field_from_json5() {
        let field: FieldSchema = json5::from_str(
            r#"{
                address: 1,
                type: "input",
                name: "Current",
                data_type: "uint32",
                unit: "A",
                scale: 0.001,
                precision: 3,
                word_order: "little-endian",
                map: { "0": "Idle" },
            }"#,
        )
        .unwrap();

        assert_eq!(field.kind, RegisterKind::Input);
        assert_eq!(field.data_type, DataType::U32);
        assert_eq!(field.word_order, WordOrder::LittleEndian);
        assert_eq!(field.end_address(), 2);
        assert_eq!(
            field.enum_map.as_ref().and_then(|m| m.get(&0)).map(String::as_str),
            Some("Idle")
        );
    }
}
