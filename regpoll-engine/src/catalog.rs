//! Decoder registry and the built-in device catalog.
//!
//! The registry is filled once at startup and never mutated afterwards.
//! Devices share decoders through `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::schema::{DataType, DeviceDecoder, FieldSchema, RegisterKind, SchemaError};

/// Immutable lookup table from decoder id to decoder.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    decoders: BTreeMap<String, Arc<DeviceDecoder>>,
}

impl DecoderRegistry {
    /// Validate and register decoders. Ids must be unique.
    pub fn new<I>(decoders: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = DeviceDecoder>,
    {
        let mut map = BTreeMap::new();
        for decoder in decoders {
            decoder.validate()?;
            if map.contains_key(&decoder.id) {
                return Err(SchemaError::DuplicateDecoder(decoder.id));
            }
            map.insert(decoder.id.clone(), Arc::new(decoder));
        }
        Ok(Self { decoders: map })
    }

    /// Registry holding only the built-in catalog.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::new(builtin_decoders()?)
    }

    /// Built-in catalog plus user-supplied decoders.
    pub fn with_extra<I>(extra: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = DeviceDecoder>,
    {
        Self::new(builtin_decoders()?.into_iter().chain(extra))
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceDecoder>> {
        self.decoders.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

fn input(address: u16, name: &str, data_type: DataType) -> FieldSchema {
    FieldSchema::new(address, RegisterKind::Input, name, data_type)
}

fn holding(address: u16, name: &str, data_type: DataType) -> FieldSchema {
    FieldSchema::new(address, RegisterKind::Holding, name, data_type)
}

const HOUR_MINUTE: &str = r#"str(floor(value / 256)) + ":" + pad(value % 256, 2)"#;

/// Decoders shipped with the poller.
pub fn builtin_decoders() -> Result<Vec<DeviceDecoder>, SchemaError> {
    Ok(vec![
        pzem_004t()?,
        solax_monitoring()?,
        solax_control()?,
        atrea_amotion(),
    ])
}

/// PZEM-004T v3.0 energy meter. 32-bit values are low word first.
fn pzem_004t() -> Result<DeviceDecoder, SchemaError> {
    Ok(DeviceDecoder::new("pzem-004t-v3", "PZEM-004T v3.0 Energy Meter", 1)
        .with_field(input(0x0000, "Voltage", DataType::U16).with_unit("V").with_scale(0.1).with_precision(1))
        .with_field(
            input(0x0001, "Current", DataType::U32)
                .with_unit("A")
                .with_scale(0.001)
                .with_precision(3)
                .little_endian(),
        )
        .with_field(
            input(0x0003, "Power", DataType::U32)
                .with_unit("W")
                .with_scale(0.1)
                .with_precision(1)
                .little_endian(),
        )
        .with_field(
            input(0x0005, "Energy", DataType::U32)
                .with_unit("Wh")
                .with_scale(1.0)
                .with_precision(0)
                .little_endian()
                .with_transform(r#"if(value > 1000, fixed(value / 1000, 2) + " kWh", str(value) + " Wh")"#)?,
        )
        .with_field(input(0x0007, "Frequency", DataType::U16).with_unit("Hz").with_scale(0.1).with_precision(1))
        .with_field(input(0x0008, "Power Factor", DataType::U16).with_scale(0.01).with_precision(2))
        .with_field(input(0x0009, "Alarm Status", DataType::U16).with_scale(1.0)))
}

fn solax_monitoring() -> Result<DeviceDecoder, SchemaError> {
    Ok(DeviceDecoder::new("solax-monitoring", "Solax Hybrid - Monitoring", 1)
        .with_field(input(0x0000, "Grid Voltage", DataType::U16).with_unit("V").with_scale(0.1).with_precision(1))
        .with_field(input(0x0001, "Grid Current", DataType::I16).with_unit("A").with_scale(0.1).with_precision(1))
        .with_field(input(0x0002, "Grid Power", DataType::I16).with_unit("W").with_scale(1.0).with_precision(0))
        .with_field(input(0x0007, "Grid Frequency", DataType::U16).with_unit("Hz").with_scale(0.01).with_precision(2))
        .with_field(input(0x0008, "Inverter Temperature", DataType::I16).with_unit("°C").with_scale(1.0).with_precision(0))
        .with_field(input(0x0009, "Run Mode", DataType::U16).with_map([
            (0, "Waiting"),
            (1, "Checking"),
            (2, "Normal"),
            (3, "Fault"),
            (4, "Permanent Fault"),
        ]))
        .with_field(input(0x0003, "PV1 Voltage", DataType::U16).with_unit("V").with_scale(0.1).with_precision(1))
        .with_field(input(0x0004, "PV2 Voltage", DataType::U16).with_unit("V").with_scale(0.1).with_precision(1))
        .with_field(input(0x0005, "PV1 Current", DataType::U16).with_unit("A").with_scale(0.1).with_precision(1))
        .with_field(input(0x0006, "PV2 Current", DataType::U16).with_unit("A").with_scale(0.1).with_precision(1))
        .with_field(input(0x000A, "PV1 Power", DataType::U16).with_unit("W").with_scale(1.0))
        .with_field(input(0x000B, "PV2 Power", DataType::U16).with_unit("W").with_scale(1.0))
        .with_field(input(0x0014, "Battery Voltage", DataType::I16).with_unit("V").with_scale(0.1).with_precision(1))
        .with_field(input(0x0015, "Battery Current", DataType::I16).with_unit("A").with_scale(0.1).with_precision(1))
        .with_field(
            input(0x0016, "Battery Power", DataType::I16)
                .with_unit("W")
                .with_scale(1.0)
                .with_precision(0)
                .with_transform(
                    r#"if(value > 0, "Charging " + str(value) + "W", "Discharging " + str(abs(value)) + "W")"#,
                )?,
        )
        .with_field(
            input(0x0017, "BMS Connect State", DataType::U16).with_map([(0, "Disconnected"), (1, "Connected")]),
        )
        .with_field(input(0x0018, "Battery Temperature", DataType::I16).with_unit("°C").with_scale(1.0))
        .with_field(input(0x001C, "Battery SOC", DataType::U16).with_unit("%").with_scale(1.0).with_precision(0))
        .with_field(
            input(0x0046, "Feed-in Power (Total)", DataType::I32)
                .with_unit("W")
                .with_scale(1.0)
                .with_precision(0)
                .little_endian(),
        )
        .with_field(
            input(0x0094, "Total Energy Yield", DataType::U32)
                .with_unit("kWh")
                .with_scale(0.1)
                .with_precision(1)
                .little_endian(),
        ))
}

fn solax_control() -> Result<DeviceDecoder, SchemaError> {
    Ok(DeviceDecoder::new("solax-control", "Solax Hybrid - Control", 1)
        .with_field(holding(0x001F, "Charger Use Mode", DataType::U16).with_map([
            (0, "Self Use"),
            (1, "Force Time Use"),
            (2, "Back Up Mode"),
            (3, "Feed-in Priority"),
        ]))
        .with_field(
            holding(0x0027, "Battery Max Charge Current", DataType::U16)
                .with_unit("A")
                .with_scale(0.1)
                .with_precision(1),
        )
        .with_field(
            holding(0x0028, "Battery Max Discharge Current", DataType::U16)
                .with_unit("A")
                .with_scale(0.1)
                .with_precision(1),
        )
        .with_field(holding(0x002F, "Min SOC (Grid Tied)", DataType::U16).with_unit("%").with_scale(1.0).with_precision(0))
        .with_field(holding(0x0030, "Min SOC (Backup)", DataType::U16).with_unit("%").with_scale(1.0).with_precision(0))
        .with_field(
            holding(0x003C, "Force Charge Power Limit", DataType::U16)
                .with_unit("W")
                .with_scale(1.0)
                .with_precision(0),
        )
        .with_field(
            holding(0x003D, "Force Discharge Power Limit", DataType::U16)
                .with_unit("W")
                .with_scale(1.0)
                .with_precision(0),
        )
        .with_field(holding(0x0041, "Force Charge/Discharge Period 1 Start", DataType::U16).with_transform(HOUR_MINUTE)?)
        .with_field(holding(0x0042, "Force Charge/Discharge Period 1 End", DataType::U16).with_transform(HOUR_MINUTE)?)
        .with_field(
            holding(0x0043, "Force Charge/Discharge Enable (Period 1)", DataType::U16).with_map([
                (0, "Disabled"),
                (1, "Charge"),
                (2, "Discharge"),
            ]),
        ))
}

/// Atrea aMotion ventilation unit.
fn atrea_amotion() -> DeviceDecoder {
    DeviceDecoder::new("atrea-amotion", "Atrea aMotion", 1)
        .with_field(holding(1001, "Režim", DataType::U16).with_scale(1.0).with_map([
            (0, "OFF"),
            (1, "AUTO"),
            (2, "VENTILATION"),
            (3, "CIRCULATION"),
            (4, "NIGHT_COOLING"),
            (5, "BALANCE"),
            (6, "OVERPRESSURE"),
            (7, "UNDERPRESSURE"),
        ]))
        .with_field(holding(1002, "Požadovaná teplota", DataType::I16).with_unit("°C").with_scale(0.1).with_precision(1))
        .with_field(holding(1003, "Zvolená zóna", DataType::U16).with_scale(1.0))
        .with_field(holding(1004, "Požadovaný výkon", DataType::U16).with_unit("%").with_scale(1.0))
        .with_field(holding(1005, "Požadovaný výkon větrání", DataType::U16).with_unit("m3/h").with_scale(10.0))
        .with_field(holding(1006, "Požadovaný výkon přívodu", DataType::U16).with_unit("m3/h").with_scale(10.0))
        .with_field(holding(1007, "Požadovaná úroveň tlaku", DataType::U16).with_scale(1.0))
        .with_field(holding(1008, "Poloha cirkulační klapky", DataType::U16).with_unit("%").with_scale(1.0))
        .with_field(holding(1009, "Bypass - Řídicí povel", DataType::U16).with_scale(1.0))
        .with_field(holding(1010, "Nastavení sezóny", DataType::U16).with_scale(1.0).with_map([
            (0, "AUTO_TODA"),
            (1, "HEATING"),
            (2, "COOLING"),
            (3, "OFF"),
        ]))
        .with_field(holding(1011, "Požadovaný výkon - přívod", DataType::U16).with_unit("%").with_scale(1.0))
        .with_field(holding(1012, "Požadovaný výkon - odvod", DataType::U16).with_unit("%").with_scale(1.0))
        .with_field(holding(1013, "Požadovaný průtok SUP (přívod)", DataType::U16).with_unit("m3/h").with_scale(10.0))
        .with_field(holding(1014, "Požadovaný průtok ETA (odvod)", DataType::U16).with_unit("m3/h").with_scale(10.0))
        .with_field(holding(1500, "Teplota - vnitřní vzduch", DataType::I16).with_unit("°C").with_scale(0.1).with_precision(1))
        .with_field(holding(1501, "Teplota - venkovní vzduch", DataType::I16).with_unit("°C").with_scale(0.1).with_precision(1))
        .with_field(holding(3189, "Aktivní kalendář", DataType::U16).with_scale(1.0))
        .with_field(holding(3190, "Aktivní scéna", DataType::U16).with_scale(1.0))
}
