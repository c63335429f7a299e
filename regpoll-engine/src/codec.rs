//! Value codec: raw words or bits to typed, scaled and formatted values.
//!
//! Decoding is pure. The pipeline after the numeric conversion is fixed:
//! scale, round to `precision`, keep as the raw value, then build the display
//! value from the transform (if any), else the enum label, else the unit.

use thiserror::Error;
use tracing::debug;

use regpoll_common::FieldValue;

use crate::schema::{DataType, FieldSchema, WordOrder};
use crate::transport::RegisterData;

/// Decode failures. Both indicate a planner/decoder mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Field '{field}' needs {width} values at offset {offset}, window holds {len}")]
    OutOfBounds {
        field: String,
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("Field '{field}' of type {data_type} cannot be decoded from bit data")]
    TypeMismatch { field: String, data_type: DataType },
}

/// Result of decoding one field.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedValue {
    /// Scaled and rounded number, or the boolean.
    pub raw: FieldValue,
    /// What the user sees.
    pub display: FieldValue,
}

/// Decode the field starting at `offset` within a read window.
pub fn decode(data: &RegisterData, offset: usize, field: &FieldSchema) -> Result<DecodedValue, CodecError> {
    let width = field.width() as usize;
    if offset + width > data.len() {
        return Err(CodecError::OutOfBounds {
            field: field.name.clone(),
            offset,
            width,
            len: data.len(),
        });
    }

    let words = match data {
        RegisterData::Bits(bits) => {
            if field.data_type != DataType::Bool {
                return Err(CodecError::TypeMismatch {
                    field: field.name.clone(),
                    data_type: field.data_type,
                });
            }
            return Ok(boolean(bits[offset]));
        }
        RegisterData::Words(words) => &words[offset..offset + width],
    };

    let number = match field.data_type {
        DataType::Bool => return Ok(boolean(words[0] != 0)),
        DataType::U16 => words[0] as f64,
        DataType::I16 => words[0] as i16 as f64,
        DataType::U32 => combine(words[0], words[1], field.word_order) as f64,
        DataType::I32 => combine(words[0], words[1], field.word_order) as i32 as f64,
        DataType::F32 => f32::from_bits(combine(words[0], words[1], field.word_order)) as f64,
    };

    Ok(format_number(number, field))
}

/// Booleans bypass scale, precision, map and transform.
fn boolean(value: bool) -> DecodedValue {
    DecodedValue {
        raw: FieldValue::Bool(value),
        display: FieldValue::Bool(value),
    }
}

/// Join two words into an unsigned 32-bit value.
fn combine(first: u16, second: u16, order: WordOrder) -> u32 {
    let (high, low) = match order {
        WordOrder::BigEndian => (first, second),
        WordOrder::LittleEndian => (second, first),
    };
    ((high as u32) << 16) | low as u32
}

/// Round half away from zero to `digits` decimals.
pub fn round_to(value: f64, digits: u8) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

fn format_number(number: f64, field: &FieldSchema) -> DecodedValue {
    let mut value = number;
    if let Some(scale) = field.scale {
        value *= scale;
    }
    if let Some(precision) = field.precision {
        value = round_to(value, precision);
    }

    let label = field
        .enum_map
        .as_ref()
        .filter(|_| value.fract() == 0.0)
        .and_then(|map| map.get(&(value as i64)));

    let plain = match (label, field.unit.as_deref().map(str::trim)) {
        (Some(label), _) => FieldValue::Text(format!("{} ({})", FieldValue::Number(value), label)),
        (None, Some(unit)) if !unit.is_empty() => {
            FieldValue::Text(format!("{} {}", FieldValue::Number(value), unit))
        }
        _ => FieldValue::Number(value),
    };

    let display = match &field.transform {
        Some(transform) => match transform.eval_transform(value) {
            Ok(shown) => shown,
            Err(e) => {
                debug!(field = %field.name, error = %e, "Transform failed, showing plain value");
                plain
            }
        },
        None => plain,
    };

    DecodedValue {
        raw: FieldValue::Number(value),
        display,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RegisterKind;

    fn words(values: &[u16]) -> RegisterData {
        RegisterData::Words(values.to_vec())
    }

    fn holding(data_type: DataType) -> FieldSchema {
        FieldSchema::new(0, RegisterKind::Holding, "Value", data_type)
    }

    #[test]
    fn test_i16_sign() {
        let field = holding(DataType::I16);
        let raw = |w| decode(&words(&[w]), 0, &field).unwrap().raw;
        assert_eq!(raw(0xFFFF), FieldValue::Number(-1.0));
        assert_eq!(raw(0x8000), FieldValue::Number(-32768.0));
        assert_eq!(raw(0x7FFF), FieldValue::Number(32767.0));
    }

    #[test]
    fn test_u32_word_order() {
        let data = words(&[0x0001, 0x0000]);

        let big = decode(&data, 0, &holding(DataType::U32)).unwrap();
        assert_eq!(big.raw, FieldValue::Number(65536.0));

        let little = decode(&data, 0, &holding(DataType::U32).little_endian()).unwrap();
        assert_eq!(little.raw, FieldValue::Number(1.0));
    }

    #[test]
    fn test_i32_and_f32() {
        let data = words(&[0xFFFF, 0xFFFE]);
        assert_eq!(
            decode(&data, 0, &holding(DataType::I32)).unwrap().raw,
            FieldValue::Number(-2.0)
        );

        // 1.5f32 = 0x3FC00000
        let float = words(&[0x0000, 0x3FC0]);
        assert_eq!(
            decode(&float, 0, &holding(DataType::F32).little_endian())
                .unwrap()
                .raw,
            FieldValue::Number(1.5)
        );
    }

    #[test]
    fn test_voltage_end_to_end() {
        let field = FieldSchema::new(0x0000, RegisterKind::Input, "Voltage", DataType::U16)
            .with_scale(0.1)
            .with_precision(1)
            .with_unit("V");

        let decoded = decode(&words(&[2301]), 0, &field).unwrap();
        assert_eq!(decoded.raw, FieldValue::Number(230.1));
        assert_eq!(decoded.display, FieldValue::from("230.1 V"));
    }

    #[test]
    fn test_offset_into_window() {
        let field = holding(DataType::U16).with_unit("W");
        let decoded = decode(&words(&[1, 2, 350]), 2, &field).unwrap();
        assert_eq!(decoded.display, FieldValue::from("350 W"));
    }

    #[test]
    fn test_empty_unit_shows_number() {
        let field = holding(DataType::U16).with_unit("");
        let decoded = decode(&words(&[7]), 0, &field).unwrap();
        assert_eq!(decoded.display, FieldValue::Number(7.0));
    }

    #[test]
    fn test_enum_map_label() {
        let field = holding(DataType::U16)
            .with_unit("ignored")
            .with_map([(0, "Waiting"), (2, "Normal")]);

        let decoded = decode(&words(&[2]), 0, &field).unwrap();
        assert_eq!(decoded.raw, FieldValue::Number(2.0));
        assert_eq!(decoded.display, FieldValue::from("2 (Normal)"));

        // Unmapped values fall back to the unit.
        let unmapped = decode(&words(&[9]), 0, &field).unwrap();
        assert_eq!(unmapped.display, FieldValue::from("9 ignored"));
    }

    #[test]
    fn test_transform_overrides_map() {
        let field = holding(DataType::U16)
            .with_map([(1, "Connected")])
            .with_transform(r#"if(value == 1.0, "online", "offline")"#)
            .unwrap();

        let decoded = decode(&words(&[1]), 0, &field).unwrap();
        assert_eq!(decoded.display, FieldValue::from("online"));
    }

    #[test]
    fn test_transform_failure_falls_back() {
        let field = holding(DataType::U16)
            .with_unit("W")
            .with_transform("value + missing")
            .unwrap();

        let decoded = decode(&words(&[12]), 0, &field).unwrap();
        assert_eq!(decoded.raw, FieldValue::Number(12.0));
        assert_eq!(decoded.display, FieldValue::from("12 W"));
    }

    #[test]
    fn test_transform_sees_scaled_value() {
        let field = FieldSchema::new(0x16, RegisterKind::Input, "Battery Power", DataType::I16)
            .with_scale(1.0)
            .with_precision(0)
            .with_transform(
                r#"if(value > 0, "Charging " + str(value) + "W", "Discharging " + str(abs(value)) + "W")"#,
            )
            .unwrap();

        let decoded = decode(&words(&[0xFEA2]), 0, &field).unwrap();
        assert_eq!(decoded.raw, FieldValue::Number(-350.0));
        assert_eq!(decoded.display, FieldValue::from("Discharging 350W"));
    }

    #[test]
    fn test_booleans_are_unmodified() {
        let field = FieldSchema::new(3, RegisterKind::Coil, "Relay", DataType::Bool)
            .with_unit("x")
            .with_scale(10.0);
        let bits = RegisterData::Bits(vec![false, true]);

        let decoded = decode(&bits, 1, &field).unwrap();
        assert_eq!(decoded.raw, FieldValue::Bool(true));
        assert_eq!(decoded.display, FieldValue::Bool(true));

        let from_word = decode(&words(&[0, 4]), 1, &holding(DataType::Bool)).unwrap();
        assert_eq!(from_word.raw, FieldValue::Bool(true));
    }

    #[test]
    fn test_out_of_bounds_and_mismatch() {
        assert!(matches!(
            decode(&words(&[1]), 0, &holding(DataType::U32)),
            Err(CodecError::OutOfBounds { width: 2, len: 1, .. })
        ));
        assert!(matches!(
            decode(&words(&[1]), 1, &holding(DataType::U16)),
            Err(CodecError::OutOfBounds { .. })
        ));
        assert!(matches!(
            decode(&RegisterData::Bits(vec![true]), 0, &holding(DataType::U16)),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(-2.5, 0), -3.0);
        assert_eq!(round_to(0.125, 2), 0.13);
    }

    #[test]
    fn test_rescale_recovers_raw() {
        let cases = [(0.1, 1), (0.01, 2), (0.001, 3), (10.0, 0), (0.5, 1)];

        for (scale, precision) in cases {
            let field = holding(DataType::U16)
                .with_scale(scale)
                .with_precision(precision);
            let tolerance = 10f64.powi(-(precision as i32));

            for raw in [0u16, 1, 7, 2301, 32768, 65535] {
                let decoded = decode(&words(&[raw]), 0, &field).unwrap();
                let value = decoded.raw.as_f64().unwrap();
                let recovered = value / scale;
                assert!(
                    (recovered - raw as f64).abs() <= tolerance,
                    "scale {} precision {} raw {} recovered {}",
                    scale,
                    precision,
                    raw,
                    recovered
                );
            }
        }
    }
}
