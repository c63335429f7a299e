//! Parsing and formatting for one-shot reads and writes.

use crate::error::EngineError;
use crate::schema::RegisterKind;
use crate::transport::{RegisterData, WriteValues};

/// Parse comma separated user input into values for `kind`.
///
/// Holding registers take integers in -32768..=65535, negatives are sent as
/// two's complement. Coil items are on when they read `1`, `true` or `on`.
pub fn parse_write_values(kind: RegisterKind, text: &str) -> Result<WriteValues, EngineError> {
    if !kind.is_writable() {
        return Err(read_only());
    }

    let text = text.trim();
    if text.is_empty() {
        return Err(EngineError::InvalidWrite("No value provided".to_string()));
    }

    let items = text.split(',').map(str::trim);
    match kind {
        RegisterKind::Coil => Ok(WriteValues::Bits(
            items
                .map(|item| matches!(item.to_ascii_lowercase().as_str(), "1" | "true" | "on"))
                .collect(),
        )),
        _ => items
            .map(|item| match item.parse::<i32>() {
                Ok(v) if (i16::MIN as i32..=u16::MAX as i32).contains(&v) => Ok(v as u16),
                Ok(v) => Err(EngineError::InvalidWrite(format!(
                    "Value {} out of range (-32768 to 65535)",
                    v
                ))),
                Err(_) => Err(EngineError::InvalidWrite(
                    "Invalid number format (Holding requires integers)".to_string(),
                )),
            })
            .collect::<Result<Vec<u16>, _>>()
            .map(WriteValues::Words),
    }
}

pub(crate) fn read_only() -> EngineError {
    EngineError::InvalidWrite("Cannot write to Input Registers or Discrete Inputs".to_string())
}

/// Render read results the way the manual query shows them.
pub fn format_values(data: &RegisterData) -> String {
    match data {
        RegisterData::Words(words) => {
            let parts: Vec<String> = words.iter().map(u16::to_string).collect();
            format!("[{}]", parts.join(", "))
        }
        RegisterData::Bits(bits) => {
            let parts: Vec<String> = bits.iter().map(bool::to_string).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(result: Result<WriteValues, EngineError>) -> String {
        result.unwrap_err().to_string()
    }

    #[test]
    fn test_read_only_kinds() {
        assert_eq!(
            message(parse_write_values(RegisterKind::Input, "1")),
            "Cannot write to Input Registers or Discrete Inputs"
        );
        assert!(parse_write_values(RegisterKind::Discrete, "1").is_err());
    }

    #[test]
    fn test_blank_input() {
        assert_eq!(message(parse_write_values(RegisterKind::Holding, "  ")), "No value provided");
    }

    #[test]
    fn test_holding_values() {
        assert_eq!(
            parse_write_values(RegisterKind::Holding, "1, 65535,-1").unwrap(),
            WriteValues::Words(vec![1, 65535, 0xFFFF])
        );
        assert_eq!(
            message(parse_write_values(RegisterKind::Holding, "1,x")),
            "Invalid number format (Holding requires integers)"
        );
        assert!(parse_write_values(RegisterKind::Holding, "70000").is_err());
        assert!(parse_write_values(RegisterKind::Holding, "-32769").is_err());
    }

    #[test]
    fn test_coil_values() {
        assert_eq!(
            parse_write_values(RegisterKind::Coil, "1, ON, true, 0, off, yes").unwrap(),
            WriteValues::Bits(vec![true, true, true, false, false, false])
        );
    }

    #[test]
    fn test_format_values() {
        assert_eq!(format_values(&RegisterData::Words(vec![1, 2])), "[1, 2]");
        assert_eq!(format_values(&RegisterData::Bits(vec![true])), "[true]");
    }
}
