use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Wire format for published snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, good for debugging).
    #[default]
    Json,

    /// CBOR format (compact binary).
    Cbor,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Json => write!(f, "json"),
            Format::Cbor => write!(f, "cbor"),
        }
    }
}

impl Format {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Cbor => "application/cbor",
        }
    }
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(|e| Error::encode(format, e)),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf).map_err(|e| Error::encode(format, e))?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(|e| Error::decode(format, e)),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::decode(format, e)),
    }
}

/// Guess the format of a payload: JSON objects and arrays start with `{` or `[`.
pub fn detect_format(data: &[u8]) -> Format {
    match data.first() {
        Some(b'{') | Some(b'[') => Format::Json,
        _ => Format::Cbor,
    }
}

/// Decode bytes, auto-detecting the format.
pub fn decode_auto<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    decode(data, detect_format(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;
    use std::collections::BTreeMap;

    fn sample() -> BTreeMap<String, FieldValue> {
        let mut values = BTreeMap::new();
        values.insert("Voltage".to_string(), FieldValue::Number(230.1));
        values.insert("Relay".to_string(), FieldValue::Bool(false));
        values
    }

    #[test]
    fn test_cbor_is_smaller_and_detected() {
        let json = encode(&sample(), Format::Json).unwrap();
        let cbor = encode(&sample(), Format::Cbor).unwrap();

        assert!(cbor.len() < json.len());
        assert_eq!(detect_format(&json), Format::Json);
        assert_eq!(detect_format(&cbor), Format::Cbor);

        let decoded: BTreeMap<String, FieldValue> = decode_auto(&cbor).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<BTreeMap<String, FieldValue>> = decode(b"{not json", Format::Json);
        assert!(matches!(
            result,
            Err(Error::Decode {
                format: Format::Json,
                ..
            })
        ));

        let result: Result<BTreeMap<String, FieldValue>> = decode(&[0xff, 0x00], Format::Cbor);
        assert!(matches!(
            result,
            Err(Error::Decode {
                format: Format::Cbor,
                ..
            })
        ));
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(Format::Json.mime_type(), "application/json");
        assert_eq!(Format::Cbor.mime_type(), "application/cbor");
    }
}
