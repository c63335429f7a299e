use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A decoded register value or a formatted display value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric value (already scaled and rounded).
    Number(f64),

    /// Coil, discrete input or boolean register.
    Bool(bool),

    /// Formatted text (unit suffix, enum label, transform output).
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Text(_) => None,
        }
    }

    /// Boolean view of the value, if it is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // f64's Display drops a trailing ".0", which is what the display layer wants.
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Number(v as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

/// Current time as Unix epoch milliseconds.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_display_drops_trailing_zero() {
        assert_eq!(FieldValue::Number(230.0).to_string(), "230");
        assert_eq!(FieldValue::Number(230.1).to_string(), "230.1");
        assert_eq!(FieldValue::Number(-1.0).to_string(), "-1");
    }

    #[test]
    fn test_untagged_serialization() {
        assert_eq!(serde_json::to_string(&FieldValue::Number(1.5)).unwrap(), "1.5");
        assert_eq!(serde_json::to_string(&FieldValue::Bool(true)).unwrap(), "true");
        assert_eq!(
            serde_json::to_string(&FieldValue::from("230.1 V")).unwrap(),
            "\"230.1 V\""
        );

        let decoded: FieldValue = serde_json::from_str("true").unwrap();
        assert_eq!(decoded, FieldValue::Bool(true));
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(FieldValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(FieldValue::from("x").as_f64(), None);
        assert_eq!(FieldValue::Number(2.0).as_bool(), None);
    }

    #[test]
    fn test_current_timestamp() {
        let ts = current_timestamp_millis();
        assert!(ts > 1_600_000_000_000);
    }
}
