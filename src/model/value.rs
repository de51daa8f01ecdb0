//! Loosely-typed values carried by assertions.
//!
//! Expected and actual values are one of four shapes. Coercions follow the
//! loose rules the assertion operators are defined in terms of: `==` style
//! equality across types, text coercion for containment, numeric coercion for
//! ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A string, number, boolean, or null.
///
/// Serialized untagged, so `200`, `"ok"`, `true` and `null` map directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssertionValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AssertionValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AssertionValue::Null)
    }

    /// Convert a JSON value. Arrays and objects collapse to their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AssertionValue::Null,
            serde_json::Value::Bool(b) => AssertionValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(AssertionValue::Number)
                .unwrap_or_else(|| AssertionValue::Text(n.to_string())),
            serde_json::Value::String(s) => AssertionValue::Text(s.clone()),
            other => AssertionValue::Text(other.to_string()),
        }
    }

    /// Numeric coercion. Null is 0, booleans are 0/1, blank text is 0,
    /// unparsable text is NaN.
    pub fn to_number(&self) -> f64 {
        match self {
            AssertionValue::Null => 0.0,
            AssertionValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            AssertionValue::Number(n) => *n,
            AssertionValue::Text(s) => parse_numeric_text(s),
        }
    }

    /// Text coercion. Integral numbers render without a fractional part.
    pub fn to_text(&self) -> String {
        match self {
            AssertionValue::Null => "null".to_string(),
            AssertionValue::Bool(b) => b.to_string(),
            AssertionValue::Number(n) => format_number(*n),
            AssertionValue::Text(s) => s.clone(),
        }
    }

    /// Loose equality across types.
    ///
    /// Same-typed values compare directly. Null only equals null. A boolean
    /// is compared as 0/1 against the other side; number vs text compares
    /// numerically.
    pub fn loose_eq(&self, other: &AssertionValue) -> bool {
        use AssertionValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Null, _) | (_, Null) => false,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Bool(_), _) => Number(self.to_number()).loose_eq(other),
            (_, Bool(_)) => self.loose_eq(&Number(other.to_number())),
            (Number(a), Text(_)) => *a == other.to_number(),
            (Text(_), Number(b)) => self.to_number() == *b,
        }
    }
}

impl fmt::Display for AssertionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<&str> for AssertionValue {
    fn from(s: &str) -> Self {
        AssertionValue::Text(s.to_string())
    }
}

impl From<String> for AssertionValue {
    fn from(s: String) -> Self {
        AssertionValue::Text(s)
    }
}

impl From<f64> for AssertionValue {
    fn from(n: f64) -> Self {
        AssertionValue::Number(n)
    }
}

impl From<u16> for AssertionValue {
    fn from(n: u16) -> Self {
        AssertionValue::Number(f64::from(n))
    }
}

impl From<u64> for AssertionValue {
    fn from(n: u64) -> Self {
        AssertionValue::Number(n as f64)
    }
}

impl From<bool> for AssertionValue {
    fn from(b: bool) -> Self {
        AssertionValue::Bool(b)
    }
}

fn parse_numeric_text(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    // Rust also accepts "inf" / "nan" spellings; those are not numbers here.
    if trimmed
        .chars()
        .any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
    {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_serde_shapes() {
        let values: Vec<AssertionValue> =
            serde_json::from_str(r#"[null, true, 200, "ok"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                AssertionValue::Null,
                AssertionValue::Bool(true),
                AssertionValue::Number(200.0),
                AssertionValue::Text("ok".into()),
            ]
        );
    }

    #[test]
    fn test_loose_equality_across_types() {
        assert!(AssertionValue::Number(200.0).loose_eq(&"200".into()));
        assert!(AssertionValue::from("200").loose_eq(&AssertionValue::Number(200.0)));
        assert!(AssertionValue::Bool(true).loose_eq(&AssertionValue::Number(1.0)));
        assert!(AssertionValue::Bool(false).loose_eq(&"0".into()));
        assert!(AssertionValue::Null.loose_eq(&AssertionValue::Null));
        assert!(!AssertionValue::Null.loose_eq(&AssertionValue::Number(0.0)));
        assert!(!AssertionValue::from("abc").loose_eq(&AssertionValue::Number(0.0)));
        assert!(!AssertionValue::Number(f64::NAN).loose_eq(&AssertionValue::Number(f64::NAN)));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(AssertionValue::from(" 42 ").to_number(), 42.0);
        assert_eq!(AssertionValue::from("").to_number(), 0.0);
        assert_eq!(AssertionValue::Null.to_number(), 0.0);
        assert!(AssertionValue::from("inf").to_number().is_nan());
        assert_eq!(AssertionValue::from("1e3").to_number(), 1000.0);
        assert_eq!(AssertionValue::from("-Infinity").to_number(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_text_coercion() {
        assert_eq!(AssertionValue::Number(200.0).to_text(), "200");
        assert_eq!(AssertionValue::Number(0.25).to_text(), "0.25");
        assert_eq!(AssertionValue::Null.to_text(), "null");
        assert_eq!(AssertionValue::Bool(false).to_text(), "false");
        assert_eq!(AssertionValue::Number(f64::INFINITY).to_text(), "Infinity");
    }

    #[test]
    fn test_from_json_collapses_composites() {
        let v = AssertionValue::from_json(&serde_json::json!({"a": 1}));
        assert_eq!(v, AssertionValue::Text(r#"{"a":1}"#.to_string()));
    }
}
