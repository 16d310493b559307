use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde_json::Value;

/// Stable identity column.
pub const IDENTITY_KEY: &str = "SHIP_ID";

/// A single field value after conversion out of raw page data.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Number(f64),
    Text(String),
}

/// One vessel, keyed by canonical upper-case field name.
pub type VesselRecord = BTreeMap<String, Scalar>;

impl Scalar {
    /// Converts a raw JSON value. Nested structures are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Number(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => Scalar::Number(f),
                _ => Scalar::Text(n.to_string()),
            },
            Value::String(s) => Scalar::Text(s.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Text form used for identity lookups. Integral numbers drop the fraction.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Scalar::Null => None,
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                Some(format!("{}", *n as i64))
            }
            Scalar::Number(n) => Some(n.to_string()),
            Scalar::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("NULL"),
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl ToSql for Scalar {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Scalar::Null => ToSqlOutput::Owned(SqlValue::Null),
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                ToSqlOutput::Owned(SqlValue::Integer(*n as i64))
            }
            Scalar::Number(n) => ToSqlOutput::Owned(SqlValue::Real(*n)),
            Scalar::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// Canonical field name: trimmed, upper-cased, runs of non-alphanumerics folded to `_`.
pub fn canonical_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_uppercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Builds a record from a raw JSON object. Non-objects yield `None`.
pub fn from_raw(raw: &Value) -> Option<VesselRecord> {
    let obj = raw.as_object()?;
    let mut record = VesselRecord::new();
    for (key, value) in obj {
        let key = canonical_key(key);
        if key.is_empty() {
            continue;
        }
        record.insert(key, Scalar::from_json(value));
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_keys() {
        assert_eq!(canonical_key("imo"), "IMO");
        assert_eq!(canonical_key(" Vessel Name "), "VESSEL_NAME");
        assert_eq!(canonical_key("eta-updated"), "ETA_UPDATED");
        assert_eq!(canonical_key("SHIP_ID"), "SHIP_ID");
        assert_eq!(canonical_key("Speed (kn)"), "SPEED_KN");
    }

    #[test]
    fn raw_object_conversion() {
        let r = from_raw(&json!({"imo": "123", "speed": 12.5, "flag": null, "ok": true, "tags": [1]}))
            .unwrap();
        assert_eq!(r["IMO"], Scalar::Text("123".into()));
        assert_eq!(r["SPEED"], Scalar::Number(12.5));
        assert!(r["FLAG"].is_null());
        assert_eq!(r["OK"], Scalar::Number(1.0));
        assert_eq!(r["TAGS"], Scalar::Text("[1]".into()));
        assert!(from_raw(&json!([1, 2])).is_none());
    }

    #[test]
    fn identity_text() {
        assert_eq!(Scalar::Number(9321483.0).as_key().as_deref(), Some("9321483"));
        assert_eq!(Scalar::Text(" 42 ".into()).as_key().as_deref(), Some("42"));
        assert_eq!(Scalar::Text("".into()).as_key(), None);
        assert_eq!(Scalar::Null.as_key(), None);
    }
}
