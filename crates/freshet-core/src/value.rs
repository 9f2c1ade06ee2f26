//! Runtime values flowing through Freshet topologies

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Insertion-ordered mapping used for tuple data and map values.
pub type Map = IndexMap<String, Value>;

/// A runtime value.
///
/// `Null` and `Missing` are distinct: `Missing` means "field absent" and is
/// produced by path navigation that finds nothing, while `Null` is a field
/// that is present and null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[derive(Default)]
pub enum Value {
    #[default]
    Null,
    Missing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(Map),
}

/// Error produced by failed value conversions.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("unsupported cast: {from} value cannot be converted to {to}")]
pub struct ValueError {
    pub from: &'static str,
    pub to: &'static str,
}

impl ValueError {
    fn new(from: &'static str, to: &'static str) -> Self {
        Self { from, to }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Missing => "missing",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Blob(_) => "blob",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    // === Strict accessors ===

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        match self {
            Value::Array(a) => a.get(idx),
            _ => None,
        }
    }

    // === Weak conversions ===
    //
    // These follow SQL-ish weak typing: the evaluator and the UDF bridge use
    // them for implicit coercion. CAST uses them too but surfaces the error.

    pub fn to_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Null | Value::Missing => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            Value::Float(n) => Ok(*n != 0.0 && !n.is_nan()),
            Value::Str(s) => Ok(!s.is_empty()),
            Value::Blob(b) => Ok(!b.is_empty()),
            Value::Timestamp(ts) => Ok(ts.timestamp_micros() != 0),
            Value::Array(a) => Ok(!a.is_empty()),
            Value::Map(m) => Ok(!m.is_empty()),
        }
    }

    pub fn to_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Bool(true) => Ok(1),
            Value::Bool(false) => Ok(0),
            Value::Int(n) => Ok(*n),
            Value::Float(n) => Ok(*n as i64),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| ValueError::new("string", "int")),
            Value::Timestamp(ts) => Ok(ts.timestamp_micros()),
            other => Err(ValueError::new(other.type_name(), "int")),
        }
    }

    pub fn to_float(&self) -> Result<f64, ValueError> {
        match self {
            Value::Bool(true) => Ok(1.0),
            Value::Bool(false) => Ok(0.0),
            Value::Int(n) => Ok(*n as f64),
            Value::Float(n) => Ok(*n),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ValueError::new("string", "float")),
            Value::Timestamp(ts) => Ok(ts.timestamp_micros() as f64 / 1_000_000.0),
            other => Err(ValueError::new(other.type_name(), "float")),
        }
    }

    /// Weak string conversion. Unlike `Display`, strings are rendered
    /// without quotes so that `str(x)` round-trips scalar text.
    pub fn to_str_lossy(&self) -> Result<String, ValueError> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Null => Ok("null".to_string()),
            Value::Missing => Err(ValueError::new("missing", "string")),
            Value::Blob(b) => String::from_utf8(b.clone())
                .map_err(|_| ValueError::new("blob", "string")),
            other => Ok(format!("{}", other)),
        }
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, ValueError> {
        match self {
            Value::Blob(b) => Ok(b.clone()),
            Value::Str(s) => Ok(s.as_bytes().to_vec()),
            other => Err(ValueError::new(other.type_name(), "blob")),
        }
    }

    pub fn to_timestamp(&self) -> Result<DateTime<Utc>, ValueError> {
        match self {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Int(n) => Utc
                .timestamp_micros(*n)
                .single()
                .ok_or(ValueError::new("int", "timestamp")),
            Value::Float(n) => Utc
                .timestamp_micros((*n * 1_000_000.0) as i64)
                .single()
                .ok_or(ValueError::new("float", "timestamp")),
            Value::Str(s) => s
                .parse::<DateTime<Utc>>()
                .map_err(|_| ValueError::new("string", "timestamp")),
            other => Err(ValueError::new(other.type_name(), "timestamp")),
        }
    }

    /// Canonical structural encoding used for row identity and group keys.
    ///
    /// Floats are encoded bit-for-bit so that emitter set differences treat
    /// two rows as equal only when every float matches exactly.
    pub fn encode_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(b'n'),
            Value::Missing => out.push(b'x'),
            Value::Bool(b) => {
                out.push(b'b');
                out.push(*b as u8);
            }
            Value::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(&n.to_le_bytes());
            }
            Value::Float(n) => {
                out.push(b'f');
                out.extend_from_slice(&n.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                out.push(b's');
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                out.push(b'o');
                out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.extend_from_slice(b);
            }
            Value::Timestamp(ts) => {
                out.push(b't');
                out.extend_from_slice(&ts.timestamp_micros().to_le_bytes());
            }
            Value::Array(a) => {
                out.push(b'a');
                out.extend_from_slice(&(a.len() as u64).to_le_bytes());
                for v in a {
                    v.encode_canonical(out);
                }
            }
            Value::Map(m) => {
                out.push(b'm');
                out.extend_from_slice(&(m.len() as u64).to_le_bytes());
                for (k, v) in m {
                    out.extend_from_slice(&(k.len() as u64).to_le_bytes());
                    out.extend_from_slice(k.as_bytes());
                    v.encode_canonical(out);
                }
            }
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        self.encode_canonical(&mut out);
        out
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Missing => write!(f, "missing"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
            Value::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        match o {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_and_missing_are_distinct() {
        assert_ne!(Value::Null, Value::Missing);
        assert!(Value::Null.is_null());
        assert!(!Value::Null.is_missing());
        assert!(Value::Missing.is_missing());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Missing.type_name(), "missing");
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::Blob(vec![1]).type_name(), "blob");
        assert_eq!(Value::Timestamp(Utc::now()).type_name(), "timestamp");
    }

    #[test]
    fn test_to_bool_weak() {
        assert!(!Value::Null.to_bool().unwrap());
        assert!(!Value::Missing.to_bool().unwrap());
        assert!(Value::Int(-3).to_bool().unwrap());
        assert!(!Value::Int(0).to_bool().unwrap());
        assert!(!Value::Str("".into()).to_bool().unwrap());
        assert!(Value::Str("x".into()).to_bool().unwrap());
        assert!(!Value::Float(f64::NAN).to_bool().unwrap());
    }

    #[test]
    fn test_to_int_weak() {
        assert_eq!(Value::Bool(true).to_int().unwrap(), 1);
        assert_eq!(Value::Float(3.9).to_int().unwrap(), 3);
        assert_eq!(Value::Str(" 42 ".into()).to_int().unwrap(), 42);
        assert!(Value::Array(vec![]).to_int().is_err());
    }

    #[test]
    fn test_to_float_weak() {
        assert_eq!(Value::Int(2).to_float().unwrap(), 2.0);
        assert_eq!(Value::Str("2.5".into()).to_float().unwrap(), 2.5);
        assert!(Value::Map(Map::new()).to_float().is_err());
    }

    #[test]
    fn test_to_str_lossy() {
        assert_eq!(Value::Str("a".into()).to_str_lossy().unwrap(), "a");
        assert_eq!(Value::Int(7).to_str_lossy().unwrap(), "7");
        assert_eq!(Value::Bool(false).to_str_lossy().unwrap(), "false");
        assert!(Value::Missing.to_str_lossy().is_err());
    }

    #[test]
    fn test_to_timestamp_round_trip() {
        let ts = Utc.timestamp_micros(1_500_000).unwrap();
        let v = Value::Timestamp(ts);
        assert_eq!(v.to_int().unwrap(), 1_500_000);
        assert_eq!(Value::Int(1_500_000).to_timestamp().unwrap(), ts);
    }

    #[test]
    fn test_canonical_floats_bit_for_bit() {
        let a = Value::Float(0.0).canonical_bytes();
        let b = Value::Float(-0.0).canonical_bytes();
        assert_ne!(a, b);
        assert_eq!(
            Value::Float(1.5).canonical_bytes(),
            Value::Float(1.5).canonical_bytes()
        );
    }

    #[test]
    fn test_canonical_distinguishes_types() {
        assert_ne!(
            Value::Int(1).canonical_bytes(),
            Value::Float(1.0).canonical_bytes()
        );
        assert_ne!(Value::Null.canonical_bytes(), Value::Missing.canonical_bytes());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Value::Str("a\"b".into())), "\"a\"\"b\"");
        let v = Value::Array(vec![Value::Int(1), Value::Bool(true)]);
        assert_eq!(format!("{}", v), "[1, true]");
    }

    #[test]
    fn test_from_impls() {
        let v: Value = 42i64.into();
        assert_eq!(v, Value::Int(42));
        let v: Value = vec![1i64, 2].into();
        assert_eq!(v, Value::Array(vec![Value::Int(1), Value::Int(2)]));
        let v: Value = Option::<i64>::None.into();
        assert_eq!(v, Value::Null);
    }
}
