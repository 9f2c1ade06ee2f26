//! JSON-style path navigation over [`Value`]s
//!
//! Paths address nested data inside tuple columns: `a.b[0]['key']..rec[1:3]`.
//! Evaluation is a total function: a step that finds nothing yields
//! [`Value::Missing`], a `null` encountered along the way yields
//! [`Value::Null`].

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    /// `.field` or leading `field`
    Field(String),
    /// `[0]`, negative indices count from the end
    Index(i64),
    /// `[a:b]`, either bound optional
    Slice(Option<i64>, Option<i64>),
    /// `..field` - collects every descendant value under that key
    Recursive(String),
}

/// A parsed path over nested values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    segments: Vec<Segment>,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid path at byte {at}: {message}")]
pub struct PathError {
    pub at: usize,
    pub message: String,
}

impl Path {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parses a path expression. The leading component must be a field name.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let mut p = Parser {
            src: text.as_bytes(),
            pos: 0,
        };
        let segments = p.parse_segments()?;
        if segments.is_empty() {
            return Err(PathError {
                at: 0,
                message: "empty path".to_string(),
            });
        }
        Ok(Self { segments })
    }

    /// Walks the path over a value. Total: never fails.
    pub fn evaluate(&self, root: &Value) -> Value {
        let mut current = root.clone();
        for seg in &self.segments {
            if current.is_null() {
                return Value::Null;
            }
            if current.is_missing() {
                return Value::Missing;
            }
            current = step(&current, seg);
        }
        current
    }

    /// Walks the path with a map as the root, the shape of a tuple's data.
    /// The first segment must be a field lookup.
    pub fn evaluate_map(&self, root: &crate::value::Map) -> Value {
        let Some((first, rest)) = self.segments.split_first() else {
            return Value::Missing;
        };
        let mut current = match first {
            Segment::Field(name) => match root.get(name) {
                Some(v) => v.clone(),
                None => return Value::Missing,
            },
            _ => return Value::Missing,
        };
        for seg in rest {
            if current.is_null() {
                return Value::Null;
            }
            if current.is_missing() {
                return Value::Missing;
            }
            current = step(&current, seg);
        }
        current
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Field(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", name)?;
                }
                Segment::Index(idx) => write!(f, "[{}]", idx)?,
                Segment::Slice(a, b) => {
                    write!(f, "[")?;
                    if let Some(a) = a {
                        write!(f, "{}", a)?;
                    }
                    write!(f, ":")?;
                    if let Some(b) = b {
                        write!(f, "{}", b)?;
                    }
                    write!(f, "]")?;
                }
                Segment::Recursive(name) => write!(f, "..{}", name)?,
            }
        }
        Ok(())
    }
}

fn step(value: &Value, seg: &Segment) -> Value {
    match seg {
        Segment::Field(name) => match value.get(name) {
            Some(v) => v.clone(),
            None => Value::Missing,
        },
        Segment::Index(idx) => match value {
            Value::Array(a) => {
                let len = a.len() as i64;
                let i = if *idx < 0 { len + *idx } else { *idx };
                if i >= 0 && i < len {
                    a[i as usize].clone()
                } else {
                    Value::Missing
                }
            }
            _ => Value::Missing,
        },
        Segment::Slice(start, end) => match value {
            Value::Array(a) => {
                let len = a.len() as i64;
                let clamp = |i: i64| -> usize {
                    let i = if i < 0 { len + i } else { i };
                    i.clamp(0, len) as usize
                };
                let s = clamp(start.unwrap_or(0));
                let e = clamp(end.unwrap_or(len));
                if s <= e {
                    Value::Array(a[s..e].to_vec())
                } else {
                    Value::Array(Vec::new())
                }
            }
            _ => Value::Missing,
        },
        Segment::Recursive(name) => {
            let mut found = Vec::new();
            collect_recursive(value, name, &mut found);
            if found.is_empty() {
                Value::Missing
            } else {
                Value::Array(found)
            }
        }
    }
}

fn collect_recursive(value: &Value, name: &str, out: &mut Vec<Value>) {
    match value {
        Value::Map(m) => {
            for (k, v) in m {
                if k == name {
                    out.push(v.clone());
                }
                collect_recursive(v, name, out);
            }
        }
        Value::Array(a) => {
            for v in a {
                collect_recursive(v, name, out);
            }
        }
        _ => {}
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_segments(&mut self) -> Result<Vec<Segment>, PathError> {
        let mut segments = Vec::new();
        let mut first = true;
        while self.pos < self.src.len() {
            match self.src[self.pos] {
                b'.' if self.peek(1) == Some(b'.') => {
                    self.pos += 2;
                    let name = self.parse_key()?;
                    segments.push(Segment::Recursive(name));
                }
                b'.' => {
                    self.pos += 1;
                    let name = self.parse_field_name()?;
                    segments.push(Segment::Field(name));
                }
                b'[' => {
                    self.pos += 1;
                    segments.push(self.parse_bracket()?);
                }
                _ if first => {
                    let name = self.parse_field_name()?;
                    segments.push(Segment::Field(name));
                }
                c => {
                    return Err(self.err(format!("unexpected character '{}'", c as char)));
                }
            }
            first = false;
        }
        Ok(segments)
    }

    // A key after `..` may be a bare name or a quoted string.
    fn parse_key(&mut self) -> Result<String, PathError> {
        match self.src.get(self.pos) {
            Some(b'\'') | Some(b'"') => self.parse_quoted(),
            _ => self.parse_field_name(),
        }
    }

    fn parse_field_name(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err("expected field name".to_string()));
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn parse_quoted(&mut self) -> Result<String, PathError> {
        let quote = self.src[self.pos];
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos] != quote {
            self.pos += 1;
        }
        if self.pos >= self.src.len() {
            return Err(self.err("unterminated quoted key".to_string()));
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(name)
    }

    fn parse_bracket(&mut self) -> Result<Segment, PathError> {
        match self.src.get(self.pos) {
            Some(b'\'') | Some(b'"') => {
                let name = self.parse_quoted()?;
                self.expect(b']')?;
                Ok(Segment::Field(name))
            }
            Some(b':') => {
                self.pos += 1;
                let end = self.parse_opt_int()?;
                self.expect(b']')?;
                Ok(Segment::Slice(None, end))
            }
            _ => {
                let first = self.parse_int()?;
                if self.src.get(self.pos) == Some(&b':') {
                    self.pos += 1;
                    let end = self.parse_opt_int()?;
                    self.expect(b']')?;
                    Ok(Segment::Slice(Some(first), end))
                } else {
                    self.expect(b']')?;
                    Ok(Segment::Index(first))
                }
            }
        }
    }

    fn parse_opt_int(&mut self) -> Result<Option<i64>, PathError> {
        if self.src.get(self.pos) == Some(&b']') {
            Ok(None)
        } else {
            Ok(Some(self.parse_int()?))
        }
    }

    fn parse_int(&mut self) -> Result<i64, PathError> {
        let start = self.pos;
        if self.src.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        text.parse::<i64>()
            .map_err(|_| self.err("expected integer".to_string()))
    }

    fn expect(&mut self, c: u8) -> Result<(), PathError> {
        if self.src.get(self.pos) == Some(&c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", c as char)))
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn err(&self, message: String) -> PathError {
        PathError {
            at: self.pos,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Map;

    fn sample() -> Value {
        let mut inner = Map::new();
        inner.insert("b".to_string(), Value::Int(7));
        let mut m = Map::new();
        m.insert("a".to_string(), Value::Map(inner));
        m.insert(
            "list".to_string(),
            Value::Array(vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
        );
        m.insert("nil".to_string(), Value::Null);
        Value::Map(m)
    }

    #[test]
    fn test_parse_display_round_trip() {
        for text in ["a.b", "a[0]", "a['key']", "a[1:3]", "a..rec", "a[-1]", "a[:2]"] {
            let p = Path::parse(text).unwrap();
            let again = Path::parse(&p.to_string()).unwrap();
            assert_eq!(p, again, "{}", text);
        }
    }

    #[test]
    fn test_field_lookup() {
        let p = Path::parse("a.b").unwrap();
        assert_eq!(p.evaluate(&sample()), Value::Int(7));
    }

    #[test]
    fn test_bracket_key_equals_dot() {
        let dot = Path::parse("a.b").unwrap();
        let bracket = Path::parse("a['b']").unwrap();
        assert_eq!(dot.evaluate(&sample()), bracket.evaluate(&sample()));
    }

    #[test]
    fn test_missing_path_is_missing() {
        let p = Path::parse("a.zzz").unwrap();
        assert_eq!(p.evaluate(&sample()), Value::Missing);
        let p = Path::parse("list[9]").unwrap();
        assert_eq!(p.evaluate(&sample()), Value::Missing);
    }

    #[test]
    fn test_null_propagates_as_null() {
        let p = Path::parse("nil.anything").unwrap();
        assert_eq!(p.evaluate(&sample()), Value::Null);
    }

    #[test]
    fn test_negative_index() {
        let p = Path::parse("list[-1]").unwrap();
        assert_eq!(p.evaluate(&sample()), Value::Int(30));
    }

    #[test]
    fn test_slice() {
        let p = Path::parse("list[1:3]").unwrap();
        assert_eq!(
            p.evaluate(&sample()),
            Value::Array(vec![Value::Int(20), Value::Int(30)])
        );
        let p = Path::parse("list[:2]").unwrap();
        assert_eq!(
            p.evaluate(&sample()),
            Value::Array(vec![Value::Int(10), Value::Int(20)])
        );
    }

    #[test]
    fn test_recursive_descent() {
        let mut deep = Map::new();
        deep.insert("b".to_string(), Value::Int(1));
        let mut mid = Map::new();
        mid.insert("b".to_string(), Value::Int(2));
        mid.insert("deep".to_string(), Value::Map(deep));
        let mut root = Map::new();
        root.insert("a".to_string(), Value::Map(mid));
        let v = Value::Map(root);

        let p = Path::parse("a..b").unwrap();
        assert_eq!(
            p.evaluate(&v),
            Value::Array(vec![Value::Int(2), Value::Int(1)])
        );

        let p = Path::parse("a..zzz").unwrap();
        assert_eq!(p.evaluate(&v), Value::Missing);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Path::parse("").is_err());
        assert!(Path::parse("a[").is_err());
        assert!(Path::parse("a['x").is_err());
        assert!(Path::parse("a.").is_err());
    }
}
