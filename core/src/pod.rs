//! Self-describing typed payload values
//!
//! Every method and event payload on the wire is one [Value], encoded as a
//! `(type: u32, size: u32, body)` triple with all integers in little endian:
//!
//! ```text
//! type [u32]
//! size [u32]
//! body [size bytes]
//! ```
//!
//! Containers (arrays, structs, objects) nest further triples inside their
//! body, so a receiver can always skip a value it does not understand.
//! File descriptors are never part of the body; they travel as ancillary
//! data on the connection and are referenced by index via [Value::Fd].

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

const TYPE_NONE: u32 = 0;
const TYPE_BOOL: u32 = 1;
const TYPE_INT: u32 = 2;
const TYPE_LONG: u32 = 3;
const TYPE_FLOAT: u32 = 4;
const TYPE_DOUBLE: u32 = 5;
const TYPE_ID: u32 = 6;
const TYPE_FD: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_BYTES: u32 = 9;
const TYPE_ARRAY: u32 = 10;
const TYPE_STRUCT: u32 = 11;
const TYPE_OBJECT: u32 = 12;

/// Maximum nesting depth accepted when demarshalling
const MAX_DEPTH: u32 = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PodError {
    #[error("truncated value")]
    Truncated,
    #[error("unknown value type {0}")]
    UnknownType(u32),
    #[error("string is not valid utf-8")]
    BadUtf8,
    #[error("value body has wrong size for its type")]
    BadSize,
    #[error("value nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("trailing bytes after value")]
    Trailing,
}

/// An object value: an id naming what the object describes plus keyed
/// properties. Parameters stored on endpoints and sessions are objects.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValue {
    pub object_id: u32,
    pub props: Vec<(u32, Value)>,
}

impl ObjectValue {
    pub fn new(object_id: u32) -> Self {
        Self {
            object_id,
            props: Vec::new(),
        }
    }

    pub fn prop(mut self, key: u32, value: Value) -> Self {
        self.props.push((key, value));
        self
    }

    pub fn get(&self, key: u32) -> Option<&Value> {
        self.props.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// One self-describing value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// An enumeration-like identifier (interface types, param ids, ...)
    Id(u32),
    /// Index of a file descriptor in the frame's ancillary set
    Fd(u32),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Object(ObjectValue),
}

impl Value {
    fn type_tag(&self) -> u32 {
        match self {
            Value::None => TYPE_NONE,
            Value::Bool(_) => TYPE_BOOL,
            Value::Int(_) => TYPE_INT,
            Value::Long(_) => TYPE_LONG,
            Value::Float(_) => TYPE_FLOAT,
            Value::Double(_) => TYPE_DOUBLE,
            Value::Id(_) => TYPE_ID,
            Value::Fd(_) => TYPE_FD,
            Value::String(_) => TYPE_STRING,
            Value::Bytes(_) => TYPE_BYTES,
            Value::Array(_) => TYPE_ARRAY,
            Value::Struct(_) => TYPE_STRUCT,
            Value::Object(_) => TYPE_OBJECT,
        }
    }

    /// Serializes this value, appending to `out`
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.type_tag()).unwrap();
        let size_pos = out.len();
        out.write_u32::<LittleEndian>(0).unwrap();
        let body_pos = out.len();

        match self {
            Value::None => {}
            Value::Bool(v) => out.push(*v as u8),
            Value::Int(v) => out.write_i32::<LittleEndian>(*v).unwrap(),
            Value::Long(v) => out.write_i64::<LittleEndian>(*v).unwrap(),
            Value::Float(v) => out.write_f32::<LittleEndian>(*v).unwrap(),
            Value::Double(v) => out.write_f64::<LittleEndian>(*v).unwrap(),
            Value::Id(v) | Value::Fd(v) => out.write_u32::<LittleEndian>(*v).unwrap(),
            Value::String(v) => out.write_all(v.as_bytes()).unwrap(),
            Value::Bytes(v) => out.write_all(v).unwrap(),
            Value::Array(vs) | Value::Struct(vs) => {
                for v in vs {
                    v.marshal(out);
                }
            }
            Value::Object(obj) => {
                out.write_u32::<LittleEndian>(obj.object_id).unwrap();
                for (key, v) in &obj.props {
                    out.write_u32::<LittleEndian>(*key).unwrap();
                    v.marshal(out);
                }
            }
        }

        let size = (out.len() - body_pos) as u32;
        out[size_pos..size_pos + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Serializes this value into a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal(&mut out);
        out
    }

    /// Deserializes one value from the front of `buf`, returning it together
    /// with the number of bytes consumed
    pub fn demarshal(buf: &[u8]) -> Result<(Value, usize), PodError> {
        Self::demarshal_at(buf, 0)
    }

    /// Deserializes a buffer that must contain exactly one value
    pub fn demarshal_exact(buf: &[u8]) -> Result<Value, PodError> {
        let (value, used) = Self::demarshal(buf)?;
        if used != buf.len() {
            return Err(PodError::Trailing);
        }
        Ok(value)
    }

    fn demarshal_at(buf: &[u8], depth: u32) -> Result<(Value, usize), PodError> {
        if depth > MAX_DEPTH {
            return Err(PodError::TooDeep);
        }
        let mut cursor = buf;
        let ty = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| PodError::Truncated)?;
        let size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| PodError::Truncated)? as usize;
        if cursor.len() < size {
            return Err(PodError::Truncated);
        }
        let body = &cursor[..size];
        let used = 8 + size;

        let value = match ty {
            TYPE_NONE => {
                if size != 0 {
                    return Err(PodError::BadSize);
                }
                Value::None
            }
            TYPE_BOOL => match body {
                [b] => Value::Bool(*b != 0),
                _ => return Err(PodError::BadSize),
            },
            TYPE_INT => Value::Int(Self::fixed(body)?),
            TYPE_LONG => {
                let mut b = body;
                if size != 8 {
                    return Err(PodError::BadSize);
                }
                Value::Long(b.read_i64::<LittleEndian>().unwrap())
            }
            TYPE_FLOAT => {
                let mut b = body;
                if size != 4 {
                    return Err(PodError::BadSize);
                }
                Value::Float(b.read_f32::<LittleEndian>().unwrap())
            }
            TYPE_DOUBLE => {
                let mut b = body;
                if size != 8 {
                    return Err(PodError::BadSize);
                }
                Value::Double(b.read_f64::<LittleEndian>().unwrap())
            }
            TYPE_ID => Value::Id(Self::fixed(body)? as u32),
            TYPE_FD => Value::Fd(Self::fixed(body)? as u32),
            TYPE_STRING => Value::String(
                std::str::from_utf8(body)
                    .map_err(|_| PodError::BadUtf8)?
                    .to_string(),
            ),
            TYPE_BYTES => Value::Bytes(body.to_vec()),
            TYPE_ARRAY | TYPE_STRUCT => {
                let mut items = Vec::new();
                let mut rest = body;
                while !rest.is_empty() {
                    let (item, n) = Self::demarshal_at(rest, depth + 1)?;
                    items.push(item);
                    rest = &rest[n..];
                }
                if ty == TYPE_ARRAY {
                    Value::Array(items)
                } else {
                    Value::Struct(items)
                }
            }
            TYPE_OBJECT => {
                let mut rest = body;
                let object_id = rest
                    .read_u32::<LittleEndian>()
                    .map_err(|_| PodError::Truncated)?;
                let mut props = Vec::new();
                while !rest.is_empty() {
                    let key = rest
                        .read_u32::<LittleEndian>()
                        .map_err(|_| PodError::Truncated)?;
                    let (item, n) = Self::demarshal_at(rest, depth + 1)?;
                    props.push((key, item));
                    rest = &rest[n..];
                }
                Value::Object(ObjectValue { object_id, props })
            }
            other => return Err(PodError::UnknownType(other)),
        };

        Ok((value, used))
    }

    fn fixed(body: &[u8]) -> Result<i32, PodError> {
        if body.len() != 4 {
            return Err(PodError::BadSize);
        }
        let mut b = body;
        Ok(b.read_i32::<LittleEndian>().unwrap())
    }

    /// The object id, when this value is an object
    pub fn object_id(&self) -> Option<u32> {
        match self {
            Value::Object(obj) => Some(obj.object_id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<u32> {
        match self {
            Value::Id(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(vs) => Some(vs),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(vs) => Some(vs),
            _ => None,
        }
    }

    /// Structural filter match.
    ///
    /// `None` matches anything. Scalars match on equality. An object filter
    /// matches an object with the same object id when every filter property
    /// is present with a matching value. Array and struct filters match a
    /// value elementwise when the value has at least as many elements.
    pub fn matches(&self, filter: &Value) -> bool {
        match (self, filter) {
            (_, Value::None) => true,
            (Value::Object(v), Value::Object(f)) => {
                v.object_id == f.object_id
                    && f.props.iter().all(|(key, fv)| {
                        v.get(*key).map(|vv| vv.matches(fv)).unwrap_or(false)
                    })
            }
            (Value::Array(vs), Value::Array(fs)) | (Value::Struct(vs), Value::Struct(fs)) => {
                fs.len() <= vs.len() && vs.iter().zip(fs).all(|(v, f)| v.matches(f))
            }
            (v, f) => v == f,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let bytes = v.to_bytes();
        assert_eq!(Value::demarshal_exact(&bytes).unwrap(), v);
    }

    #[test]
    fn test_scalar_roundtrip() {
        roundtrip(Value::None);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Int(-7));
        roundtrip(Value::Long(1 << 40));
        roundtrip(Value::Float(1.5));
        roundtrip(Value::Double(-0.25));
        roundtrip(Value::Id(42));
        roundtrip(Value::Fd(3));
        roundtrip(Value::String("hw:0,0".into()));
        roundtrip(Value::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn test_container_roundtrip() {
        roundtrip(Value::Struct(vec![
            Value::Int(1),
            Value::Array(vec![Value::Id(1), Value::Id(2)]),
            Value::Object(
                ObjectValue::new(9)
                    .prop(1, Value::Int(48000))
                    .prop(2, Value::String("x".into())),
            ),
        ]));
    }

    #[test]
    fn test_truncated() {
        let bytes = Value::Int(3).to_bytes();
        assert_eq!(
            Value::demarshal(&bytes[..bytes.len() - 1]),
            Err(PodError::Truncated)
        );
    }

    #[test]
    fn test_trailing() {
        let mut bytes = Value::Int(3).to_bytes();
        bytes.push(0);
        assert_eq!(Value::demarshal_exact(&bytes), Err(PodError::Trailing));
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = Value::Int(3).to_bytes();
        bytes[0] = 200;
        assert_eq!(Value::demarshal_exact(&bytes), Err(PodError::UnknownType(200)));
    }

    #[test]
    fn test_filter() {
        let param = Value::Object(
            ObjectValue::new(4)
                .prop(1, Value::Int(48000))
                .prop(2, Value::Id(7)),
        );
        assert!(param.matches(&Value::None));
        assert!(param.matches(&Value::Object(ObjectValue::new(4))));
        assert!(param.matches(&Value::Object(ObjectValue::new(4).prop(1, Value::Int(48000)))));
        assert!(!param.matches(&Value::Object(ObjectValue::new(4).prop(1, Value::Int(44100)))));
        assert!(!param.matches(&Value::Object(ObjectValue::new(5))));
        assert!(!param.matches(&Value::Object(ObjectValue::new(4).prop(3, Value::None))));
    }
}
