//! Values exchanged between scripts and host functions

use crate::error::{Result, ScriptError};
use crate::wrappers::ObjectRef;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Script table with string keys
pub type Table = BTreeMap<String, Value>;

/// A value crossing the script/host boundary
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Floating point number
    Number(f64),
    /// Byte string; not required to be UTF-8
    String(Bytes),
    /// Keyed table
    Table(Table),
    /// Sequence
    Array(Vec<Value>),
    /// Reference to a host object (wrapper)
    Object(ObjectRef),
}

static NIL: Value = Value::Nil;

impl Value {
    /// Build a table from key/value pairs
    pub fn table<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Table(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Name of the value's type, as reported in argument errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Table(_) => "table",
            Self::Array(_) => "array",
            Self::Object(_) => "userdata",
        }
    }

    /// Whether the value is nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value; numbers with no fractional part convert
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    /// Numeric value
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Raw bytes of a string
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::String(b) => Some(b),
            _ => None,
        }
    }

    /// String contents when they are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Table contents
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Array contents
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Host object reference
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(o) => Some(*o),
            _ => None,
        }
    }

    /// Convert to JSON; host objects have no JSON form and become `null`
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Nil | Self::Object(_) => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Integer(i) => Json::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
            Self::Table(t) => Json::Object(t.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Self::Array(a) => Json::Array(a.iter().map(Value::to_json).collect()),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Nil,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Number(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Self::String(Bytes::copy_from_slice(s.as_bytes())),
            Json::Array(a) => Self::Array(a.iter().map(Value::from).collect()),
            Json::Object(o) => Self::Table(o.iter().map(|(k, v)| (k.clone(), v.into())).collect()),
        }
    }
}

impl From<&octopus_core::Struct> for Value {
    fn from(map: &octopus_core::Struct) -> Self {
        Self::Table(map.iter().map(|(k, v)| (k.clone(), v.into())).collect())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(Bytes::from(s))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::String(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::String(Bytes::from(b))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Self::Object(o)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Self::Table(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Self::Array(a)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map(Into::into).unwrap_or(Self::Nil)
    }
}

/// Positional arguments of a host call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Wrap call arguments
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Number of arguments passed
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no arguments were passed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Argument at `index`; missing arguments read as nil
    pub fn get(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&NIL)
    }

    fn bad_argument(&self, index: usize, expected: &str) -> ScriptError {
        ScriptError::type_error(format!(
            "bad argument #{} ({} expected, got {})",
            index + 1,
            expected,
            self.get(index).type_name()
        ))
    }

    /// Required byte string
    pub fn check_bytes(&self, index: usize) -> Result<&Bytes> {
        self.get(index)
            .as_bytes()
            .ok_or_else(|| self.bad_argument(index, "string"))
    }

    /// Required UTF-8 string
    pub fn check_str(&self, index: usize) -> Result<&str> {
        self.get(index)
            .as_str()
            .ok_or_else(|| self.bad_argument(index, "string"))
    }

    /// Optional UTF-8 string
    pub fn opt_str(&self, index: usize) -> Result<Option<&str>> {
        match self.get(index) {
            Value::Nil => Ok(None),
            _ => self.check_str(index).map(Some),
        }
    }

    /// Optional byte string
    pub fn opt_bytes(&self, index: usize) -> Result<Option<&Bytes>> {
        match self.get(index) {
            Value::Nil => Ok(None),
            _ => self.check_bytes(index).map(Some),
        }
    }

    /// Required integer
    pub fn check_integer(&self, index: usize) -> Result<i64> {
        self.get(index)
            .as_integer()
            .ok_or_else(|| self.bad_argument(index, "integer"))
    }

    /// Optional boolean
    pub fn opt_bool(&self, index: usize) -> Result<Option<bool>> {
        match self.get(index) {
            Value::Nil => Ok(None),
            Value::Bool(b) => Ok(Some(*b)),
            _ => Err(self.bad_argument(index, "boolean")),
        }
    }

    /// Required table
    pub fn check_table(&self, index: usize) -> Result<&Table> {
        self.get(index)
            .as_table()
            .ok_or_else(|| self.bad_argument(index, "table"))
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
