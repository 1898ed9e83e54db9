use color_eyre::eyre::{eyre, Report};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A self-describing value tree, the unit of argument and result exchange.
///
/// The wire codec (bincode over length-delimited frames) is not
/// self-describing, so every user-visible value travels as one of these
/// variants. The codec is deterministic for equal inputs and round-trips
/// over all variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

/// Extraction of a native type out of a `Value`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, Report>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, Report> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, Report> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(eyre!("expected bool, found {}", other.type_name())),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, Report> {
        match value {
            Value::Int(i) => Ok(i),
            other => Err(eyre!("expected int, found {}", other.type_name())),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, Report> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(eyre!("expected float, found {}", other.type_name())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, Report> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(eyre!("expected str, found {}", other.type_name())),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, Report> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(eyre!("expected bytes, found {}", other.type_name())),
        }
    }
}

impl FromValue for Vec<Value> {
    fn from_value(value: Value) -> Result<Self, Report> {
        match value {
            Value::List(l) => Ok(l),
            other => Err(eyre!("expected list, found {}", other.type_name())),
        }
    }
}

/// The keyword-argument mapping sent with every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kwargs(BTreeMap<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extracts argument `name` as a native type.
    pub fn get<T: FromValue>(&self, name: &str) -> Result<T, Report> {
        let value = self
            .0
            .get(name)
            .cloned()
            .ok_or_else(|| eyre!("missing argument '{}'", name))?;
        T::from_value(value)
    }

    /// Extracts argument `name` through its `Remotable::load` capability.
    pub fn load<T: Remotable>(&self, name: &str) -> Result<T, Report> {
        let value = self
            .0
            .get(name)
            .cloned()
            .ok_or_else(|| eyre!("missing argument '{}'", name))?;
        T::load(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Opt-in custom (de)serialization.
///
/// A type implementing `Remotable` declares how the subset of its state
/// that should travel over the wire is dumped into a `Value` and loaded
/// back. Arguments are dumped on the driver before sending and loaded by
/// the registered adapter on the agent; return values symmetrically. The
/// round-trip law `load(dump(x)) == x` must hold for the declared state.
pub trait Remotable: Sized {
    fn dump(&self) -> Value;

    fn load(value: Value) -> Result<Self, Report>;
}
