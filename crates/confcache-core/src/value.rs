//! Configuration values and cached entries
//!
//! A `Value` is a tagged union over the primitive types plus homogeneous
//! lists and pairs of primitives. An `Entry` is what the engine answers
//! for one key: the value (or `None` for "unset"), the schema it is
//! described by, and whether it came from a default and can be written.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfError, ConfResult};

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// No type; used for unset schema slots
    #[default]
    Invalid,
    String,
    Int,
    Float,
    Bool,
    Schema,
    List,
    Pair,
}

impl ValueType {
    /// Primitive types are the only ones allowed inside lists and pairs.
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::Int | ValueType::Float | ValueType::Bool | ValueType::Schema
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Invalid => "*invalid*",
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::Schema => "schema",
            ValueType::List => "list",
            ValueType::Pair => "pair",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of a key: its type, documentation and default value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub value_type: ValueType,
    /// Element type when `value_type` is `List`
    pub list_type: ValueType,
    /// Member types when `value_type` is `Pair`
    pub car_type: ValueType,
    pub cdr_type: ValueType,
    pub locale: Option<String>,
    /// Application that owns the key
    pub owner: Option<String>,
    pub short_desc: Option<String>,
    pub long_desc: Option<String>,
    pub default_value: Option<Box<Value>>,
}

impl Schema {
    /// Schema for a key of `value_type` with the given default.
    pub fn with_default(value_type: ValueType, default_value: Value) -> Self {
        let (list_type, car_type, cdr_type) = match &default_value {
            Value::List { list_type, .. } => (*list_type, ValueType::Invalid, ValueType::Invalid),
            Value::Pair(car, cdr) => (ValueType::Invalid, car.value_type(), cdr.value_type()),
            _ => (ValueType::Invalid, ValueType::Invalid, ValueType::Invalid),
        };
        Self {
            value_type,
            list_type,
            car_type,
            cdr_type,
            default_value: Some(Box::new(default_value)),
            ..Self::default()
        }
    }
}

/// A configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i32),
    Float(f64),
    Bool(bool),
    Schema(Box<Schema>),
    List {
        list_type: ValueType,
        items: Vec<Value>,
    },
    Pair(Box<Value>, Box<Value>),
}

impl Value {
    /// Build a homogeneous list of primitives.
    pub fn list(list_type: ValueType, items: Vec<Value>) -> ConfResult<Self> {
        let value = Value::List { list_type, items };
        value.validate()?;
        Ok(value)
    }

    /// Build a pair of primitives.
    pub fn pair(car: Value, cdr: Value) -> ConfResult<Self> {
        let value = Value::Pair(Box::new(car), Box::new(cdr));
        value.validate()?;
        Ok(value)
    }

    /// Build a list from native items, e.g. `Value::list_of(vec![1, 2, 3])`.
    pub fn list_of<T: FromValue + Into<Value>>(items: Vec<T>) -> Self {
        Value::List { list_type: T::VALUE_TYPE, items: items.into_iter().map(Into::into).collect() }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::Schema(_) => ValueType::Schema,
            Value::List { .. } => ValueType::List,
            Value::Pair(..) => ValueType::Pair,
        }
    }

    /// Check the structural rules a hand-built value may have broken.
    ///
    /// Lists and pairs hold primitives only, and a list holds one type.
    pub fn validate(&self) -> ConfResult<()> {
        match self {
            Value::List { list_type, items } => {
                if !list_type.is_primitive() {
                    return Err(ConfError::InvalidValue {
                        reason: format!("list element type must be primitive, not {}", list_type),
                    });
                }
                for item in items {
                    if item.value_type() != *list_type {
                        return Err(ConfError::InvalidValue {
                            reason: format!(
                                "list of {} contains a {} element",
                                list_type,
                                item.value_type()
                            ),
                        });
                    }
                }
                Ok(())
            }
            Value::Pair(car, cdr) => {
                for member in [car, cdr] {
                    if !member.value_type().is_primitive() {
                        return Err(ConfError::InvalidValue {
                            reason: format!("pair member must be primitive, not {}", member.value_type()),
                        });
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Convert into a native type, reporting a mismatch against `key`.
    pub fn extract<T: FromValue>(self, key: &str) -> ConfResult<T> {
        let found = self.value_type();
        T::from_value(self).ok_or_else(|| ConfError::type_mismatch(key, T::VALUE_TYPE, found))
    }

    /// Convert a list value into native items of type `T`.
    pub fn into_list<T: FromValue>(self, key: &str) -> ConfResult<Vec<T>> {
        match self {
            Value::List { list_type, items } => {
                if list_type != T::VALUE_TYPE {
                    return Err(ConfError::type_mismatch(key, T::VALUE_TYPE, list_type));
                }
                items.into_iter().map(|item| item.extract(key)).collect()
            }
            other => Err(ConfError::type_mismatch(key, ValueType::List, other.value_type())),
        }
    }

    /// Convert a pair value into native members of types `A` and `B`.
    pub fn into_pair<A: FromValue, B: FromValue>(self, key: &str) -> ConfResult<(A, B)> {
        match self {
            Value::Pair(car, cdr) => Ok((car.extract(key)?, cdr.extract(key)?)),
            other => Err(ConfError::type_mismatch(key, ValueType::Pair, other.value_type())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Schema(s) => write!(f, "Schema (type: `{}')", s.value_type),
            Value::List { items, .. } => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Pair(car, cdr) => write!(f, "({},{})", car, cdr),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}

impl From<Schema> for Value {
    fn from(v: Schema) -> Self { Value::Schema(Box::new(v)) }
}

/// Native types a primitive [`Value`] converts into.
pub trait FromValue: Sized {
    /// Tag of the values this type is read from
    const VALUE_TYPE: ValueType;

    /// `None` when the value carries another tag.
    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for i32 {
    const VALUE_TYPE: ValueType = ValueType::Int;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const VALUE_TYPE: ValueType = ValueType::Float;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const VALUE_TYPE: ValueType = ValueType::Bool;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for String {
    const VALUE_TYPE: ValueType = ValueType::String;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for Schema {
    const VALUE_TYPE: ValueType = ValueType::Schema;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Schema(v) => Some(*v),
            _ => None,
        }
    }
}

/// The engine's answer for one key.
///
/// `value == None` is an explicit "unset" answer, which the cache keeps
/// just like a value so the next read needs no round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Option<Value>,
    /// Key of the schema describing this entry, if any
    pub schema_name: Option<String>,
    /// Value came from a schema default rather than a user setting
    pub is_default: bool,
    pub is_writable: bool,
}

impl Entry {
    /// Writable, non-default entry holding `value`.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            schema_name: None,
            is_default: false,
            is_writable: true,
        }
    }

    /// Writable entry with no value.
    pub fn unset(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            schema_name: None,
            is_default: false,
            is_writable: true,
        }
    }

    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_writable(mut self, is_writable: bool) -> Self {
        self.is_writable = is_writable;
        self
    }

    /// Same visible state: value and default flag.
    ///
    /// Writability and schema name are metadata; a change to them alone
    /// refreshes the cache without waking listeners.
    pub fn same_state(&self, other: &Entry) -> bool {
        self.value == other.value && self.is_default == other.is_default
    }
}
