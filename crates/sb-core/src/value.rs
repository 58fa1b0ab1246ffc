use serde::{Deserialize, Serialize};

use crate::error::ScriptBindError;
use crate::types::{ObjectId, Time, Vector};

/// Tagged-union runtime value exchanged with the engine protocol.
///
/// Heap payloads (`Str`, `Vector`) are owned by the value; `Clone` deep-copies
/// them and reassignment drops the previous payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Empty,
    Int(i32),
    Float(f32),
    Str(String),
    Vector(Vector),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Empty => "EMPTY",
            Value::Int(_) => "INT",
            Value::Float(_) => "FLOAT",
            Value::Str(_) => "STRING",
            Value::Vector(_) => "VECTOR",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn clear(&mut self) {
        *self = Value::Empty;
    }

    pub fn as_int(&self) -> Result<i32, ScriptBindError> {
        match self {
            Value::Int(value) => Ok(*value),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "i32")),
        }
    }

    pub fn as_uint(&self) -> Result<u32, ScriptBindError> {
        match self {
            Value::Int(value) => Ok(*value as u32),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "u32")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ScriptBindError> {
        match self {
            Value::Int(value) => Ok(*value != 0),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "bool")),
        }
    }

    pub fn as_float(&self) -> Result<f32, ScriptBindError> {
        match self {
            Value::Float(value) => Ok(*value),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "f32")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ScriptBindError> {
        match self {
            Value::Str(value) => Ok(value.as_str()),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "String")),
        }
    }

    pub fn as_string(&self) -> Result<String, ScriptBindError> {
        self.as_str().map(str::to_string)
    }

    pub fn as_vector(&self) -> Result<Vector, ScriptBindError> {
        match self {
            Value::Vector(value) => Ok(*value),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "Vector")),
        }
    }

    pub fn as_time(&self) -> Result<Time, ScriptBindError> {
        match self {
            Value::Int(value) => Ok(Time(*value as u64)),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "Time")),
        }
    }

    pub fn as_object(&self) -> Result<ObjectId, ScriptBindError> {
        match self {
            Value::Int(value) => Ok(ObjectId(*value)),
            other => Err(ScriptBindError::type_mismatch(other.kind_name(), "ObjectId")),
        }
    }
}

/// Typed decoding out of a [`Value`], used by message data slots and
/// persistent variables.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_bool()
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_int()
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_uint()
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_float()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_string()
    }
}

impl FromValue for Vector {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_vector()
    }
}

impl FromValue for Time {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_time()
    }
}

impl FromValue for ObjectId {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        value.as_object()
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(value as i32)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i32)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vector> for Value {
    fn from(value: Vector) -> Self {
        Value::Vector(value)
    }
}

impl From<Time> for Value {
    fn from(value: Time) -> Self {
        Value::Int(value.0 as i32)
    }
}

impl From<ObjectId> for Value {
    fn from(value: ObjectId) -> Self {
        Value::Int(value.0)
    }
}
