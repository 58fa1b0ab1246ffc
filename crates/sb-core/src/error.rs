use thiserror::Error;

use crate::types::ObjectId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ScriptBindError {
    pub code: String,
    pub message: String,
}

impl ScriptBindError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(got: &str, expected: &str) -> Self {
        Self::new(
            "VALUE_TYPE_MISMATCH",
            format!(
                "Cannot translate a value of kind {} to a value of type {}.",
                got, expected
            ),
        )
    }

    pub fn missing_resource(kind: &str, name: &str, object: ObjectId) -> Self {
        let message = if object == ObjectId::NONE {
            format!("The requested {} \"{}\" does not exist.", kind, name)
        } else {
            format!(
                "The requested {} \"{}\" does not exist for object {}.",
                kind, name, object
            )
        };
        Self::new("RESOURCE_MISSING", message)
    }

    pub fn message_wrap(message_name: &str, shape: &str, problem: &str) -> Self {
        Self::new(
            "MESSAGE_WRAP",
            format!(
                "Can't reinterpret a \"{}\" message as {}: {}.",
                message_name, shape, problem
            ),
        )
    }
}
