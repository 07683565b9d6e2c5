//! Core types shared across the resource graph

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// Lifecycle state of a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Declared, never applied
    #[default]
    Created,
    /// Applied successfully
    Operational,
    /// Marked for removal
    Removed,
    /// Last apply failed
    Error,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Operational => "operational",
            Self::Removed => "removed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one input on one resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputRef {
    pub resource: String,
    pub input: String,
}

impl InputRef {
    pub fn new(resource: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            input: input.into(),
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.input)
    }
}

/// A flattened connection as recorded in change log snapshots
///
/// `receiver_input` keeps the slot syntax (`config:key|tag`) for tagged
/// edges, so a connection can be re-established from this form alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Connection {
    pub emitter: String,
    pub emitter_input: String,
    pub receiver: String,
    pub receiver_input: String,
}

impl Connection {
    /// Encode as a `[emitter, emitter_input, receiver, receiver_input]` array
    pub fn to_value(&self) -> Value {
        json!([
            self.emitter,
            self.emitter_input,
            self.receiver,
            self.receiver_input
        ])
    }

    /// Decode the array form produced by [`Connection::to_value`]
    pub fn from_value(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        let [emitter, emitter_input, receiver, receiver_input] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            emitter: emitter.as_str()?.to_string(),
            emitter_input: emitter_input.as_str()?.to_string(),
            receiver: receiver.as_str()?.to_string(),
            receiver_input: receiver_input.as_str()?.to_string(),
        })
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.emitter, self.emitter_input, self.receiver, self.receiver_input
        )
    }
}
