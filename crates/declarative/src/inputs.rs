//! Input schemas and structural kinds
//!
//! The kind of an input is inferred once, when the input is declared, and
//! stored next to the schema. Wiring and resolution dispatch on the stored
//! kind and never look at the raw schema again.

use crate::computable::Aggregation;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Characters with a meaning in edge encoding and slot syntax
pub const RESERVED: [char; 3] = ['|', ':', '>'];

/// Structural kind of an input
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Scalar,
    Sequence,
    Mapping,
    SequenceOfMappings,
    Computed,
}

impl InputKind {
    /// Infer the kind of a loosely-typed schema
    ///
    /// `"str!"` and other plain schemas are scalars, `[...]` is a sequence
    /// unless its element is an object, `{...}` is a mapping.
    pub fn infer(schema: &Value) -> Self {
        match schema {
            Value::Array(items) => match items.first() {
                Some(Value::Object(_)) => Self::SequenceOfMappings,
                _ => Self::Sequence,
            },
            Value::Object(_) => Self::Mapping,
            _ => Self::Scalar,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Sequence => "sequence",
            Self::Mapping => "mapping",
            Self::SequenceOfMappings => "sequence_of_mappings",
            Self::Computed => "computed",
        }
    }

    /// Whether edges into this kind may address a sub-key
    pub fn accepts_slots(&self) -> bool {
        matches!(self, Self::Mapping | Self::SequenceOfMappings)
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scalar" => Ok(Self::Scalar),
            "sequence" => Ok(Self::Sequence),
            "mapping" => Ok(Self::Mapping),
            "sequence_of_mappings" => Ok(Self::SequenceOfMappings),
            "computed" => Ok(Self::Computed),
            other => Err(format!("unknown input kind '{other}'")),
        }
    }
}

/// Function deriving a computed input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Computable {
    pub lang: String,
    pub func: String,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl Computable {
    pub fn new(lang: impl Into<String>, func: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            func: func.into(),
            aggregation: Aggregation::Values,
        }
    }

    /// Present collected values as `{value, resource, input}` envelopes
    pub fn full(mut self) -> Self {
        self.aggregation = Aggregation::Full;
        self
    }
}

/// Declared input: schema, inferred kind and directly assigned value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub schema: Value,
    pub kind: InputKind,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computable: Option<Computable>,
}

impl InputSchema {
    /// Declare an input, inferring its kind from `schema`
    pub fn new(schema: Value, value: Value) -> Self {
        Self {
            kind: InputKind::infer(&schema),
            schema,
            value,
            computable: None,
        }
    }

    pub fn scalar(value: Value) -> Self {
        Self::new(Value::String("str".into()), value)
    }

    pub fn sequence(value: Value) -> Self {
        Self::new(Value::Array(vec![Value::String("str".into())]), value)
    }

    pub fn mapping(value: Value) -> Self {
        Self::new(Value::Object(serde_json::Map::new()), value)
    }

    pub fn sequence_of_mappings(value: Value) -> Self {
        Self::new(
            Value::Array(vec![Value::Object(serde_json::Map::new())]),
            value,
        )
    }

    pub fn computed(computable: Computable) -> Self {
        Self {
            schema: Value::String("str".into()),
            kind: InputKind::Computed,
            value: Value::Null,
            computable: Some(computable),
        }
    }

    /// Parse a definition of the form `{"schema": ..., "value": ..., "computable": {...}}`
    ///
    /// A bare value that is not such an object declares a scalar holding it.
    pub fn from_definition(definition: &Value) -> Result<Self> {
        let Some(obj) = definition.as_object().filter(|o| o.contains_key("schema")) else {
            return Ok(Self::scalar(definition.clone()));
        };
        let schema = obj.get("schema").cloned().unwrap_or(Value::Null);
        let value = obj.get("value").cloned().unwrap_or(Value::Null);
        match obj.get("computable") {
            Some(c) => {
                let computable: Computable = serde_json::from_value(c.clone())?;
                Ok(Self {
                    schema,
                    kind: InputKind::Computed,
                    value,
                    computable: Some(computable),
                })
            }
            None => Ok(Self::new(schema, value)),
        }
    }
}

/// A receiver input name with optional mapping slot: `input[:subkey][|tag]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSlot {
    pub input: String,
    pub subkey: Option<String>,
    pub tag: Option<String>,
}

impl InputSlot {
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, tag) = match raw.split_once('|') {
            Some((head, tag)) => (head, Some(tag)),
            None => (raw, None),
        };
        let (input, subkey) = match head.split_once(':') {
            Some((input, subkey)) => (input, Some(subkey)),
            None => (head, None),
        };

        validate_name(input)?;
        if let Some(subkey) = subkey {
            validate_name(subkey)?;
        }
        if let Some(tag) = tag {
            validate_name(tag)?;
            if subkey.is_none() {
                return Err(Error::InvalidName {
                    name: raw.to_string(),
                    reason: "a tag needs a sub-key".into(),
                });
            }
        }

        Ok(Self {
            input: input.to_string(),
            subkey: subkey.map(str::to_string),
            tag: tag.map(str::to_string),
        })
    }
}

impl fmt::Display for InputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)?;
        if let Some(subkey) = &self.subkey {
            write!(f, ":{subkey}")?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "|{tag}")?;
        }
        Ok(())
    }
}

/// Reject empty names and names containing a reserved delimiter
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name is empty".into(),
        });
    }
    if let Some(c) = name.chars().find(|c| RESERVED.contains(c)) {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!("'{c}' is reserved"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_kind() {
        assert_eq!(InputKind::infer(&json!("str!")), InputKind::Scalar);
        assert_eq!(InputKind::infer(&json!(["str!"])), InputKind::Sequence);
        assert_eq!(InputKind::infer(&json!([])), InputKind::Sequence);
        assert_eq!(InputKind::infer(&json!({"a": "int"})), InputKind::Mapping);
        assert_eq!(
            InputKind::infer(&json!([{"host": "str"}])),
            InputKind::SequenceOfMappings
        );
    }

    #[test]
    fn test_definition_parsing() {
        let schema = InputSchema::from_definition(&json!({
            "schema": "int",
            "computable": {"lang": "builtin", "func": "sum"}
        }))
        .unwrap();
        assert_eq!(schema.kind, InputKind::Computed);
        assert_eq!(schema.computable.unwrap().func, "sum");

        let bare = InputSchema::from_definition(&json!("10.0.0.1")).unwrap();
        assert_eq!(bare.kind, InputKind::Scalar);
        assert_eq!(bare.value, "10.0.0.1");
    }

    #[test]
    fn test_slot_parsing() {
        let slot = InputSlot::parse("config:key1|tagX").unwrap();
        assert_eq!(slot.input, "config");
        assert_eq!(slot.subkey.as_deref(), Some("key1"));
        assert_eq!(slot.tag.as_deref(), Some("tagX"));
        assert_eq!(slot.to_string(), "config:key1|tagX");

        let plain = InputSlot::parse("ip").unwrap();
        assert_eq!(plain.subkey, None);

        assert!(InputSlot::parse("config|tagX").is_err());
        assert!(InputSlot::parse("config:").is_err());
        assert!(InputSlot::parse("a:b:c").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("node-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a>b").is_err());
    }
}
