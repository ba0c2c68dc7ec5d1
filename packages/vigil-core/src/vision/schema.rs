//! Recursive output-schema descriptor for SOPs.
//!
//! A SOP carries a JSON type descriptor shaped like
//! `{"type": "object", "properties": {...}, "required": [...]}`. This module
//! parses it into a validated tree, translates the tree into the vision
//! API's response-schema format, and re-validates model output against it.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{VigilError, VigilResult};

/// Validated schema tree for a SOP's structured output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSchema {
    String,
    Number,
    Boolean,
    Array {
        items: Box<OutputSchema>,
    },
    Object {
        properties: BTreeMap<String, OutputSchema>,
        required: Vec<String>,
    },
}

impl OutputSchema {
    /// Parses and validates a SOP's JSON type descriptor.
    ///
    /// Rules:
    /// - every node must be an object with a string `type`
    /// - `object` nodes need a `properties` map; every `required` name must
    ///   appear in `properties`
    /// - `array` nodes need `items`
    /// - unrecognized type names degrade to `string`
    pub fn parse(value: &Value) -> VigilResult<Self> {
        Self::parse_at(value, "$")
    }

    fn parse_at(value: &Value, path: &str) -> VigilResult<Self> {
        let node = value
            .as_object()
            .ok_or_else(|| VigilError::Schema(format!("{path}: node must be an object")))?;
        let type_name = node
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VigilError::Schema(format!("{path}: missing \"type\"")))?;

        match type_name {
            "object" => {
                let properties = node
                    .get("properties")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        VigilError::Schema(format!("{path}: object node missing \"properties\""))
                    })?;

                let mut parsed = BTreeMap::new();
                for (name, child) in properties {
                    let child_path = format!("{path}.{name}");
                    parsed.insert(name.clone(), Self::parse_at(child, &child_path)?);
                }

                let required: Vec<String> = match node.get("required") {
                    Some(Value::Array(names)) => names
                        .iter()
                        .map(|n| {
                            n.as_str().map(str::to_owned).ok_or_else(|| {
                                VigilError::Schema(format!(
                                    "{path}: \"required\" entries must be strings"
                                ))
                            })
                        })
                        .collect::<VigilResult<_>>()?,
                    None => Vec::new(),
                    Some(_) => {
                        return Err(VigilError::Schema(format!(
                            "{path}: \"required\" must be an array"
                        )))
                    }
                };
                for name in &required {
                    if !parsed.contains_key(name) {
                        return Err(VigilError::Schema(format!(
                            "{path}: required property \"{name}\" not in properties"
                        )));
                    }
                }

                Ok(Self::Object {
                    properties: parsed,
                    required,
                })
            }
            "array" => {
                let items = node.get("items").ok_or_else(|| {
                    VigilError::Schema(format!("{path}: array node missing \"items\""))
                })?;
                Ok(Self::Array {
                    items: Box::new(Self::parse_at(items, &format!("{path}[]"))?),
                })
            }
            "number" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "string" => Ok(Self::String),
            other => {
                // Unknown scalar names degrade to string rather than
                // rejecting the whole SOP.
                log::warn!("[Schema] Unknown type \"{other}\" at {path}, treating as string");
                Ok(Self::String)
            }
        }
    }

    /// Translates the tree into the generate-content API's response schema.
    pub fn to_response_schema(&self) -> Value {
        match self {
            Self::String => json!({"type": "STRING"}),
            Self::Number => json!({"type": "NUMBER"}),
            Self::Boolean => json!({"type": "BOOLEAN"}),
            Self::Array { items } => json!({
                "type": "ARRAY",
                "items": items.to_response_schema(),
            }),
            Self::Object {
                properties,
                required,
            } => {
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, child)| (name.clone(), child.to_response_schema()))
                    .collect();
                let mut node = json!({
                    "type": "OBJECT",
                    "properties": Value::Object(props),
                });
                if !required.is_empty() {
                    node["required"] = json!(required);
                }
                node
            }
        }
    }

    /// Checks a model output value against the schema: required properties
    /// present, types matching, recursively.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        self.check_at(value, "$")
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<(), String> {
        match self {
            Self::String => value
                .is_string()
                .then_some(())
                .ok_or_else(|| format!("{path}: expected string")),
            Self::Number => value
                .is_number()
                .then_some(())
                .ok_or_else(|| format!("{path}: expected number")),
            Self::Boolean => value
                .is_boolean()
                .then_some(())
                .ok_or_else(|| format!("{path}: expected boolean")),
            Self::Array { items } => {
                let elements = value
                    .as_array()
                    .ok_or_else(|| format!("{path}: expected array"))?;
                for (index, element) in elements.iter().enumerate() {
                    items.check_at(element, &format!("{path}[{index}]"))?;
                }
                Ok(())
            }
            Self::Object {
                properties,
                required,
            } => {
                let map = value
                    .as_object()
                    .ok_or_else(|| format!("{path}: expected object"))?;
                for name in required {
                    if !map.contains_key(name) {
                        return Err(format!("{path}: missing required property \"{name}\""));
                    }
                }
                for (name, child) in map {
                    if let Some(schema) = properties.get(name) {
                        schema.check_at(child, &format!("{path}.{name}"))?;
                    }
                    // Extra properties the schema doesn't know about are
                    // tolerated; the model occasionally adds commentary keys.
                }
                Ok(())
            }
        }
    }
}
