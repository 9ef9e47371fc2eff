//! JSON documents describing interpolating vectors.
//!
//! Initial controls, bounds and other time-dependent inputs are supplied as
//!
//! ```json
//! {
//!   "id": "compressor_1",
//!   "data": [
//!     {"time": 0.0, "values": [1.0, 2.0]},
//!     {"time": 3600.0, "values": [1.5, 2.0]}
//!   ]
//! }
//! ```
//!
//! where each entry may name its coordinate `time` or `x`. Documents are
//! validated against [`vector_schema`] before any value is read, so a
//! malformed file is reported with its id and the JSON pointer of the
//! offending node instead of surfacing later as a numerical failure.
//!
//! Only the subset of JSON Schema these documents need is understood:
//! `type`, `required`, `properties`, `additionalProperties: false`, `items`,
//! `minItems`, `maxItems` and `oneOf`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{TransflowError, TransflowResult};
use crate::interpolation::{Interpolating, InterpolatingVector};

const UNKNOWN_ID: &str = "<unknown>";

/// Typed form of a validated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorDocument {
    pub id: String,
    pub data: Vec<VectorEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorEntry {
    #[serde(alias = "x")]
    pub time: f64,
    pub values: Vec<f64>,
}

/// Schema of a document whose inner vectors have `inner_length` entries.
pub fn vector_schema(inner_length: usize) -> Value {
    json!({
        "type": "object",
        "required": ["id", "data"],
        "properties": {
            "id": {"type": "string"},
            "data": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "x": {"type": "number"},
                        "time": {"type": "number"},
                        "values": {
                            "type": "array",
                            "minItems": inner_length,
                            "maxItems": inner_length,
                            "items": {"type": "number"}
                        }
                    },
                    "required": ["values"],
                    "oneOf": [
                        {"required": ["x"]},
                        {"required": ["time"]}
                    ]
                }
            }
        }
    })
}

/// Validates `document` against `schema`.
///
/// The error names the document's `id` (when it has one) and the JSON
/// pointer of the first violation found.
pub fn validate(schema: &Value, document: &Value) -> TransflowResult<()> {
    let mut pointer = String::new();
    check(schema, document, &mut pointer).map_err(|violation| {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_ID);
        TransflowError::schema(id, violation.pointer, violation.message)
    })
}

struct Violation {
    pointer: String,
    message: String,
}

fn violation(pointer: &str, message: impl Into<String>) -> Violation {
    Violation {
        pointer: if pointer.is_empty() {
            "/".to_string()
        } else {
            pointer.to_string()
        },
        message: message.into(),
    }
}

fn check(schema: &Value, instance: &Value, pointer: &mut String) -> Result<(), Violation> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !has_type(instance, expected) {
            return Err(violation(
                pointer,
                format!("expected {expected}, found {}", type_name(instance)),
            ));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        if let Some(object) = instance.as_object() {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(violation(
                        pointer,
                        format!("missing required property \"{key}\""),
                    ));
                }
            }
        }
    }

    if let Some(object) = instance.as_object() {
        check_object(schema, object, pointer)?;
    }

    if let Some(array) = instance.as_array() {
        check_array(schema, array, pointer)?;
    }

    if let Some(alternatives) = schema.get("oneOf").and_then(Value::as_array) {
        let matching = alternatives
            .iter()
            .filter(|alternative| check(alternative, instance, &mut pointer.clone()).is_ok())
            .count();
        if matching != 1 {
            return Err(violation(
                pointer,
                format!(
                    "expected exactly one alternative of \"oneOf\" to match, {matching} did"
                ),
            ));
        }
    }

    Ok(())
}

fn check_object(
    schema: &Map<String, Value>,
    object: &Map<String, Value>,
    pointer: &mut String,
) -> Result<(), Violation> {
    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in object {
        let len = pointer.len();
        pointer.push('/');
        pointer.push_str(&escape_pointer_token(key));
        match properties.and_then(|p| p.get(key)) {
            Some(subschema) => check(subschema, value, pointer)?,
            None if closed => {
                return Err(violation(
                    pointer,
                    format!("additional property \"{key}\" is not allowed"),
                ))
            }
            None => {}
        }
        pointer.truncate(len);
    }
    Ok(())
}

fn check_array(
    schema: &Map<String, Value>,
    array: &[Value],
    pointer: &mut String,
) -> Result<(), Violation> {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (array.len() as u64) < min {
            return Err(violation(
                pointer,
                format!("expected at least {min} items, found {}", array.len()),
            ));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if (array.len() as u64) > max {
            return Err(violation(
                pointer,
                format!("expected at most {max} items, found {}", array.len()),
            ));
        }
    }
    if let Some(items) = schema.get("items") {
        for (index, item) in array.iter().enumerate() {
            let len = pointer.len();
            pointer.push('/');
            pointer.push_str(&index.to_string());
            check(items, item, pointer)?;
            pointer.truncate(len);
        }
    }
    Ok(())
}

fn has_type(instance: &Value, expected: &str) -> bool {
    match expected {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => instance.is_i64() || instance.is_u64(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => true,
    }
}

fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

impl InterpolatingVector {
    /// Builds a vector from a validated document.
    pub fn from_json(document: &Value, inner_length: usize) -> TransflowResult<Self> {
        validate(&vector_schema(inner_length), document)?;
        let parsed: VectorDocument = serde_json::from_value(document.clone())?;

        if let Some(pos) = parsed
            .data
            .windows(2)
            .position(|w| !(w[0].time < w[1].time))
        {
            return Err(TransflowError::schema(
                &parsed.id,
                format!("/data/{}", pos + 1),
                format!(
                    "times must be strictly increasing, {} follows {}",
                    parsed.data[pos + 1].time,
                    parsed.data[pos].time
                ),
            ));
        }

        let points = parsed.data.iter().map(|entry| entry.time).collect();
        let values = parsed
            .data
            .into_iter()
            .flat_map(|entry| entry.values)
            .collect();
        debug!(id = %parsed.id, inner_length, "read interpolating vector document");
        InterpolatingVector::with_values(points, inner_length, values)
    }

    /// Reads and validates a document from disk.
    pub fn from_json_file(path: impl AsRef<Path>, inner_length: usize) -> TransflowResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let document: Value = serde_json::from_str(&text)?;
        Self::from_json(&document, inner_length)
    }
}

/// Document describing any interpolating vector, using the `time` key.
pub fn to_document<I: Interpolating + ?Sized>(vector: &I, id: &str) -> VectorDocument {
    let inner = vector.inner_length();
    let data = vector
        .points()
        .iter()
        .enumerate()
        .map(|(index, &time)| VectorEntry {
            time,
            values: vector.values()[index * inner..(index + 1) * inner].to_vec(),
        })
        .collect();
    VectorDocument {
        id: id.to_string(),
        data,
    }
}

pub fn to_json<I: Interpolating + ?Sized>(vector: &I, id: &str) -> TransflowResult<Value> {
    Ok(serde_json::to_value(to_document(vector, id))?)
}

/// Writes `vector` as a pretty-printed document.
pub fn write_json_file<I: Interpolating + ?Sized>(
    vector: &I,
    id: &str,
    path: impl AsRef<Path>,
) -> TransflowResult<()> {
    let text = serde_json::to_string_pretty(&to_document(vector, id))?;
    fs::write(path.as_ref(), text)?;
    Ok(())
}
