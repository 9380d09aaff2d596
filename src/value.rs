//! Attribute values.
//!
//! A [`Value`] is JSON plus two things JSON cannot carry: raw binary blobs
//! and live references to other models. Binary blobs leave the structure
//! through the buffer codec before anything is put on the wire; model
//! references are packed into `IPY_MODEL_<id>` strings by the serializers.

use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::error::{Result, WidgetError};
use crate::model::ModelHandle;
use crate::serializers::MODEL_REFERENCE_PREFIX;

/// Ordered mapping of attribute name to value.
pub type Attributes = IndexMap<String, Value>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Opaque binary payload, sent out-of-band.
    Bytes(Bytes),
    Array(Vec<Value>),
    Object(Attributes),
    /// Reference to another model in the same manager.
    Model(ModelHandle),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Attributes> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&ModelHandle> {
        match self {
            Value::Model(model) => Some(model),
            _ => None,
        }
    }

    /// Convert to plain JSON.
    ///
    /// Model references become `IPY_MODEL_<id>` strings. Binary blobs must
    /// have been removed with [`extract_buffers`](crate::buffers::extract_buffers)
    /// first; meeting one here is a serialization error.
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(_) => {
                return Err(WidgetError::Serialization {
                    attribute: String::new(),
                    message: "binary value left in a JSON payload".to_string(),
                })
            }
            Value::Array(items) => JsonValue::Array(
                items.iter().map(Value::to_json).collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => JsonValue::Object(attributes_to_json(map)?),
            Value::Model(model) => {
                JsonValue::String(format!("{}{}", MODEL_REFERENCE_PREFIX, model.id()))
            }
        })
    }
}

/// Convert an attribute map into a JSON object.
pub fn attributes_to_json(attrs: &Attributes) -> Result<JsonMap<String, JsonValue>> {
    let mut out = JsonMap::with_capacity(attrs.len());
    for (key, value) in attrs {
        let json = value.to_json().map_err(|err| match err {
            WidgetError::Serialization { message, .. } => WidgetError::Serialization {
                attribute: key.clone(),
                message,
            },
            other => other,
        })?;
        out.insert(key.clone(), json);
    }
    Ok(out)
}

/// Convert a JSON object into an attribute map.
pub fn attributes_from_json(map: JsonMap<String, JsonValue>) -> Attributes {
    map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => Value::Object(attributes_from_json(map)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON representation and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Attributes> for Value {
    fn from(map: Attributes) -> Self {
        Value::Object(map)
    }
}

impl From<ModelHandle> for Value {
    fn from(model: ModelHandle) -> Self {
        Value::Model(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_preserves_key_order() {
        let value = Value::from(json!({"z": 1, "a": [true, null], "m": "x"}));
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_to_json_rejects_bytes() {
        let value = Value::Array(vec![Value::from(1), Value::from(vec![1u8, 2])]);
        assert!(matches!(
            value.to_json(),
            Err(WidgetError::Serialization { .. })
        ));
    }

    #[test]
    fn test_attributes_to_json_names_the_attribute() {
        let mut attrs = Attributes::new();
        attrs.insert("ok".into(), Value::from("fine"));
        attrs.insert("data".into(), Value::from(vec![0u8]));
        match attributes_to_json(&attrs) {
            Err(WidgetError::Serialization { attribute, .. }) => assert_eq!(attribute, "data"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert!(Value::from(f64::NAN).is_null());
        assert_eq!(Value::from(2.5).as_f64(), Some(2.5));
    }
}
