//! Per-attribute serializers.
//!
//! A model class may attach an [`AttributeSerializer`] to any attribute.
//! Outgoing values pass through `serialize` before the buffer codec runs;
//! incoming values pass through `deserialize` after buffers are reinjected.
//! Attributes without a serializer travel as-is, with model references
//! packed into `IPY_MODEL_<id>` strings.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Result, WidgetError};
use crate::manager::WidgetManager;
use crate::registry::Syncable;
use crate::value::{Attributes, Value};

/// Prefix of a packed model reference.
pub const MODEL_REFERENCE_PREFIX: &str = "IPY_MODEL_";

/// Converts one attribute between its local and wire representation.
#[async_trait]
pub trait AttributeSerializer: Send + Sync {
    /// Local value to wire value. Binary blobs may be left in place.
    fn serialize(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }

    /// Wire value to local value.
    ///
    /// `manager` is absent for models that are not owned by a manager.
    async fn deserialize(
        &self,
        value: Value,
        manager: Option<&Arc<WidgetManager>>,
    ) -> Result<Value> {
        let _ = manager;
        Ok(value)
    }
}

/// Resolves `IPY_MODEL_<id>` strings to live models, recursively through
/// arrays and objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelReferences;

#[async_trait]
impl AttributeSerializer for ModelReferences {
    fn serialize(&self, value: &Value) -> Result<Value> {
        Ok(pack_models(value))
    }

    async fn deserialize(
        &self,
        value: Value,
        manager: Option<&Arc<WidgetManager>>,
    ) -> Result<Value> {
        let manager = manager.ok_or_else(|| WidgetError::Deserialization {
            attribute: String::new(),
            message: "model references need a manager to resolve against".to_string(),
        })?;
        unpack_models(value, manager).await
    }
}

/// Extract the model id from a packed reference.
pub fn model_reference_id(s: &str) -> Option<&str> {
    s.strip_prefix(MODEL_REFERENCE_PREFIX)
}

/// Replace every model with its packed reference.
pub fn pack_models(value: &Value) -> Value {
    match value {
        Value::Model(model) => Value::String(format!("{}{}", MODEL_REFERENCE_PREFIX, model.id())),
        Value::Array(items) => Value::Array(items.iter().map(pack_models).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), pack_models(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace every packed reference with the model it names.
///
/// Fails with [`WidgetError::NotFound`] when a referenced id is unknown.
pub fn unpack_models(value: Value, manager: &Arc<WidgetManager>) -> BoxFuture<'_, Result<Value>> {
    async move {
        match value {
            Value::String(s) => match model_reference_id(&s) {
                Some(id) => Ok(Value::Model(manager.get_model(id).await?)),
                None => Ok(Value::String(s)),
            },
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(unpack_models(item, manager).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Attributes::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key, unpack_models(item, manager).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }
    .boxed()
}

/// Run each attribute through the class's serializer, if any.
pub fn serialize_state(class: &dyn Syncable, attrs: &Attributes) -> Result<Attributes> {
    let mut out = Attributes::with_capacity(attrs.len());
    for (name, value) in attrs {
        let value = match class.serializer(name) {
            Some(serializer) => serializer
                .serialize(value)
                .map_err(|err| name_attribute(err, name, true))?,
            None => value.clone(),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

/// Run each attribute through the class's deserializer, if any.
pub async fn deserialize_state(
    class: &dyn Syncable,
    attrs: Attributes,
    manager: Option<&Arc<WidgetManager>>,
) -> Result<Attributes> {
    let mut out = Attributes::with_capacity(attrs.len());
    for (name, value) in attrs {
        let value = match class.serializer(&name) {
            Some(serializer) => serializer
                .deserialize(value, manager)
                .await
                .map_err(|err| name_attribute(err, &name, false))?,
            None => value,
        };
        out.insert(name, value);
    }
    Ok(out)
}

fn name_attribute(err: WidgetError, name: &str, outgoing: bool) -> WidgetError {
    match err {
        WidgetError::Serialization { attribute, message } if attribute.is_empty() => {
            WidgetError::Serialization {
                attribute: name.to_string(),
                message,
            }
        }
        WidgetError::Deserialization { attribute, message } if attribute.is_empty() => {
            WidgetError::Deserialization {
                attribute: name.to_string(),
                message,
            }
        }
        WidgetError::NotFound(id) if !outgoing => WidgetError::Deserialization {
            attribute: name.to_string(),
            message: format!("unknown model {}", id),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelSpec;

    #[test]
    fn test_model_reference_id() {
        assert_eq!(model_reference_id("IPY_MODEL_abc"), Some("abc"));
        assert_eq!(model_reference_id("abc"), None);
    }

    #[tokio::test]
    async fn test_references_without_manager_fail() {
        let err = ModelReferences
            .deserialize(Value::from("IPY_MODEL_x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WidgetError::Deserialization { .. }));
    }

    #[tokio::test]
    async fn test_deserialize_names_failing_attribute() {
        let class = ModelSpec::widget("BoxModel", "@jupyter-widgets/controls", "2.0.0")
            .with_model_references(["children"]);
        let mut attrs = Attributes::new();
        attrs.insert("children".into(), Value::from(vec![Value::from("IPY_MODEL_x")]));

        let err = deserialize_state(&class, attrs, None).await.unwrap_err();
        assert!(matches!(err, WidgetError::Deserialization { attribute, .. } if attribute == "children"));
    }

    #[test]
    fn test_serialize_leaves_plain_attributes() {
        let class = ModelSpec::widget("IntSliderModel", "@jupyter-widgets/controls", "2.0.0");
        let mut attrs = Attributes::new();
        attrs.insert("value".into(), Value::from(5));
        attrs.insert("data".into(), Value::from(vec![1u8, 2, 3]));

        let out = serialize_state(&class, &attrs).unwrap();
        assert_eq!(out, attrs);
    }
}
