//! Wire formats.
//!
//! Comm payloads are JSON objects dispatched on their `method` field. Binary
//! buffers never appear inside them; `buffer_paths[i]` says where
//! `buffers[i]` belongs once reinjected.

use base64::Engine;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::buffers::BufferPath;
use crate::error::{Result, WidgetError};
use crate::view::ViewOptions;

/// Major version of the widget message protocol.
pub const PROTOCOL_VERSION_MAJOR: u32 = 2;
/// Minor version of the widget message protocol.
pub const PROTOCOL_VERSION_MINOR: u32 = 1;

// ---------------------------------------------------------------------------
// Comm messages
// ---------------------------------------------------------------------------

/// A message exchanged on a widget comm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WidgetMessage {
    /// Partial or full state update.
    Update {
        state: JsonMap<String, JsonValue>,
        #[serde(default)]
        buffer_paths: Vec<BufferPath>,
    },
    /// Application payload, passed through untouched.
    Custom { content: JsonValue },
    /// Full-state push used by models with the backbone sync protocol.
    Backbone {
        sync_data: JsonValue,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buffer_paths: Vec<BufferPath>,
    },
    /// Ask the front end to display the model.
    Display,
    /// Ask the remote side to send its full state.
    RequestState,
}

impl WidgetMessage {
    /// Decode the `data` field of an incoming comm message.
    pub fn from_data(data: JsonValue) -> Result<Self> {
        let method = data
            .get("method")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        serde_json::from_value(data).map_err(|err| match method {
            Some(method) => WidgetError::Protocol(format!("bad {:?} message: {}", method, err)),
            None => WidgetError::Protocol(format!("message without a method: {}", err)),
        })
    }

    /// Encode as the `data` field of an outgoing comm message.
    pub fn to_data(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn method(&self) -> &'static str {
        match self {
            WidgetMessage::Update { .. } => "update",
            WidgetMessage::Custom { .. } => "custom",
            WidgetMessage::Backbone { .. } => "backbone",
            WidgetMessage::Display => "display",
            WidgetMessage::RequestState => "request_state",
        }
    }
}

// ---------------------------------------------------------------------------
// Comm open
// ---------------------------------------------------------------------------

/// Initial state carried by a comm-open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenPayload {
    pub state: JsonMap<String, JsonValue>,
    pub buffer_paths: Vec<BufferPath>,
}

impl OpenPayload {
    /// Accept both `{state, buffer_paths}` and a flat attribute object.
    pub fn parse(data: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut map) = data else {
            return Err(WidgetError::Protocol(
                "comm open data is not an object".to_string(),
            ));
        };

        match map.remove("state") {
            Some(JsonValue::Object(state)) => {
                let buffer_paths = match map.remove("buffer_paths") {
                    Some(paths) => serde_json::from_value(paths)?,
                    None => Vec::new(),
                };
                Ok(Self {
                    state,
                    buffer_paths,
                })
            }
            Some(other) => {
                // A flat payload may legitimately have an attribute called "state".
                map.insert("state".to_string(), other);
                Ok(Self {
                    state: map,
                    buffer_paths: Vec::new(),
                })
            }
            None => Ok(Self {
                state: map,
                buffer_paths: Vec::new(),
            }),
        }
    }

    pub fn to_data(&self) -> Result<JsonValue> {
        Ok(serde_json::json!({
            "state": self.state,
            "buffer_paths": serde_json::to_value(&self.buffer_paths)?,
        }))
    }
}

/// Check the protocol version advertised in comm-open metadata.
///
/// Missing metadata is accepted; a different major version is not.
pub fn check_protocol_version(metadata: &JsonValue, expected: &str) -> Result<()> {
    let Some(version) = metadata.get("version").and_then(JsonValue::as_str) else {
        return Ok(());
    };
    let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
    if major(version) != major(expected) {
        return Err(WidgetError::VersionMismatch(format!(
            "remote speaks protocol {}, expected {}",
            version, expected
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Manager snapshots
// ---------------------------------------------------------------------------

/// A binary buffer stored inside a JSON snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBuffer {
    pub path: BufferPath,
    pub data: String,
    pub encoding: String,
}

impl SnapshotBuffer {
    pub fn encode(path: BufferPath, buffer: &[u8]) -> Self {
        Self {
            path,
            data: base64::engine::general_purpose::STANDARD.encode(buffer),
            encoding: "base64".to_string(),
        }
    }

    pub fn decode(&self) -> Result<Bytes> {
        if self.encoding != "base64" {
            return Err(WidgetError::Protocol(format!(
                "unsupported buffer encoding {:?}",
                self.encoding
            )));
        }
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map(Bytes::from)
            .map_err(|err| WidgetError::Protocol(format!("bad base64 buffer: {}", err)))
    }
}

/// Captured state of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model_name: String,
    pub model_module: String,
    #[serde(default)]
    pub model_module_version: String,
    #[serde(default)]
    pub state: JsonMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<SnapshotBuffer>,
    #[serde(default)]
    pub views: Vec<ViewOptions>,
}

/// Snapshot of every model known to a manager, keyed by model id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    pub version_major: u32,
    pub version_minor: u32,
    pub state: IndexMap<String, ModelSnapshot>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            version_major: 2,
            version_minor: 0,
            state: IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::PathSegment;
    use serde_json::json;

    #[test]
    fn test_update_message_shape() {
        let mut state = JsonMap::new();
        state.insert("value".into(), json!(5));
        let msg = WidgetMessage::Update {
            state,
            buffer_paths: vec![vec![PathSegment::from("data")]],
        };
        assert_eq!(
            msg.to_data().unwrap(),
            json!({"method": "update", "state": {"value": 5}, "buffer_paths": [["data"]]})
        );
    }

    #[test]
    fn test_update_without_buffer_paths_decodes() {
        let msg = WidgetMessage::from_data(json!({"method": "update", "state": {"value": 5}})).unwrap();
        match msg {
            WidgetMessage::Update { state, buffer_paths } => {
                assert_eq!(state["value"], json!(5));
                assert!(buffer_paths.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_display_and_request_state_are_bare() {
        assert_eq!(
            WidgetMessage::from_data(json!({"method": "display"})).unwrap(),
            WidgetMessage::Display
        );
        assert_eq!(
            WidgetMessage::RequestState.to_data().unwrap(),
            json!({"method": "request_state"})
        );
    }

    #[test]
    fn test_unknown_method_is_protocol_error() {
        let err = WidgetMessage::from_data(json!({"method": "explode"})).unwrap_err();
        assert!(matches!(err, WidgetError::Protocol(msg) if msg.contains("explode")));
    }

    #[test]
    fn test_open_payload_nested_and_flat() {
        let nested = OpenPayload::parse(json!({
            "state": {"_model_name": "IntSliderModel", "value": 3},
            "buffer_paths": [["data"]]
        }))
        .unwrap();
        assert_eq!(nested.state["_model_name"], json!("IntSliderModel"));
        assert_eq!(nested.buffer_paths.len(), 1);

        let flat = OpenPayload::parse(json!({"_model_name": "IntSliderModel", "value": 3})).unwrap();
        assert_eq!(flat.state["value"], json!(3));
        assert!(flat.buffer_paths.is_empty());
    }

    #[test]
    fn test_protocol_version_check() {
        assert!(check_protocol_version(&json!({"version": "2.1.0"}), "2.0.0").is_ok());
        assert!(check_protocol_version(&JsonValue::Null, "2.0.0").is_ok());
        assert!(matches!(
            check_protocol_version(&json!({"version": "1.0.0"}), "2.1.0"),
            Err(WidgetError::VersionMismatch(_))
        ));
    }

    #[test]
    fn test_snapshot_buffer_base64() {
        let buffer = SnapshotBuffer::encode(vec![PathSegment::from("data")], &[0, 255, 16]);
        assert_eq!(buffer.data, "AP8Q");
        assert_eq!(buffer.decode().unwrap().as_ref(), &[0, 255, 16]);

        let hex = SnapshotBuffer {
            encoding: "hex".into(),
            ..buffer
        };
        assert!(hex.decode().is_err());
    }
}
