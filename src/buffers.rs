//! Buffer codec.
//!
//! The transport only carries JSON, with binary payloads travelling beside
//! the message. [`extract_buffers`] pulls every binary blob out of a nested
//! value and remembers where it came from; [`inject_buffers`] puts them back.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WidgetError};
use crate::value::{Attributes, Value};

/// One step of a buffer path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Key(k) => write!(f, "{}", k),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

impl From<&str> for PathSegment {
    fn from(k: &str) -> Self {
        PathSegment::Key(k.to_string())
    }
}

/// Sequence of keys and indices locating a buffer inside a structure.
pub type BufferPath = Vec<PathSegment>;

fn describe(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path.iter().map(|s| s.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Result of [`extract_buffers`].
#[derive(Debug, Clone)]
pub struct ExtractedBuffers<'a> {
    /// The structure with every blob removed. Borrowed when nothing had to
    /// be removed.
    pub state: Cow<'a, Value>,
    pub buffer_paths: Vec<BufferPath>,
    pub buffers: Vec<Bytes>,
}

/// Remove every binary blob from `value`.
///
/// Blobs inside arrays are replaced with `Null`; blobs stored under an
/// object key are removed along with the key. Containers are only copied
/// when something inside them changed.
pub fn extract_buffers(value: &Value) -> ExtractedBuffers<'_> {
    let mut buffer_paths = Vec::new();
    let mut buffers = Vec::new();
    let mut path = Vec::new();

    let state = match strip(value, &mut path, &mut buffer_paths, &mut buffers) {
        Some(stripped) => Cow::Owned(stripped),
        None => Cow::Borrowed(value),
    };

    ExtractedBuffers {
        state,
        buffer_paths,
        buffers,
    }
}

/// Returns the replacement for `value` if anything below it was a blob.
fn strip(
    value: &Value,
    path: &mut BufferPath,
    paths: &mut Vec<BufferPath>,
    buffers: &mut Vec<Bytes>,
) -> Option<Value> {
    match value {
        Value::Bytes(blob) => {
            paths.push(path.clone());
            buffers.push(blob.clone());
            Some(Value::Null)
        }
        Value::Array(items) => {
            let mut out: Option<Vec<Value>> = None;
            for (i, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                let replaced = strip(item, path, paths, buffers);
                path.pop();

                if let Some(new_item) = replaced {
                    let out = out.get_or_insert_with(|| items.clone());
                    out[i] = new_item;
                }
            }
            out.map(Value::Array)
        }
        Value::Object(map) => {
            let mut out: Option<Attributes> = None;
            for (key, item) in map {
                path.push(PathSegment::Key(key.clone()));
                let replaced = strip(item, path, paths, buffers);
                path.pop();

                if let Some(new_item) = replaced {
                    let out = out.get_or_insert_with(|| map.clone());
                    if matches!(item, Value::Bytes(_)) {
                        out.shift_remove(key);
                    } else {
                        out.insert(key.clone(), new_item);
                    }
                }
            }
            out.map(Value::Object)
        }
        _ => None,
    }
}

/// Put `buffers` back into `value` at `buffer_paths`, in place.
///
/// Intermediate path segments must exist. The final segment may name a
/// missing object key, or the index one past the end of an array.
pub fn inject_buffers(
    value: &mut Value,
    buffer_paths: &[BufferPath],
    buffers: Vec<Bytes>,
) -> Result<()> {
    if buffer_paths.len() != buffers.len() {
        return Err(WidgetError::InvalidBufferPath {
            path: String::new(),
            reason: format!(
                "{} paths for {} buffers",
                buffer_paths.len(),
                buffers.len()
            ),
        });
    }

    for (path, buffer) in buffer_paths.iter().zip(buffers) {
        let Some((last, parents)) = path.split_last() else {
            *value = Value::Bytes(buffer);
            continue;
        };

        let mut target = &mut *value;
        for segment in parents {
            target = step(target, segment, path)?;
        }
        assign(target, last, buffer, path)?;
    }

    Ok(())
}

fn invalid(path: &[PathSegment], reason: impl Into<String>) -> WidgetError {
    WidgetError::InvalidBufferPath {
        path: describe(path),
        reason: reason.into(),
    }
}

fn array_index(segment: &PathSegment) -> Option<usize> {
    match segment {
        PathSegment::Index(i) => Some(*i),
        PathSegment::Key(k) => k.parse().ok(),
    }
}

fn object_key(segment: &PathSegment) -> String {
    segment.to_string()
}

fn step<'v>(
    target: &'v mut Value,
    segment: &PathSegment,
    path: &[PathSegment],
) -> Result<&'v mut Value> {
    match target {
        Value::Object(map) => {
            let key = object_key(segment);
            map.get_mut(&key)
                .ok_or_else(|| invalid(path, format!("missing key {:?}", key)))
        }
        Value::Array(items) => {
            let len = items.len();
            let index = array_index(segment)
                .ok_or_else(|| invalid(path, format!("{:?} is not an array index", segment)))?;
            items
                .get_mut(index)
                .ok_or_else(|| invalid(path, format!("index {} out of bounds ({})", index, len)))
        }
        _ => Err(invalid(path, format!("cannot descend into {:?}", segment))),
    }
}

fn assign(target: &mut Value, segment: &PathSegment, buffer: Bytes, path: &[PathSegment]) -> Result<()> {
    match target {
        Value::Object(map) => {
            map.insert(object_key(segment), Value::Bytes(buffer));
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(segment)
                .ok_or_else(|| invalid(path, format!("{:?} is not an array index", segment)))?;
            if index < items.len() {
                items[index] = Value::Bytes(buffer);
            } else if index == items.len() {
                items.push(Value::Bytes(buffer));
            } else {
                return Err(invalid(path, format!("index {} out of bounds", index)));
            }
            Ok(())
        }
        _ => Err(invalid(path, "parent is not a container")),
    }
}
