//! Outgoing synchronization.
//!
//! Every sync message reserves a slot that is released by the next idle
//! status from the remote side. While the number of slots in use is at the
//! throttle limit, syncs are held back in a single buffer and flushed when a
//! slot frees up.

use std::fmt;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use super::{SyncState, WidgetModel};
use crate::buffers::extract_buffers;
use crate::error::{Result, WidgetError};
use crate::protocol::WidgetMessage;
use crate::registry::SyncProtocol;
use crate::serializers::serialize_state;
use crate::value::{attributes_to_json, Attributes, Value};

/// How a sync relates to what the remote side already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    /// Only the listed attributes changed.
    Patch,
    /// The listed attributes are the full state.
    Update,
    /// Full state, sent as a `backbone` message.
    Backbone,
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMethod::Patch => write!(f, "patch"),
            SyncMethod::Update => write!(f, "update"),
            SyncMethod::Backbone => write!(f, "backbone"),
        }
    }
}

/// A sync held back by the throttle.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingBuffer {
    pub(crate) method: SyncMethod,
    pub(crate) attrs: Attributes,
}

impl WidgetModel {
    /// Send local changes made since the last push.
    ///
    /// Attributes whose value the remote side already holds are left out.
    /// Without a comm the pending changes are discarded.
    pub async fn push_changes(&self) -> Result<()> {
        let live = self.is_live();
        let reserved = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let names = std::mem::take(&mut state.diff);
            if !live || names.is_empty() {
                None
            } else {
                match self.class.sync_protocol() {
                    SyncProtocol::Backbone => {
                        let attrs = state.attributes.clone();
                        self.reserve(state, SyncMethod::Backbone, attrs)
                    }
                    SyncProtocol::Diff => {
                        let attrs: Attributes = names
                            .iter()
                            .filter_map(|name| {
                                let value = state.attributes.get(name)?;
                                (state.remote.get(name) != Some(value))
                                    .then(|| (name.clone(), value.clone()))
                            })
                            .collect();
                        self.reserve(state, SyncMethod::Patch, attrs)
                    }
                }
            }
        };

        match reserved {
            Some((method, attrs)) => self.transmit(method, attrs).await,
            None => Ok(()),
        }
    }

    /// Send the entire state, replacing whatever the remote side has.
    pub async fn push_full_state(&self) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        let reserved = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.diff.clear();
            let attrs = state.attributes.clone();
            let method = match self.class.sync_protocol() {
                SyncProtocol::Backbone => SyncMethod::Backbone,
                SyncProtocol::Diff => SyncMethod::Update,
            };
            self.reserve(state, method, attrs)
        };

        match reserved {
            Some((method, attrs)) => self.transmit(method, attrs).await,
            None => Ok(()),
        }
    }

    /// Send an application message.
    pub async fn send_custom(&self, content: JsonValue, buffers: Vec<Bytes>) -> Result<()> {
        self.send_tracked(&WidgetMessage::Custom { content }, buffers)
            .await
    }

    /// Ask the remote side to send its full state.
    pub async fn request_state(&self) -> Result<()> {
        self.send_tracked(&WidgetMessage::RequestState, Vec::new())
            .await
    }

    /// Sync messages sent and not yet acknowledged.
    pub fn pending_messages(&self) -> usize {
        self.state.lock().pending
    }

    /// Attributes held back by the throttle.
    pub fn buffered_attributes(&self) -> Option<Attributes> {
        self.state
            .lock()
            .outgoing
            .as_ref()
            .map(|buffered| buffered.attrs.clone())
    }

    /// Release a slot and flush the held back sync if one is now free.
    pub(super) async fn handle_idle(&self) -> Result<()> {
        let live = self.is_live();
        let flush = {
            let mut state = self.state.lock();
            if state.pending == 0 {
                log::warn!("Model {}: idle status with no message in flight", self.id);
            } else {
                state.pending -= 1;
            }
            if live && state.pending < self.throttle_limit(&state) {
                let flush = state.outgoing.take();
                if flush.is_some() {
                    state.pending += 1;
                }
                flush
            } else {
                None
            }
        };

        match flush {
            Some(buffered) => {
                log::debug!(
                    "Model {}: flushing {} held back attributes",
                    self.id,
                    buffered.attrs.len()
                );
                self.transmit(buffered.method, buffered.attrs).await
            }
            None => Ok(()),
        }
    }

    fn throttle_limit(&self, state: &SyncState) -> usize {
        state
            .attributes
            .get("msg_throttle")
            .and_then(Value::as_u64)
            .filter(|limit| *limit > 0)
            .map(|limit| limit as usize)
            .unwrap_or_else(|| self.config.default_msg_throttle.max(1))
    }

    /// Either take a slot for `attrs` or fold them into the held back sync.
    ///
    /// Returns what should be sent right now.
    fn reserve(
        &self,
        state: &mut SyncState,
        method: SyncMethod,
        attrs: Attributes,
    ) -> Option<(SyncMethod, Attributes)> {
        if attrs.is_empty() {
            return None;
        }

        if state.pending >= self.throttle_limit(state) {
            log::debug!(
                "Model {}: {} messages in flight, holding back {} sync",
                self.id,
                state.pending,
                method
            );
            if method == SyncMethod::Patch {
                if let Some(buffered) = state.outgoing.as_mut() {
                    buffered.attrs.extend(attrs);
                    return None;
                }
            }
            state.outgoing = Some(OutgoingBuffer { method, attrs });
            return None;
        }

        state.pending += 1;
        Some((method, attrs))
    }

    /// Send a reserved sync.
    ///
    /// The values count as held by the remote side only once the send
    /// succeeds. On failure the slot is given back and the attributes go
    /// back into the diff, so the next push retries them.
    async fn transmit(&self, method: SyncMethod, attrs: Attributes) -> Result<()> {
        let result = self.encode_and_send(method, &attrs).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &result {
            Ok(()) => {
                for (name, value) in &attrs {
                    state.remote.insert(name.clone(), value.clone());
                }
            }
            Err(err) => {
                state.pending = state.pending.saturating_sub(1);
                log::warn!("Model {}: {} sync failed: {}", self.id, method, err);
            }
        }
        // Anything that moved on while the message was out stays pending.
        for name in attrs.keys() {
            if state.attributes.get(name) != state.remote.get(name) {
                state.diff.insert(name.clone());
            }
        }
        drop(guard);

        result
    }

    async fn encode_and_send(&self, method: SyncMethod, attrs: &Attributes) -> Result<()> {
        let serialized = Value::Object(serialize_state(self.class.as_ref(), attrs)?);
        let extracted = extract_buffers(&serialized);
        let Value::Object(stripped) = &*extracted.state else {
            return Err(WidgetError::Protocol(
                "sync state is not an object".to_string(),
            ));
        };
        let state = attributes_to_json(stripped)?;
        let buffer_paths = extracted.buffer_paths;

        let message = match method {
            SyncMethod::Backbone => WidgetMessage::Backbone {
                sync_data: JsonValue::Object(state),
                buffer_paths,
            },
            SyncMethod::Patch | SyncMethod::Update => WidgetMessage::Update {
                state,
                buffer_paths,
            },
        };
        self.send_message(&message, extracted.buffers).await
    }

    async fn send_tracked(&self, message: &WidgetMessage, buffers: Vec<Bytes>) -> Result<()> {
        if !self.is_live() {
            return Err(WidgetError::Closed(self.id.clone()));
        }
        self.state.lock().pending += 1;
        let result = self.send_message(message, buffers).await;
        if result.is_err() {
            self.release_slot();
        }
        result
    }

    async fn send_message(&self, message: &WidgetMessage, buffers: Vec<Bytes>) -> Result<()> {
        let comm = self
            .comm()
            .ok_or_else(|| WidgetError::Closed(self.id.clone()))?;
        let data = message.to_data()?;
        comm.send(data, buffers).await.map_err(|err| {
            WidgetError::transport(format!("send {} for model {}", message.method(), self.id), err)
        })
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }
}
