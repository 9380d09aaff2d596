//! What the manager needs from its environment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::comm::{Comm, CommMessage};
use crate::view::{ViewHandle, ViewOptions};

/// Payload of a locally initiated comm-open.
#[derive(Debug, Clone, Default)]
pub struct CommOpen {
    pub data: JsonValue,
    pub metadata: JsonValue,
    pub buffers: Vec<Bytes>,
}

impl CommOpen {
    pub fn new(data: JsonValue, metadata: JsonValue) -> Self {
        Self {
            data,
            metadata,
            buffers: Vec::new(),
        }
    }
}

/// The environment a [`WidgetManager`](crate::manager::WidgetManager) runs in.
#[async_trait]
pub trait WidgetHost: Send + Sync {
    /// Put a root view on screen. `msg` is the `display` message that asked
    /// for it, when there was one.
    async fn display_view(
        &self,
        msg: Option<&CommMessage>,
        view: &ViewHandle,
        options: &ViewOptions,
    ) -> anyhow::Result<()>;

    /// Open a comm against `target_name`.
    ///
    /// With `model_id` set the comm reattaches to an existing remote comm of
    /// that id. `open` is sent as the comm-open payload; reattaching sends
    /// none.
    async fn open_channel(
        &self,
        target_name: &str,
        model_id: Option<&str>,
        open: Option<CommOpen>,
    ) -> anyhow::Result<Arc<dyn Comm>>;

    /// Comms the remote side currently holds open, as comm id to target name.
    async fn list_live_channels(&self) -> anyhow::Result<HashMap<String, String>>;
}
