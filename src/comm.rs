//! The channel abstraction between a local model and its remote counterpart.
//!
//! A [`Comm`] is supplied by the host environment. The engine only consumes
//! it: it sends JSON payloads with out-of-band buffers, closes it, and
//! registers one handler that receives everything the remote side says.
//!
//! Kernel status is reported per sent message: after the remote peer has
//! finished processing a message it emits [`KernelStatus::Idle`]. The
//! throttle in [`WidgetModel`](crate::model::WidgetModel) depends on that.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;

// ---------------------------------------------------------------------------
// KernelStatus
// ---------------------------------------------------------------------------

/// Execution state reported by the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStatus {
    Busy,
    Idle,
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Idle => write!(f, "idle"),
        }
    }
}

impl KernelStatus {
    /// Parse the `execution_state` string of a status message.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "busy" => Some(KernelStatus::Busy),
            "idle" => Some(KernelStatus::Idle),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A message received on a comm.
#[derive(Debug, Clone, Default)]
pub struct CommMessage {
    /// The `data` field of the comm message.
    pub data: JsonValue,
    /// Binary buffers that travelled beside `data`.
    pub buffers: Vec<Bytes>,
    /// Message metadata, `Null` when absent.
    pub metadata: JsonValue,
}

impl CommMessage {
    pub fn new(data: JsonValue) -> Self {
        Self {
            data,
            buffers: Vec::new(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }
}

/// Everything a comm can deliver to its local owner.
#[derive(Debug, Clone)]
pub enum CommEvent {
    Message(CommMessage),
    Status(KernelStatus),
    /// The remote side closed the comm.
    Closed(Option<JsonValue>),
}

/// Callback registered with [`Comm::on_event`].
pub type CommHandler = Arc<dyn Fn(CommEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Comm
// ---------------------------------------------------------------------------

/// A bidirectional channel to the remote peer.
#[async_trait]
pub trait Comm: Send + Sync {
    /// Identifier of the comm. Doubles as the model id.
    fn comm_id(&self) -> &str;

    /// Target the comm was opened against.
    fn target_name(&self) -> &str;

    /// Send a payload with out-of-band buffers.
    async fn send(&self, data: JsonValue, buffers: Vec<Bytes>) -> Result<(), anyhow::Error>;

    /// Close the comm from the local side.
    ///
    /// Closing an already closed comm should be a no-op.
    async fn close(&self, data: Option<JsonValue>) -> Result<(), anyhow::Error>;

    /// Register the handler for incoming events, replacing any previous one.
    fn on_event(&self, handler: CommHandler);
}

impl fmt::Debug for dyn Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comm")
            .field("comm_id", &self.comm_id())
            .field("target_name", &self.target_name())
            .finish()
    }
}
