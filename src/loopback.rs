//! In-memory host whose comms talk to a scripted kernel.
//!
//! [`LoopbackHost`] implements [`WidgetHost`] and records everything the
//! engine sends. The `kernel_*` methods play the remote side: they open
//! comms, deliver messages and idle statuses, and close comms. Used by the
//! test suite and the `widget-loopback` demo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::comm::{Comm, CommEvent, CommHandler, CommMessage, KernelStatus};
use crate::host::{CommOpen, WidgetHost};
use crate::view::{ViewHandle, ViewOptions};

/// What a recorded outgoing message was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Open,
    Message,
    Close,
}

/// A message the engine sent to the kernel.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub comm_id: String,
    pub target_name: String,
    pub kind: SentKind,
    pub data: JsonValue,
    pub metadata: JsonValue,
    pub buffers: Vec<Bytes>,
}

/// A root view handed to the host for display.
#[derive(Debug, Clone)]
pub struct DisplayRecord {
    pub model_id: String,
    pub view_id: String,
    pub options: ViewOptions,
}

#[derive(Default)]
struct HostState {
    comms: Mutex<HashMap<String, Arc<LoopbackComm>>>,
    /// Comms the kernel reports as open, comm id to target.
    kernel_comms: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<SentMessage>>,
    displayed: Mutex<Vec<DisplayRecord>>,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    fail_display: AtomicBool,
    auto_idle: AtomicBool,
}

impl HostState {
    fn record(&self, message: SentMessage) {
        log::trace!("loopback <- {:?} on {}", message.kind, message.comm_id);
        self.sent.lock().push(message);
    }
}

// ---------------------------------------------------------------------------
// LoopbackComm
// ---------------------------------------------------------------------------

/// One end of an in-memory comm.
pub struct LoopbackComm {
    id: String,
    target: String,
    host: Weak<HostState>,
    handler: Mutex<Option<CommHandler>>,
    /// Events that arrived before a handler was registered.
    backlog: Mutex<Vec<CommEvent>>,
    closed: AtomicBool,
}

impl LoopbackComm {
    fn new(id: String, target: String, host: &Arc<HostState>) -> Arc<Self> {
        Arc::new(Self {
            id,
            target,
            host: Arc::downgrade(host),
            handler: Mutex::new(None),
            backlog: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Hand an event to the local owner.
    pub fn deliver(&self, event: CommEvent) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(event),
            None => self.backlog.lock().push(event),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Comm for LoopbackComm {
    fn comm_id(&self) -> &str {
        &self.id
    }

    fn target_name(&self) -> &str {
        &self.target
    }

    async fn send(&self, data: JsonValue, buffers: Vec<Bytes>) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            bail!("comm {} is closed", self.id);
        }
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| anyhow!("loopback host is gone"))?;
        if host.fail_send.load(Ordering::SeqCst) {
            bail!("kernel unreachable");
        }

        host.record(SentMessage {
            comm_id: self.id.clone(),
            target_name: self.target.clone(),
            kind: SentKind::Message,
            data,
            metadata: JsonValue::Null,
            buffers,
        });
        if host.auto_idle.load(Ordering::SeqCst) {
            self.deliver(CommEvent::Status(KernelStatus::Idle));
        }
        Ok(())
    }

    async fn close(&self, data: Option<JsonValue>) -> Result<(), anyhow::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(host) = self.host.upgrade() {
            host.kernel_comms.lock().remove(&self.id);
            host.record(SentMessage {
                comm_id: self.id.clone(),
                target_name: self.target.clone(),
                kind: SentKind::Close,
                data: data.unwrap_or(JsonValue::Null),
                metadata: JsonValue::Null,
                buffers: Vec::new(),
            });
        }
        Ok(())
    }

    fn on_event(&self, handler: CommHandler) {
        *self.handler.lock() = Some(handler.clone());
        let backlog = std::mem::take(&mut *self.backlog.lock());
        for event in backlog {
            handler(event);
        }
    }
}

// ---------------------------------------------------------------------------
// LoopbackHost
// ---------------------------------------------------------------------------

/// A [`WidgetHost`] backed by an in-memory kernel.
#[derive(Clone, Default)]
pub struct LoopbackHost {
    state: Arc<HostState>,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge every sent message with an idle status right away.
    pub fn set_auto_idle(&self, enabled: bool) {
        self.state.auto_idle.store(enabled, Ordering::SeqCst);
    }

    /// Make `open_channel` fail, as when the kernel has no such target.
    pub fn set_fail_open(&self, enabled: bool) {
        self.state.fail_open.store(enabled, Ordering::SeqCst);
    }

    /// Make every comm send fail.
    pub fn set_fail_send(&self, enabled: bool) {
        self.state.fail_send.store(enabled, Ordering::SeqCst);
    }

    /// Make `display_view` fail, as when the output area is gone.
    pub fn set_fail_display(&self, enabled: bool) {
        self.state.fail_display.store(enabled, Ordering::SeqCst);
    }

    pub fn comm(&self, comm_id: &str) -> Option<Arc<LoopbackComm>> {
        self.state.comms.lock().get(comm_id).cloned()
    }

    // -- kernel side --------------------------------------------------------

    /// Open a comm from the kernel.
    pub fn kernel_open(&self, target_name: &str, comm_id: &str) -> Arc<LoopbackComm> {
        let comm = LoopbackComm::new(comm_id.to_string(), target_name.to_string(), &self.state);
        self.state
            .comms
            .lock()
            .insert(comm_id.to_string(), comm.clone());
        self.state
            .kernel_comms
            .lock()
            .insert(comm_id.to_string(), target_name.to_string());
        comm
    }

    /// Pretend the kernel holds a comm that has no local end yet.
    pub fn kernel_register(&self, target_name: &str, comm_id: &str) {
        self.state
            .kernel_comms
            .lock()
            .insert(comm_id.to_string(), target_name.to_string());
    }

    /// Deliver a message from the kernel.
    pub fn kernel_send(&self, comm_id: &str, data: JsonValue, buffers: Vec<Bytes>) {
        match self.comm(comm_id) {
            Some(comm) => comm.deliver(CommEvent::Message(
                CommMessage::new(data).with_buffers(buffers),
            )),
            None => log::warn!("loopback: no comm {}", comm_id),
        }
    }

    /// Report the kernel idle on `comm_id`.
    pub fn kernel_idle(&self, comm_id: &str) {
        if let Some(comm) = self.comm(comm_id) {
            comm.deliver(CommEvent::Status(KernelStatus::Idle));
        }
    }

    /// Close a comm from the kernel.
    pub fn kernel_close(&self, comm_id: &str) {
        self.state.kernel_comms.lock().remove(comm_id);
        if let Some(comm) = self.comm(comm_id) {
            comm.closed.store(true, Ordering::SeqCst);
            comm.deliver(CommEvent::Closed(None));
        }
    }

    // -- inspection ---------------------------------------------------------

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().clone()
    }

    /// `data` of every message sent on `comm_id`, in order.
    pub fn messages_to(&self, comm_id: &str) -> Vec<JsonValue> {
        self.state
            .sent
            .lock()
            .iter()
            .filter(|m| m.comm_id == comm_id && m.kind == SentKind::Message)
            .map(|m| m.data.clone())
            .collect()
    }

    pub fn opened(&self) -> Vec<SentMessage> {
        self.state
            .sent
            .lock()
            .iter()
            .filter(|m| m.kind == SentKind::Open)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.sent.lock().clear();
    }

    pub fn displayed(&self) -> Vec<DisplayRecord> {
        self.state.displayed.lock().clone()
    }
}

#[async_trait]
impl WidgetHost for LoopbackHost {
    async fn display_view(
        &self,
        _msg: Option<&CommMessage>,
        view: &ViewHandle,
        options: &ViewOptions,
    ) -> anyhow::Result<()> {
        if self.state.fail_display.load(Ordering::SeqCst) {
            bail!("no output area for view {}", view.id());
        }
        let model_id = view
            .model()
            .map(|m| m.id().to_string())
            .ok_or_else(|| anyhow!("view {} has no model", view.id()))?;
        self.state.displayed.lock().push(DisplayRecord {
            model_id,
            view_id: view.id().to_string(),
            options: options.clone(),
        });
        Ok(())
    }

    async fn open_channel(
        &self,
        target_name: &str,
        model_id: Option<&str>,
        open: Option<CommOpen>,
    ) -> anyhow::Result<Arc<dyn Comm>> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            bail!("no comm target {:?} in the kernel", target_name);
        }
        let comm_id = model_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let comm = self.kernel_open(target_name, &comm_id);

        if let Some(open) = open {
            self.state.record(SentMessage {
                comm_id,
                target_name: target_name.to_string(),
                kind: SentKind::Open,
                data: open.data,
                metadata: open.metadata,
                buffers: open.buffers,
            });
        }
        Ok(comm)
    }

    async fn list_live_channels(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.state.kernel_comms.lock().clone())
    }
}
