//! Widget models.
//!
//! A [`WidgetModel`] holds the attribute state of one widget and keeps it in
//! step with its remote counterpart over a [`Comm`]. The outgoing side lives
//! in `sync` (diffing, echo suppression, throttling) and the incoming side in
//! `inbound` (an ordered per-model queue).
//!
//! Models are always handled through [`ModelHandle`]. Equality is identity.

mod inbound;
mod sync;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};

use crate::comm::Comm;
use crate::config::ManagerConfig;
use crate::error::{Result, WidgetError};
use crate::manager::WidgetManager;
use crate::registry::{ClassSpec, Syncable};
use crate::value::{Attributes, Value};
use crate::view::ViewHandle;

use inbound::Inbound;
pub use sync::SyncMethod;
use sync::OutgoingBuffer;

/// Shared handle to a model.
pub type ModelHandle = Arc<WidgetModel>;

/// A view that may still be under construction.
pub(crate) type ViewSlot = Shared<BoxFuture<'static, std::result::Result<ViewHandle, Arc<WidgetError>>>>;

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Where an attribute change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notifications published by a model.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// Attributes took new values.
    Changed {
        names: Vec<String>,
        origin: ChangeOrigin,
    },
    /// A `custom` message arrived.
    Custom {
        content: JsonValue,
        buffers: Vec<Bytes>,
    },
    /// The comm went live or was lost.
    CommLive(bool),
    /// The model was closed.
    Destroyed,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Everything needed to build a model.
pub struct ModelInit {
    pub id: String,
    pub class: Arc<dyn Syncable>,
    /// Deserialized attribute values, laid over the class defaults.
    pub state: Attributes,
    pub comm: Option<Arc<dyn Comm>>,
    pub manager: Weak<WidgetManager>,
    pub config: Arc<ManagerConfig>,
}

impl ModelInit {
    pub fn new(id: impl Into<String>, class: Arc<dyn Syncable>) -> Self {
        Self {
            id: id.into(),
            class,
            state: Attributes::new(),
            comm: None,
            manager: Weak::new(),
            config: Arc::new(ManagerConfig::default()),
        }
    }

    pub fn with_state(mut self, state: Attributes) -> Self {
        self.state = state;
        self
    }

    pub fn with_comm(mut self, comm: Arc<dyn Comm>) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn with_manager(mut self, manager: &Arc<WidgetManager>) -> Self {
        self.manager = Arc::downgrade(manager);
        self
    }

    pub fn with_config(mut self, config: Arc<ManagerConfig>) -> Self {
        self.config = config;
        self
    }
}

/// Mutable sync bookkeeping, guarded by one lock.
pub(crate) struct SyncState {
    attributes: Attributes,
    /// Locally changed attributes not yet pushed.
    diff: IndexSet<String>,
    /// Last value known to be held by the remote side, per attribute.
    remote: HashMap<String, Value>,
    /// Sync messages sent and not yet acknowledged by an idle status.
    pending: usize,
    /// Sync held back by the throttle.
    outgoing: Option<OutgoingBuffer>,
}

impl SyncState {
    fn new(attributes: Attributes) -> Self {
        let remote = attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            attributes,
            diff: IndexSet::new(),
            remote,
            pending: 0,
            outgoing: None,
        }
    }

    /// Store new values, returning the names that actually changed.
    fn apply(&mut self, attrs: Attributes) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in attrs {
            if self.attributes.get(&name) == Some(&value) {
                continue;
            }
            if self.remote.get(&name) == Some(&value) {
                self.diff.shift_remove(&name);
            } else {
                self.diff.insert(name.clone());
            }
            self.attributes.insert(name.clone(), value);
            changed.push(name);
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// WidgetModel
// ---------------------------------------------------------------------------

/// Attribute state of one widget, synchronized with the remote side.
pub struct WidgetModel {
    id: String,
    class: Arc<dyn Syncable>,
    manager: Weak<WidgetManager>,
    config: Arc<ManagerConfig>,
    comm: RwLock<Option<Arc<dyn Comm>>>,
    state: Mutex<SyncState>,
    views: Mutex<HashMap<String, ViewSlot>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    events: broadcast::Sender<ModelEvent>,
    closed: AtomicBool,
}

impl WidgetModel {
    /// Build a model and start its inbound queue.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(init: ModelInit) -> ModelHandle {
        let ModelInit {
            id,
            class,
            state,
            comm,
            manager,
            config,
        } = init;

        let mut attributes = class.defaults();
        attributes.extend(state);

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let model = Arc::new(Self {
            id,
            class,
            manager,
            config,
            comm: RwLock::new(comm.clone()),
            state: Mutex::new(SyncState::new(attributes)),
            views: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Some(tx)),
            events,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(inbound::run(Arc::downgrade(&model), rx));
        if let Some(comm) = comm {
            model.listen(&comm);
        }
        log::debug!(
            "Created model {} ({}), comm {}",
            model.id,
            model.class.model_name(),
            if model.is_live() { "live" } else { "absent" }
        );
        model
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> &Arc<dyn Syncable> {
        &self.class
    }

    pub fn name(&self) -> &str {
        self.class.model_name()
    }

    pub fn module(&self) -> &str {
        self.class.model_module()
    }

    pub fn module_version(&self) -> &str {
        self.class.model_module_version()
    }

    pub fn manager(&self) -> Option<Arc<WidgetManager>> {
        self.manager.upgrade()
    }

    pub fn comm(&self) -> Option<Arc<dyn Comm>> {
        self.comm.read().clone()
    }

    /// Whether the model has a comm to sync over.
    pub fn is_live(&self) -> bool {
        self.comm.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ModelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -- attributes ---------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Value> {
        self.state.lock().attributes.get(name).cloned()
    }

    pub fn attributes(&self) -> Attributes {
        self.state.lock().attributes.clone()
    }

    /// Set one attribute locally. The change is sent by the next
    /// [`push_changes`](Self::push_changes).
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        let mut attrs = Attributes::new();
        attrs.insert(name.into(), value.into());
        self.set_many(attrs);
    }

    pub fn set_many(&self, attrs: Attributes) {
        let changed = self.state.lock().apply(attrs);
        if !changed.is_empty() {
            self.emit(ModelEvent::Changed {
                names: changed,
                origin: ChangeOrigin::Local,
            });
        }
    }

    /// Apply state that came from the remote side.
    ///
    /// The values are recorded as known to the remote peer, so they are not
    /// echoed back, and they override the same attributes in any sync held
    /// back by the throttle.
    pub fn set_state(&self, attrs: Attributes) {
        let changed = {
            let mut state = self.state.lock();
            for (name, value) in &attrs {
                state.remote.insert(name.clone(), value.clone());
            }
            if let Some(buffered) = state.outgoing.as_mut() {
                for name in attrs.keys() {
                    buffered.attrs.shift_remove(name);
                }
                if buffered.attrs.is_empty() {
                    state.outgoing = None;
                }
            }
            state.apply(attrs)
        };
        if !changed.is_empty() {
            self.emit(ModelEvent::Changed {
                names: changed,
                origin: ChangeOrigin::Remote,
            });
        }
    }

    /// Current state, optionally without attributes still at their default.
    pub fn get_state(&self, drop_defaults: bool) -> Attributes {
        let attrs = self.attributes();
        if !drop_defaults {
            return attrs;
        }
        let defaults = self.class.defaults();
        attrs
            .into_iter()
            .filter(|(name, value)| defaults.get(name) != Some(value))
            .collect()
    }

    /// Names of attributes changed locally and not pushed yet.
    pub fn changed_attributes(&self) -> Vec<String> {
        self.state.lock().diff.iter().cloned().collect()
    }

    /// View class named by the `_view_*` attributes.
    pub fn view_spec(&self) -> Option<ClassSpec> {
        let state = self.state.lock();
        let text = |name: &str| {
            state
                .attributes
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Some(ClassSpec::new(
            text("_view_name")?,
            text("_view_module").unwrap_or_default(),
            text("_view_module_version").unwrap_or_default(),
        ))
    }

    // -- views --------------------------------------------------------------

    pub(crate) fn insert_view(&self, id: String, slot: ViewSlot) {
        self.views.lock().insert(id, slot);
    }

    pub(crate) fn discard_view(&self, id: &str) {
        self.views.lock().remove(id);
    }

    /// Detach a removed view and count it out of `_view_count`.
    pub(crate) fn forget_view(self: &Arc<Self>, id: &str) {
        let known = self.views.lock().remove(id).is_some();
        if known && !self.is_closed() {
            self.adjust_view_count(-1);
        }
    }

    /// Views that finished rendering.
    pub fn views(&self) -> Vec<ViewHandle> {
        self.views
            .lock()
            .values()
            .filter_map(|slot| match slot.peek() {
                Some(Ok(view)) => Some(view.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of views, including those still being created.
    pub fn view_count(&self) -> usize {
        self.views.lock().len()
    }

    /// Track the number of views in `_view_count`, when the model opted in
    /// by giving it a numeric value.
    pub(crate) fn adjust_view_count(self: &Arc<Self>, delta: i64) {
        let changed = {
            let mut state = self.state.lock();
            let Some(count) = state.attributes.get("_view_count").and_then(Value::as_i64) else {
                return;
            };
            let mut attrs = Attributes::new();
            attrs.insert("_view_count".into(), Value::from((count + delta).max(0)));
            state.apply(attrs)
        };
        if changed.is_empty() {
            return;
        }
        self.emit(ModelEvent::Changed {
            names: changed,
            origin: ChangeOrigin::Local,
        });

        if tokio::runtime::Handle::try_current().is_ok() {
            let model = self.clone();
            tokio::spawn(async move {
                if let Err(err) = model.push_changes().await {
                    log::warn!("Model {}: could not push _view_count: {}", model.id, err);
                }
            });
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Close the model and its comm, removing every view.
    pub async fn close(&self) -> Result<()> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, close_comm: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Closing model {}", self.id);

        let comm = self.comm.write().take();
        {
            let mut state = self.state.lock();
            state.outgoing = None;
            state.pending = 0;
            state.diff.clear();
        }
        // Queued messages still drain; nothing new is accepted.
        self.inbound.lock().take();

        let slots: Vec<ViewSlot> = self.views.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            match slot.peek() {
                Some(Ok(view)) => view.remove(),
                Some(Err(_)) => {}
                None => {
                    tokio::spawn(async move {
                        if let Ok(view) = slot.await {
                            view.remove();
                        }
                    });
                }
            }
        }

        if comm.is_some() {
            self.emit(ModelEvent::CommLive(false));
        }
        self.emit(ModelEvent::Destroyed);

        if let Some(manager) = self.manager.upgrade() {
            manager.forget_model(&self.id);
        }

        match comm {
            Some(comm) if close_comm => comm
                .close(None)
                .await
                .map_err(|err| WidgetError::transport(format!("close comm {}", self.id), err)),
            _ => Ok(()),
        }
    }

    fn listen(self: &Arc<Self>, comm: &Arc<dyn Comm>) {
        let model = Arc::downgrade(self);
        comm.on_event(Arc::new(move |event| {
            let Some(model) = model.upgrade() else {
                return;
            };
            if let Err(err) = model.enqueue(Inbound::Comm(event)) {
                log::debug!("Dropping comm event: {}", err);
            }
        }));
    }
}

impl PartialEq for WidgetModel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl fmt::Debug for WidgetModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WidgetModel")
            .field("id", &self.id)
            .field("name", &self.class.model_name())
            .field("live", &self.is_live())
            .field("closed", &self.is_closed())
            .finish()
    }
}
