//! The widget manager.
//!
//! Owns the registry of models keyed by id, builds models and views through
//! a [`ClassResolver`], and reaches the outside world through a
//! [`WidgetHost`]. Model construction is asynchronous; the registry stores a
//! [`ModelPromise`] as soon as creation starts, so concurrent lookups and
//! creations for the same id all observe the same model.

mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::buffers::inject_buffers;
use crate::comm::{Comm, CommEvent, CommMessage};
use crate::config::ManagerConfig;
use crate::error::{Result, WidgetError};
use crate::host::{CommOpen, WidgetHost};
use crate::model::{ModelHandle, ModelInit, WidgetModel};
use crate::protocol::{check_protocol_version, OpenPayload};
use crate::registry::{ClassResolver, ClassSpec};
use crate::serializers::deserialize_state;
use crate::value::{attributes_from_json, Attributes, Value};
use crate::version;
use crate::view::{ViewHandle, ViewOptions};

pub use state::StateOptions;

type SharedResult<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<WidgetError>>>>;

fn joined<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> std::result::Result<T, Arc<WidgetError>> {
    match joined {
        Ok(result) => result.map_err(Arc::new),
        Err(join) => Err(Arc::new(WidgetError::from(join))),
    }
}

/// Run `fut` on the runtime now and share its outcome.
fn spawn_shared<T, F>(fut: F) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let task = tokio::spawn(fut);
    async move { joined(task.await) }.boxed().shared()
}

/// Share the outcome of `fut`, which is spawned on the first poll.
fn spawn_on_poll<T, F>(fut: F) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    async move { joined(tokio::spawn(fut).await) }
        .boxed()
        .shared()
}

/// A model that may still be under construction.
///
/// Cloning is cheap; every clone resolves to the same model.
#[derive(Clone)]
pub struct ModelPromise {
    inner: SharedResult<ModelHandle>,
}

impl ModelPromise {
    fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<ModelHandle>> + Send + 'static,
    {
        Self {
            inner: spawn_shared(fut),
        }
    }

    /// The model, if construction already succeeded.
    pub fn resolved(&self) -> Option<ModelHandle> {
        match self.inner.peek() {
            Some(Ok(model)) => Some(model.clone()),
            _ => None,
        }
    }
}

impl Future for ModelPromise {
    type Output = Result<ModelHandle>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|result| result.map_err(WidgetError::Shared))
    }
}

/// Class identity and optional channel for a new model.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    pub model_name: String,
    pub model_module: String,
    pub model_module_version: String,
    pub model_id: Option<String>,
    pub comm: Option<Arc<dyn Comm>>,
}

impl ModelOptions {
    pub fn new(
        model_name: impl Into<String>,
        model_module: impl Into<String>,
        model_module_version: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_module: model_module.into(),
            model_module_version: model_module_version.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_comm(mut self, comm: Arc<dyn Comm>) -> Self {
        self.comm = Some(comm);
        self
    }

    fn class_spec(&self) -> ClassSpec {
        ClassSpec::new(
            &self.model_name,
            &self.model_module,
            &self.model_module_version,
        )
    }
}

/// Model options plus the view class a widget renders with.
#[derive(Debug, Clone)]
pub struct WidgetOptions {
    pub model: ModelOptions,
    pub view_name: String,
    pub view_module: String,
    pub view_module_version: String,
}

impl WidgetOptions {
    pub fn new(
        model: ModelOptions,
        view_name: impl Into<String>,
        view_module: impl Into<String>,
        view_module_version: impl Into<String>,
    ) -> Self {
        Self {
            model,
            view_name: view_name.into(),
            view_module: view_module.into(),
            view_module_version: view_module_version.into(),
        }
    }
}

type Gate = Shared<oneshot::Receiver<()>>;

// ---------------------------------------------------------------------------
// WidgetManager
// ---------------------------------------------------------------------------

/// Registry and factory for the models of one host.
pub struct WidgetManager {
    config: Arc<ManagerConfig>,
    host: Arc<dyn WidgetHost>,
    resolver: Arc<dyn ClassResolver>,
    models: DashMap<String, ModelPromise>,
}

impl WidgetManager {
    pub fn new(
        config: ManagerConfig,
        host: Arc<dyn WidgetHost>,
        resolver: Arc<dyn ClassResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            host,
            resolver,
            models: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn WidgetHost> {
        &self.host
    }

    // -- registry -----------------------------------------------------------

    /// The model registered under `model_id`, once it is built.
    pub async fn get_model(&self, model_id: &str) -> Result<ModelHandle> {
        let promise = self
            .models
            .get(model_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WidgetError::NotFound(model_id.to_string()))?;
        promise.await
    }

    pub fn has_model(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn promises(&self) -> Vec<(String, ModelPromise)> {
        let mut all: Vec<(String, ModelPromise)> = self
            .models
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub(crate) fn forget_model(&self, model_id: &str) {
        if self.models.remove(model_id).is_some() {
            log::debug!("Unregistered model {}", model_id);
        }
    }

    // -- models -------------------------------------------------------------

    /// Start building a model and register it at once.
    ///
    /// `serialized_state` is wire state with buffers already reinjected. If a
    /// model with the same id is registered or being built, its promise is
    /// returned instead. Fails immediately when neither a comm nor an id is
    /// given.
    pub fn new_model(
        self: &Arc<Self>,
        options: ModelOptions,
        serialized_state: Attributes,
    ) -> Result<ModelPromise> {
        self.register(options, serialized_state, None)
    }

    fn register(
        self: &Arc<Self>,
        options: ModelOptions,
        serialized_state: Attributes,
        gate: Option<Gate>,
    ) -> Result<ModelPromise> {
        let model_id = match (&options.model_id, &options.comm) {
            (Some(id), _) => id.clone(),
            (None, Some(comm)) => comm.comm_id().to_string(),
            (None, None) => {
                return Err(WidgetError::InvalidArgument(
                    "neither a comm nor a model id was provided".to_string(),
                ))
            }
        };

        match self.models.entry(model_id.clone()) {
            Entry::Occupied(entry) => {
                log::debug!("Model {} already registered", model_id);
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let manager = self.clone();
                let promise = ModelPromise::spawn(async move {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    manager.build_model(model_id, options, serialized_state).await
                });
                entry.insert(promise.clone());
                Ok(promise)
            }
        }
    }

    async fn build_model(
        self: Arc<Self>,
        model_id: String,
        options: ModelOptions,
        serialized_state: Attributes,
    ) -> Result<ModelHandle> {
        let built = async {
            let spec = options.class_spec();
            let class = self
                .resolver
                .resolve_model(&spec)
                .await
                .map_err(|err| match err {
                    WidgetError::ClassResolution { .. } => err,
                    other => WidgetError::ClassResolution {
                        name: spec.name.clone(),
                        module: spec.module.clone(),
                        version: spec.version.clone(),
                        source: Some(Box::new(other)),
                    },
                })?;
            let state = deserialize_state(class.as_ref(), serialized_state, Some(&self)).await?;

            let mut init = ModelInit::new(model_id.clone(), class)
                .with_state(state)
                .with_manager(&self)
                .with_config(self.config.clone());
            if let Some(comm) = options.comm {
                init = init.with_comm(comm);
            }
            Ok::<_, WidgetError>(WidgetModel::new(init))
        }
        .await;

        built.map_err(|err| {
            log::error!("Could not create model {}: {}", model_id, err);
            self.models.remove(&model_id);
            WidgetError::ModelCreation {
                model_id,
                source: Box::new(err),
            }
        })
    }

    /// Create a model together with its comm.
    ///
    /// Without a comm in `options` one is opened against the widget target,
    /// announcing the class and view identity; the full state follows as an
    /// `update` once the model exists. When the comm cannot be opened the
    /// model is created without one.
    pub async fn new_widget(
        self: &Arc<Self>,
        options: WidgetOptions,
        serialized_state: Attributes,
    ) -> Result<ModelHandle> {
        let WidgetOptions {
            model: mut model_options,
            view_name,
            view_module,
            view_module_version,
        } = options;

        let mut serialized_state = serialized_state;
        for (key, value) in [
            ("_view_name", view_name),
            ("_view_module", view_module),
            ("_view_module_version", view_module_version),
        ] {
            serialized_state
                .entry(key.to_string())
                .or_insert(Value::String(value));
        }

        if model_options.comm.is_none() {
            match self.open_widget_comm(&model_options, &serialized_state).await {
                Ok(comm) => model_options.comm = Some(comm),
                Err(err) => {
                    log::warn!("Creating widget without a comm: {}", err);
                    model_options
                        .model_id
                        .get_or_insert_with(|| Uuid::new_v4().to_string());
                }
            }
        }

        let live = model_options.comm.is_some();
        let model = self.new_model(model_options, serialized_state)?.await?;
        if live {
            model.push_full_state().await?;
        }
        Ok(model)
    }

    async fn open_widget_comm(
        &self,
        options: &ModelOptions,
        serialized_state: &Attributes,
    ) -> Result<Arc<dyn Comm>> {
        let mut identity = serde_json::Map::new();
        identity.insert("_model_name".into(), json!(options.model_name));
        identity.insert("_model_module".into(), json!(options.model_module));
        identity.insert(
            "_model_module_version".into(),
            json!(options.model_module_version),
        );
        for key in ["_view_name", "_view_module", "_view_module_version"] {
            if let Some(value) = serialized_state.get(key) {
                identity.insert(key.to_string(), value.to_json()?);
            }
        }

        let open = CommOpen::new(
            json!({"state": identity, "buffer_paths": []}),
            json!({"version": self.config.protocol_version}),
        );
        self.host
            .open_channel(
                &self.config.comm_target_name,
                options.model_id.as_deref(),
                Some(open),
            )
            .await
            .map_err(|err| WidgetError::transport("open widget comm", err))
    }

    /// Build a model for a comm opened by the remote side.
    pub async fn handle_comm_open(
        self: &Arc<Self>,
        comm: Arc<dyn Comm>,
        msg: CommMessage,
    ) -> Result<ModelHandle> {
        check_protocol_version(&msg.metadata, &self.config.protocol_version)?;
        let payload = OpenPayload::parse(msg.data)?;

        let mut value = Value::Object(attributes_from_json(payload.state));
        inject_buffers(&mut value, &payload.buffer_paths, msg.buffers)?;
        let Value::Object(state) = value else {
            return Err(WidgetError::Protocol(
                "comm open state is not an object".to_string(),
            ));
        };

        let text = |key: &str| state.get(key).and_then(Value::as_str).map(str::to_string);
        let model_name = text("_model_name").ok_or_else(|| {
            WidgetError::Protocol(format!("comm {} opened without _model_name", comm.comm_id()))
        })?;
        let options = ModelOptions {
            model_name,
            model_module: text("_model_module").unwrap_or_default(),
            model_module_version: text("_model_module_version").unwrap_or_default(),
            model_id: Some(comm.comm_id().to_string()),
            comm: Some(comm),
        };

        log::debug!(
            "Comm open for {} ({})",
            options.model_id.as_deref().unwrap_or_default(),
            options.model_name
        );
        self.new_model(options, state)?.await
    }

    // -- views --------------------------------------------------------------

    /// Create and render a view of `model`.
    ///
    /// Waits for the model's queued messages first, so the view renders the
    /// state as of the call.
    pub async fn create_view(
        self: &Arc<Self>,
        model: &ModelHandle,
        options: ViewOptions,
    ) -> Result<ViewHandle> {
        let view_id = Uuid::new_v4().to_string();
        // The slot is registered before the build starts, so a build that
        // fails right away still finds it to discard.
        let slot = spawn_on_poll(self.clone().build_view(
            model.clone(),
            view_id.clone(),
            options,
        ));
        model.insert_view(view_id, slot.clone());
        slot.await.map_err(WidgetError::Shared)
    }

    async fn build_view(
        self: Arc<Self>,
        model: ModelHandle,
        view_id: String,
        options: ViewOptions,
    ) -> Result<ViewHandle> {
        let built = async {
            model.state_change().await?;
            let spec = model.view_spec().ok_or_else(|| {
                WidgetError::InvalidArgument(format!("model {} has no view class", model.id()))
            })?;
            let class = self.resolver.resolve_view(&spec).await?;
            let view = class
                .create(model.clone(), &options)
                .map_err(|source| WidgetError::View {
                    context: format!("create {}", spec),
                    source,
                })?;
            view.render().await.map_err(|source| WidgetError::View {
                context: format!("render {}", spec),
                source,
            })?;
            Ok::<_, WidgetError>(ViewHandle::new(view_id.clone(), view, &model, options))
        }
        .await;

        match built {
            Ok(view) => {
                model.adjust_view_count(1);
                Ok(view)
            }
            Err(err) => {
                log::error!("Could not create a view for model {}: {}", model.id(), err);
                model.discard_view(&view_id);
                Err(WidgetError::ViewCreation {
                    model_id: model.id().to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Create a root view of `model` and hand it to the host.
    pub async fn display_model(
        self: &Arc<Self>,
        msg: Option<&CommMessage>,
        model: &ModelHandle,
        options: ViewOptions,
    ) -> Result<ViewHandle> {
        let options = ViewOptions {
            root: true,
            ..options
        };
        let displayed = async {
            let view = self.create_view(model, options.clone()).await?;
            if let Err(err) = self.host.display_view(msg, &view, &options).await {
                view.remove();
                return Err(WidgetError::transport("display view", err));
            }
            Ok::<_, WidgetError>(view)
        }
        .await;

        displayed.map_err(|err| WidgetError::Display {
            model_id: model.id().to_string(),
            source: Box::new(err),
        })
    }

    // -- version handshake --------------------------------------------------

    /// Ask the remote side which front end version it needs and answer
    /// whether ours satisfies it.
    ///
    /// Fails with [`WidgetError::Timeout`] if no requirement arrives within
    /// the configured window.
    pub async fn validate_version(&self) -> Result<bool> {
        let comm = self
            .host
            .open_channel(
                &self.config.version_target_name,
                None,
                Some(CommOpen::default()),
            )
            .await
            .map_err(|err| WidgetError::transport("open version comm", err))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let reply_tx = Mutex::new(Some(reply_tx));
        comm.on_event(Arc::new(move |event| {
            if let CommEvent::Message(msg) = event {
                if let Some(tx) = reply_tx.lock().take() {
                    let _ = tx.send(msg);
                }
            }
        }));

        let window = self.config.version_timeout_ms;
        let msg = match tokio::time::timeout(Duration::from_millis(window), reply_rx).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(_)) => return Err(WidgetError::Closed(comm.comm_id().to_string())),
            Err(_) => {
                log::warn!("No widget version requirement received in {}ms", window);
                return Err(WidgetError::Timeout(window));
            }
        };

        let requirement = msg
            .data
            .get("version")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WidgetError::Protocol("version reply without version".to_string()))?;
        let validated = version::satisfies(&self.config.frontend_version, requirement)?;
        if !validated {
            log::warn!(
                "Widget front end {} does not satisfy the required {}",
                self.config.frontend_version,
                requirement
            );
        }

        comm.send(json!({"validated": validated}), Vec::new())
            .await
            .map_err(|err| WidgetError::transport("answer version check", err))?;
        Ok(validated)
    }
}

impl std::fmt::Debug for WidgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetManager")
            .field("config", &self.config)
            .field("models", &self.model_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests;
