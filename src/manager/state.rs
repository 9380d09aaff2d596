//! Capturing and restoring the state of every model.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::oneshot;

use super::{ModelOptions, ModelPromise, WidgetManager};
use crate::buffers::{extract_buffers, inject_buffers, BufferPath};
use crate::error::{Result, WidgetError};
use crate::model::{ModelHandle, WidgetModel};
use crate::protocol::{ManagerState, ModelSnapshot, SnapshotBuffer};
use crate::serializers::{deserialize_state, serialize_state};
use crate::value::{attributes_from_json, attributes_to_json, Attributes, Value};
use crate::view::ViewOptions;

/// Which models [`WidgetManager::get_state`] captures, and how.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateOptions {
    /// Leave out attributes still at their class default.
    pub drop_defaults: bool,
    /// Only models with at least one view.
    pub only_displayed: bool,
    /// Only models without a live comm.
    pub not_live: bool,
}

enum Restore {
    Existing(ModelPromise, Attributes),
    New(ModelOptions, Attributes),
}

impl WidgetManager {
    /// Snapshot every model that finished building and passes the filters.
    ///
    /// Models whose construction failed are skipped.
    pub async fn get_state(&self, options: StateOptions) -> Result<ManagerState> {
        let mut snapshot = ManagerState::default();
        for (model_id, promise) in self.promises() {
            let model = match promise.await {
                Ok(model) => model,
                Err(err) => {
                    log::debug!("Leaving model {} out of the snapshot: {}", model_id, err);
                    continue;
                }
            };
            if options.only_displayed && model.view_count() == 0 {
                continue;
            }
            if options.not_live && model.is_live() {
                continue;
            }
            snapshot
                .state
                .insert(model_id, snapshot_model(&model, options.drop_defaults)?);
        }
        Ok(snapshot)
    }

    /// Restore a snapshot.
    ///
    /// Registered models are updated in place. Other models are rebuilt, on
    /// their old comm if the host still reports it live and without a comm
    /// otherwise. Every recorded view is then displayed again, with
    /// `display_options` laid over its recorded options.
    pub async fn set_state(
        self: &Arc<Self>,
        state: &ManagerState,
        display_options: Option<&ViewOptions>,
    ) -> Result<Vec<ModelHandle>> {
        if state.version_major != 2 {
            return Err(WidgetError::VersionMismatch(format!(
                "snapshot format {}.{} is not supported",
                state.version_major, state.version_minor
            )));
        }

        let live = self
            .host
            .list_live_channels()
            .await
            .map_err(|err| WidgetError::transport("list live comms", err))?;
        let target = self.config.comm_target_name.clone();

        let mut restores = Vec::with_capacity(state.state.len());
        for (model_id, snap) in &state.state {
            let attrs = decode_snapshot(snap)?;
            if let Some(existing) = self.models.get(model_id).map(|e| e.value().clone()) {
                restores.push(Restore::Existing(existing, attrs));
                continue;
            }

            let mut options = ModelOptions::new(
                &snap.model_name,
                &snap.model_module,
                &snap.model_module_version,
            )
            .with_id(model_id);
            if live.get(model_id) == Some(&target) {
                let comm = self
                    .host
                    .open_channel(&target, Some(model_id), None)
                    .await
                    .map_err(|err| {
                        WidgetError::transport(format!("reattach comm {}", model_id), err)
                    })?;
                options.comm = Some(comm);
            }
            restores.push(Restore::New(options, attrs));
        }

        // Hold every build until all ids are registered, so references
        // between restored models resolve.
        let (release, gate) = oneshot::channel::<()>();
        let gate = gate.shared();
        let mut promises = Vec::with_capacity(restores.len());
        for restore in restores {
            promises.push(match restore {
                Restore::Existing(promise, attrs) => (promise, Some(attrs)),
                Restore::New(options, attrs) => {
                    (self.register(options, attrs, Some(gate.clone()))?, None)
                }
            });
        }
        let _ = release.send(());

        let mut models = Vec::with_capacity(promises.len());
        for ((promise, update), snap) in promises.into_iter().zip(state.state.values()) {
            let model = promise.await?;
            if let Some(attrs) = update {
                let attrs = deserialize_state(model.class().as_ref(), attrs, Some(self)).await?;
                model.set_state(attrs);
            }
            models.push((model, snap));
        }

        for (model, snap) in &models {
            for recorded in &snap.views {
                let options = match display_options {
                    Some(overlay) => recorded.clone().merged(overlay),
                    None => recorded.clone(),
                };
                self.display_model(None, model, options).await?;
            }
        }

        log::debug!("Restored {} models", models.len());
        Ok(models.into_iter().map(|(model, _)| model).collect())
    }

    /// Close every model, or only those without a comm, and unregister them.
    ///
    /// Keeps going past failures and reports the first one.
    pub async fn clear_state(&self, commless_only: bool) -> Result<()> {
        let mut first_error = None;
        for (model_id, promise) in self.promises() {
            match promise.await {
                Ok(model) => {
                    if commless_only && model.is_live() {
                        continue;
                    }
                    if let Err(err) = model.close().await {
                        log::warn!("Could not close model {}: {}", model_id, err);
                        first_error.get_or_insert(err);
                    }
                    self.forget_model(&model_id);
                }
                Err(_) => self.forget_model(&model_id),
            }
        }
        if !commless_only {
            self.models.clear();
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn snapshot_model(model: &WidgetModel, drop_defaults: bool) -> Result<ModelSnapshot> {
    let serialized = Value::Object(serialize_state(
        model.class().as_ref(),
        &model.get_state(drop_defaults),
    )?);
    let extracted = extract_buffers(&serialized);
    let Value::Object(stripped) = &*extracted.state else {
        return Err(WidgetError::Protocol(format!(
            "state of model {} is not an object",
            model.id()
        )));
    };

    Ok(ModelSnapshot {
        model_name: model.name().to_string(),
        model_module: model.module().to_string(),
        model_module_version: model.module_version().to_string(),
        state: attributes_to_json(stripped)?,
        buffers: extracted
            .buffer_paths
            .into_iter()
            .zip(&extracted.buffers)
            .map(|(path, buffer)| SnapshotBuffer::encode(path, buffer))
            .collect(),
        views: model
            .views()
            .into_iter()
            .filter(|view| view.options().root)
            .map(|view| view.options().clone())
            .collect(),
    })
}

fn decode_snapshot(snap: &ModelSnapshot) -> Result<Attributes> {
    let mut paths: Vec<BufferPath> = Vec::with_capacity(snap.buffers.len());
    let mut buffers: Vec<Bytes> = Vec::with_capacity(snap.buffers.len());
    for buffer in &snap.buffers {
        paths.push(buffer.path.clone());
        buffers.push(buffer.decode()?);
    }

    let mut value = Value::Object(attributes_from_json(snap.state.clone()));
    inject_buffers(&mut value, &paths, buffers)?;
    match value {
        Value::Object(attrs) => Ok(attrs),
        _ => Err(WidgetError::Protocol(
            "snapshot state is not an object".to_string(),
        )),
    }
}
