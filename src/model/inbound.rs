//! Incoming messages.
//!
//! Everything the comm delivers goes through one unbounded queue per model
//! and is handled strictly in arrival order by a background task. Anything
//! that must observe the effect of earlier messages (view creation, for one)
//! waits on [`WidgetModel::state_change`], which queues a barrier behind them.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::{mpsc, oneshot};

use super::{ModelEvent, WidgetModel};
use crate::buffers::{inject_buffers, BufferPath};
use crate::comm::{CommEvent, CommMessage, KernelStatus};
use crate::error::{Result, WidgetError};
use crate::protocol::WidgetMessage;
use crate::serializers::deserialize_state;
use crate::value::{attributes_from_json, Value};
use crate::view::ViewOptions;

pub(crate) enum Inbound {
    Comm(CommEvent),
    Barrier(oneshot::Sender<()>),
}

/// Drain the queue until every sender is gone.
pub(super) async fn run(model: Weak<WidgetModel>, mut queue: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = queue.recv().await {
        let Some(model) = model.upgrade() else {
            break;
        };
        match item {
            Inbound::Barrier(done) => {
                let _ = done.send(());
            }
            Inbound::Comm(event) => {
                if let Err(err) = model.handle_comm_event(event).await {
                    log::error!("Model {}: failed to handle message: {}", model.id, err);
                }
            }
        }
    }
}

impl WidgetModel {
    pub(super) fn enqueue(&self, item: Inbound) -> Result<()> {
        let queue = self.inbound.lock();
        let sender = queue
            .as_ref()
            .ok_or_else(|| WidgetError::Closed(self.id.clone()))?;
        sender
            .send(item)
            .map_err(|_| WidgetError::Closed(self.id.clone()))
    }

    /// Resolves once every message received so far has been handled.
    pub async fn state_change(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.enqueue(Inbound::Barrier(done))?;
        wait.await.map_err(|_| WidgetError::Closed(self.id.clone()))
    }

    async fn handle_comm_event(self: &Arc<Self>, event: CommEvent) -> Result<()> {
        match event {
            CommEvent::Message(msg) => self.handle_message(msg).await,
            CommEvent::Status(KernelStatus::Idle) => self.handle_idle().await,
            CommEvent::Status(KernelStatus::Busy) => Ok(()),
            CommEvent::Closed(_) => {
                log::debug!("Model {}: comm closed by the remote side", self.id);
                self.shutdown(false).await
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: CommMessage) -> Result<()> {
        match WidgetMessage::from_data(msg.data.clone())? {
            WidgetMessage::Update {
                state,
                buffer_paths,
            } => self.apply_remote(state, &buffer_paths, msg.buffers).await,
            WidgetMessage::Backbone {
                sync_data,
                buffer_paths,
            } => match sync_data {
                JsonValue::Object(state) => {
                    self.apply_remote(state, &buffer_paths, msg.buffers).await
                }
                _ => Err(WidgetError::Protocol(
                    "backbone sync_data is not an object".to_string(),
                )),
            },
            WidgetMessage::Custom { content } => {
                self.emit(ModelEvent::Custom {
                    content,
                    buffers: msg.buffers,
                });
                Ok(())
            }
            WidgetMessage::Display => {
                self.spawn_display(msg);
                Ok(())
            }
            WidgetMessage::RequestState => self.push_full_state().await,
        }
    }

    async fn apply_remote(
        &self,
        state: JsonMap<String, JsonValue>,
        buffer_paths: &[BufferPath],
        buffers: Vec<Bytes>,
    ) -> Result<()> {
        let mut value = Value::Object(attributes_from_json(state));
        inject_buffers(&mut value, buffer_paths, buffers)?;
        let Value::Object(attrs) = value else {
            return Err(WidgetError::Protocol(
                "update state is not an object".to_string(),
            ));
        };

        let manager = self.manager.upgrade();
        let attrs = deserialize_state(self.class.as_ref(), attrs, manager.as_ref()).await?;
        self.set_state(attrs);
        Ok(())
    }

    /// Display in the background; the view waits on this very queue.
    fn spawn_display(self: &Arc<Self>, msg: CommMessage) {
        if self.config.display_with_output {
            log::debug!("Model {}: display left to the output area", self.id);
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            log::warn!("Model {}: display requested without a manager", self.id);
            return;
        };
        let model = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager
                .display_model(Some(&msg), &model, ViewOptions::default())
                .await
            {
                log::error!("Model {}: display failed: {}", model.id, err);
            }
        });
    }
}
