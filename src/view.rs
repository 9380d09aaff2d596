//! Views: renderings of a model.
//!
//! What a view draws is the host's business. The engine only needs to
//! render it once and remove it later, and to know which model it belongs
//! to and which display options created it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::model::{ModelHandle, WidgetModel};

/// Options a view was created with.
///
/// `root` marks views displayed at the top level, as opposed to views
/// embedded in a container. Anything else the host cares about rides in
/// `extra` and is kept in manager snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root: bool,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl ViewOptions {
    pub fn root() -> Self {
        Self {
            root: true,
            extra: JsonMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Overlay `other` on top of these options.
    pub fn merged(mut self, other: &ViewOptions) -> Self {
        self.root |= other.root;
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
        self
    }
}

/// A host-provided view implementation.
#[async_trait]
pub trait Renderable: Send + Sync {
    /// Draw the view. Called once, after the model's queued updates have
    /// been applied.
    async fn render(&self) -> anyhow::Result<()>;

    /// Tear the view down.
    fn remove(&self);
}

/// A rendered view attached to a model.
#[derive(Clone)]
pub struct ViewHandle {
    id: String,
    view: Arc<dyn Renderable>,
    model: Weak<WidgetModel>,
    options: ViewOptions,
    removed: Arc<AtomicBool>,
}

impl ViewHandle {
    pub(crate) fn new(
        id: String,
        view: Arc<dyn Renderable>,
        model: &ModelHandle,
        options: ViewOptions,
    ) -> Self {
        Self {
            id,
            view,
            model: Arc::downgrade(model),
            options,
            removed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view(&self) -> &Arc<dyn Renderable> {
        &self.view
    }

    pub fn options(&self) -> &ViewOptions {
        &self.options
    }

    /// The model, unless it has already been dropped.
    pub fn model(&self) -> Option<ModelHandle> {
        self.model.upgrade()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Remove the view and detach it from its model. Idempotent.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.view.remove();
        if let Some(model) = self.model.upgrade() {
            model.forget_view(&self.id);
        }
    }
}

impl PartialEq for ViewHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.removed, &other.removed)
    }
}

impl fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewHandle")
            .field("id", &self.id)
            .field("model", &self.model.upgrade().map(|m| m.id().to_string()))
            .field("options", &self.options)
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_view_options_flatten() {
        let options = ViewOptions::root().with("cell_index", 3);
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json, json!({"root": true, "cell_index": 3}));

        let back: ViewOptions = serde_json::from_value(json!({"cell_index": 3})).unwrap();
        assert!(!back.root);
        assert_eq!(back.extra["cell_index"], json!(3));
        assert_eq!(serde_json::to_value(&back).unwrap(), json!({"cell_index": 3}));
    }

    #[test]
    fn test_merged_overlays_extra() {
        let base = ViewOptions::default().with("a", 1).with("b", 1);
        let merged = base.merged(&ViewOptions::root().with("b", 2));
        assert!(merged.root);
        assert_eq!(merged.extra["a"], json!(1));
        assert_eq!(merged.extra["b"], json!(2));
    }
}
