//! widget-sync loopback demo.
//!
//! Runs a manager against the in-memory kernel: performs the version
//! handshake, creates a slider widget, shows how bursts of local changes are
//! throttled until the kernel reports idle, applies a kernel-side update and
//! prints everything that went over the wire.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: tracing filter (default: "info,widget_sync=debug")
//! - `WIDGET_SYNC_*`: manager settings, see `ManagerConfig::from_env`
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin widget-loopback
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::json;

use widget_sync::loopback::LoopbackHost;
use widget_sync::{
    Attributes, ManagerConfig, ModelHandle, ModelOptions, ModelSpec, Renderable, Value,
    ViewClass, ViewOptions, WidgetManager, WidgetOptions, WidgetRegistry,
};

const CONTROLS: &str = "@jupyter-widgets/controls";
const CONTROLS_VERSION: &str = "2.0.0";

/// Prints the slider value when rendered.
struct PrintedSlider {
    model: ModelHandle,
}

#[async_trait]
impl Renderable for PrintedSlider {
    async fn render(&self) -> anyhow::Result<()> {
        let value = self.model.get("value").unwrap_or(Value::Null);
        println!("[view] slider {} = {:?}", self.model.id(), value);
        Ok(())
    }

    fn remove(&self) {
        println!("[view] slider {} removed", self.model.id());
    }
}

struct SliderViews;

impl ViewClass for SliderViews {
    fn create(
        &self,
        model: ModelHandle,
        _options: &ViewOptions,
    ) -> anyhow::Result<Arc<dyn Renderable>> {
        Ok(Arc::new(PrintedSlider { model }))
    }
}

fn registry() -> widget_sync::Result<WidgetRegistry> {
    let registry = WidgetRegistry::new();
    registry.register_model(Arc::new(
        ModelSpec::dom_widget("IntSliderModel", CONTROLS, CONTROLS_VERSION)
            .with_view("IntSliderView", CONTROLS, CONTROLS_VERSION)
            .with_default("value", 0)
            .with_default("min", 0)
            .with_default("max", 100)
            .with_default("description", ""),
    ))?;
    registry.register_view(
        CONTROLS,
        CONTROLS_VERSION,
        "IntSliderView",
        Arc::new(SliderViews),
    )?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,widget_sync=debug".into()),
        )
        .init();

    let host = LoopbackHost::new();
    let manager = WidgetManager::new(
        ManagerConfig::from_env(),
        Arc::new(host.clone()),
        Arc::new(registry()?),
    );

    // Version handshake: answer the front end's open with a requirement.
    let handshake = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.validate_version().await })
    };
    let version_comm = loop {
        if let Some(open) = host.opened().into_iter().next() {
            break open.comm_id;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    host.kernel_send(&version_comm, json!({"version": "^2.0.0"}), Vec::new());
    let validated = handshake.await?.context("version handshake")?;
    tracing::info!("Front end version validated: {}", validated);

    let mut state = Attributes::new();
    state.insert("description".into(), Value::from("Volume"));
    let slider = manager
        .new_widget(
            WidgetOptions::new(
                ModelOptions::new("IntSliderModel", CONTROLS, CONTROLS_VERSION),
                "IntSliderView",
                CONTROLS,
                CONTROLS_VERSION,
            ),
            state,
        )
        .await
        .context("create slider")?;

    // The full-state update still holds the only slot, so these merge into
    // one buffered patch.
    for value in [10, 20, 30] {
        slider.set("value", value);
        slider.push_changes().await?;
    }
    tracing::info!(
        "{} message(s) in flight, buffered: {:?}",
        slider.pending_messages(),
        slider.buffered_attributes().map(|a| a.keys().cloned().collect::<Vec<_>>())
    );

    host.kernel_idle(slider.id());
    host.kernel_idle(slider.id());
    host.kernel_send(
        slider.id(),
        json!({"method": "update", "state": {"value": 42}}),
        Vec::new(),
    );
    slider.state_change().await?;

    manager
        .display_model(None, &slider, ViewOptions::default())
        .await
        .context("display slider")?;

    println!("--- wire log ---");
    for sent in host.sent() {
        println!(
            "{:?} {} {}",
            sent.kind,
            sent.comm_id,
            serde_json::to_string(&sent.data)?
        );
    }

    manager.clear_state(false).await?;
    Ok(())
}
