use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::loopback::LoopbackHost;
use crate::registry::{ModelSpec, ViewClass, WidgetRegistry, BASE_MODULE};
use crate::view::Renderable;

const CONTROLS: &str = "@jupyter-widgets/controls";
const TARGET: &str = "jupyter.widget";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ViewLog {
    /// `value` of the model at the time each view rendered.
    rendered: Mutex<Vec<Option<Value>>>,
    removed: AtomicUsize,
}

struct TestView {
    model: ModelHandle,
    log: Arc<ViewLog>,
}

#[async_trait]
impl Renderable for TestView {
    async fn render(&self) -> anyhow::Result<()> {
        self.log.rendered.lock().push(self.model.get("value"));
        Ok(())
    }

    fn remove(&self) {
        self.log.removed.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestViews(Arc<ViewLog>);

impl ViewClass for TestViews {
    fn create(
        &self,
        model: ModelHandle,
        _options: &ViewOptions,
    ) -> anyhow::Result<Arc<dyn Renderable>> {
        Ok(Arc::new(TestView {
            model,
            log: self.0.clone(),
        }))
    }
}

struct Fixture {
    manager: Arc<WidgetManager>,
    host: LoopbackHost,
    views: Arc<ViewLog>,
}

fn fixture_with(config: ManagerConfig) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let registry = WidgetRegistry::new();
    registry
        .register_model(Arc::new(
            ModelSpec::dom_widget("IntSliderModel", CONTROLS, "2.0.0")
                .with_view("IntSliderView", CONTROLS, "2.0.0")
                .with_default("value", 0),
        ))
        .unwrap();
    registry
        .register_model(Arc::new(
            ModelSpec::widget("LayoutModel", BASE_MODULE, "2.0.0")
                .with_view("LayoutView", BASE_MODULE, "2.0.0")
                .with_default("width", Value::Null),
        ))
        .unwrap();
    registry
        .register_model(Arc::new(
            ModelSpec::dom_widget("BoxModel", CONTROLS, "2.0.0")
                .with_view("BoxView", CONTROLS, "2.0.0")
                .with_default("children", Value::Array(Vec::new()))
                .with_model_references(["children"]),
        ))
        .unwrap();

    let views = Arc::new(ViewLog::default());
    registry
        .register_view(CONTROLS, "2.0.0", "IntSliderView", Arc::new(TestViews(views.clone())))
        .unwrap();

    let host = LoopbackHost::new();
    let manager = WidgetManager::new(config, Arc::new(host.clone()), Arc::new(registry));
    Fixture {
        manager,
        host,
        views,
    }
}

fn fixture() -> Fixture {
    fixture_with(ManagerConfig::default())
}

fn slider_options() -> ModelOptions {
    ModelOptions::new("IntSliderModel", CONTROLS, "2.0.0")
}

fn open_message(state: serde_json::Value) -> CommMessage {
    CommMessage {
        data: json!({"state": state, "buffer_paths": []}),
        buffers: Vec::new(),
        metadata: json!({"version": "2.1.0"}),
    }
}

async fn open_slider(f: &Fixture, id: &str, value: i64) -> ModelHandle {
    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, id);
    f.manager
        .handle_comm_open(
            comm,
            open_message(json!({
                "_model_name": "IntSliderModel",
                "_model_module": CONTROLS,
                "_model_module_version": "2.0.0",
                "value": value,
            })),
        )
        .await
        .unwrap()
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_new_model_requires_comm_or_id() {
    let f = fixture();
    let err = f
        .manager
        .new_model(slider_options(), Attributes::new())
        .err()
        .unwrap();
    assert!(matches!(err, WidgetError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_concurrent_new_model_resolves_to_same_instance() {
    let f = fixture();
    let first = f
        .manager
        .new_model(slider_options().with_id("w1"), Attributes::new())
        .unwrap();
    let second = f
        .manager
        .new_model(slider_options().with_id("w1"), Attributes::new())
        .unwrap();

    let (a, b) = tokio::join!(first, second);
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(f.manager.model_ids(), vec!["w1".to_string()]);
}

#[tokio::test]
async fn test_unknown_class_rolls_back_registration() {
    let f = fixture();
    let promise = f
        .manager
        .new_model(
            ModelOptions::new("NoSuchModel", CONTROLS, "2.0.0").with_id("w1"),
            Attributes::new(),
        )
        .unwrap();

    let err = promise.await.unwrap_err();
    match err.root() {
        WidgetError::ModelCreation { model_id, source } => {
            assert_eq!(model_id, "w1");
            assert!(matches!(**source, WidgetError::ClassResolution { .. }));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!f.manager.has_model("w1"));
    assert!(matches!(
        f.manager.get_model("w1").await,
        Err(WidgetError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Comm open and incoming messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_update_applies_without_echo() {
    let f = fixture();
    let model = open_slider(&f, "w1", 0).await;

    f.host.kernel_send(
        "w1",
        json!({"method": "update", "state": {"value": 5}}),
        Vec::new(),
    );
    model.state_change().await.unwrap();

    assert_eq!(model.get("value"), Some(Value::from(5)));
    assert!(f.host.messages_to("w1").is_empty());
    assert!(Arc::ptr_eq(&model, &f.manager.get_model("w1").await.unwrap()));
}

#[tokio::test]
async fn test_comm_open_flat_payload_with_buffers() {
    let f = fixture();
    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, "w1");
    let msg = CommMessage {
        data: json!({
            "state": {"_model_name": "IntSliderModel", "_model_module": CONTROLS, "_model_module_version": "2.0.0"},
            "buffer_paths": [["data"]],
        }),
        buffers: vec![Bytes::from_static(b"abc")],
        metadata: serde_json::Value::Null,
    };
    let model = f.manager.handle_comm_open(comm, msg).await.unwrap();
    assert_eq!(
        model.get("data").and_then(|v| v.as_bytes().cloned()),
        Some(Bytes::from_static(b"abc"))
    );

    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, "w2");
    let flat = CommMessage::new(json!({"_model_name": "IntSliderModel", "_model_module": CONTROLS, "value": 4}));
    let model = f.manager.handle_comm_open(comm, flat).await.unwrap();
    assert_eq!(model.get("value"), Some(Value::from(4)));
}

#[tokio::test]
async fn test_comm_open_rejects_other_major_version() {
    let f = fixture();
    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, "w1");
    let mut msg = open_message(json!({"_model_name": "IntSliderModel"}));
    msg.metadata = json!({"version": "1.0.0"});

    let err = f.manager.handle_comm_open(comm, msg).await.unwrap_err();
    assert!(matches!(err, WidgetError::VersionMismatch(_)));
    assert!(!f.manager.has_model("w1"));
}

#[tokio::test]
async fn test_model_references_resolve_through_manager() {
    let f = fixture();
    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, "layout1");
    let layout = f
        .manager
        .handle_comm_open(
            comm,
            open_message(json!({"_model_name": "LayoutModel", "_model_module": BASE_MODULE})),
        )
        .await
        .unwrap();

    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, "w1");
    let slider = f
        .manager
        .handle_comm_open(
            comm,
            open_message(json!({
                "_model_name": "IntSliderModel",
                "_model_module": CONTROLS,
                "layout": "IPY_MODEL_layout1",
            })),
        )
        .await
        .unwrap();

    match slider.get("layout") {
        Some(Value::Model(model)) => assert!(Arc::ptr_eq(&model, &layout)),
        other => panic!("layout not resolved: {:?}", other),
    }

    slider.set("value", 2);
    slider.push_changes().await.unwrap();
    slider.set("layout", Value::Null);
    f.host.kernel_idle("w1");
    slider.state_change().await.unwrap();
    slider.push_changes().await.unwrap();
    assert_eq!(f.host.messages_to("w1")[1]["state"], json!({"layout": null}));
}

#[tokio::test]
async fn test_missing_reference_fails_creation() {
    let f = fixture();
    let comm: Arc<dyn Comm> = f.host.kernel_open(TARGET, "box1");
    let err = f
        .manager
        .handle_comm_open(
            comm,
            open_message(json!({
                "_model_name": "BoxModel",
                "_model_module": CONTROLS,
                "children": ["IPY_MODEL_nope"],
            })),
        )
        .await
        .unwrap_err();

    assert!(matches!(err.root(), WidgetError::ModelCreation { .. }));
    assert!(!f.manager.has_model("box1"));
}

#[tokio::test]
async fn test_display_message_shows_root_view() {
    let f = fixture();
    let model = open_slider(&f, "w1", 1).await;

    f.host.kernel_send("w1", json!({"method": "display"}), Vec::new());
    wait_until(|| !f.host.displayed().is_empty()).await;

    let displayed = f.host.displayed();
    assert_eq!(displayed[0].model_id, "w1");
    assert!(displayed[0].options.root);
    assert_eq!(model.views().len(), 1);
}

#[tokio::test]
async fn test_display_with_output_ignores_display_message() {
    let f = fixture_with(ManagerConfig::default().with_display_with_output(true));
    let model = open_slider(&f, "w1", 1).await;

    f.host.kernel_send("w1", json!({"method": "display"}), Vec::new());
    model.state_change().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(f.host.displayed().is_empty());
    assert_eq!(model.view_count(), 0);
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_view_renders_after_queued_updates() {
    let f = fixture();
    let model = open_slider(&f, "w1", 1).await;

    f.host.kernel_send(
        "w1",
        json!({"method": "update", "state": {"value": 3}}),
        Vec::new(),
    );
    let view = f
        .manager
        .create_view(&model, ViewOptions::default())
        .await
        .unwrap();

    assert_eq!(*f.views.rendered.lock(), vec![Some(Value::from(3))]);
    assert!(!view.options().root);
    assert!(Arc::ptr_eq(&view.model().unwrap(), &model));
}

#[tokio::test]
async fn test_view_count_follows_views() {
    let f = fixture();
    let model = open_slider(&f, "w1", 0).await;
    model.set("_view_count", 0);

    let first = f.manager.create_view(&model, ViewOptions::default()).await.unwrap();
    let _second = f.manager.create_view(&model, ViewOptions::default()).await.unwrap();
    assert_eq!(model.get("_view_count"), Some(Value::from(2)));

    first.remove();
    first.remove();
    assert_eq!(model.get("_view_count"), Some(Value::from(1)));
    assert_eq!(model.view_count(), 1);
    assert_eq!(f.views.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_view_without_class_fails() {
    let f = fixture();
    let model = f
        .manager
        .new_model(
            ModelOptions::new("LayoutModel", BASE_MODULE, "2.0.0").with_id("l1"),
            Attributes::new(),
        )
        .unwrap()
        .await
        .unwrap();

    let err = f
        .manager
        .create_view(&model, ViewOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), WidgetError::ViewCreation { .. }));
    assert_eq!(model.view_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_view_of_closed_model_leaves_no_slot() {
    let f = fixture();
    let model = open_slider(&f, "w1", 0).await;
    assert_ok!(model.close().await);

    for _ in 0..20 {
        let err = assert_err!(f.manager.create_view(&model, ViewOptions::default()).await);
        assert!(matches!(err.root(), WidgetError::ViewCreation { .. }));
        assert_eq!(model.view_count(), 0);
    }
    assert!(f.views.rendered.lock().is_empty());
}

#[tokio::test]
async fn test_failed_display_removes_view() {
    let f = fixture();
    let model = open_slider(&f, "w1", 0).await;
    model.set("_view_count", 0);
    f.host.set_fail_display(true);

    let err = assert_err!(
        f.manager
            .display_model(None, &model, ViewOptions::default())
            .await
    );
    assert!(matches!(err, WidgetError::Display { .. }));
    assert_eq!(model.view_count(), 0);
    assert_eq!(model.get("_view_count"), Some(Value::from(0)));
    assert_eq!(f.views.removed.load(Ordering::SeqCst), 1);
    assert!(f.host.displayed().is_empty());

    let displayed = f
        .manager
        .get_state(StateOptions {
            only_displayed: true,
            ..StateOptions::default()
        })
        .await
        .unwrap();
    assert!(displayed.state.is_empty());
}

#[tokio::test]
async fn test_close_removes_views_and_unregisters() {
    let f = fixture();
    let model = open_slider(&f, "w1", 0).await;
    f.manager
        .display_model(None, &model, ViewOptions::default())
        .await
        .unwrap();

    assert_ok!(model.close().await);
    assert_eq!(f.views.removed.load(Ordering::SeqCst), 1);
    assert!(!f.manager.has_model("w1"));
    assert!(f.host.comm("w1").unwrap().is_closed());
}

// ---------------------------------------------------------------------------
// new_widget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_new_widget_opens_comm_and_sends_state() {
    let f = fixture();
    let mut state = Attributes::new();
    state.insert("value".into(), Value::from(3));

    let model = f
        .manager
        .new_widget(
            WidgetOptions::new(slider_options(), "IntSliderView", CONTROLS, "2.0.0"),
            state,
        )
        .await
        .unwrap();

    assert!(model.is_live());
    let opened = f.host.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].comm_id, model.id());
    assert_eq!(opened[0].target_name, TARGET);
    assert_eq!(opened[0].data["state"]["_model_name"], json!("IntSliderModel"));
    assert_eq!(opened[0].data["state"]["_view_name"], json!("IntSliderView"));
    assert_eq!(opened[0].metadata, json!({"version": "2.1.0"}));

    let sent = f.host.messages_to(model.id());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["method"], json!("update"));
    assert_eq!(sent[0]["state"]["value"], json!(3));
}

#[tokio::test]
async fn test_new_widget_falls_back_to_commless_model() {
    let f = fixture();
    f.host.set_fail_open(true);

    let model = f
        .manager
        .new_widget(
            WidgetOptions::new(slider_options(), "IntSliderView", CONTROLS, "2.0.0"),
            Attributes::new(),
        )
        .await
        .unwrap();

    assert!(!model.is_live());
    assert!(!model.id().is_empty());
    assert!(f.manager.has_model(model.id()));
    assert_eq!(model.get("_view_name"), Some(Value::from("IntSliderView")));
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_state_round_trip_between_managers() {
    let f = fixture();
    let mut state = Attributes::new();
    state.insert("value".into(), Value::from(7));
    state.insert("data".into(), Value::from(vec![9u8, 8, 7]));
    let model = f
        .manager
        .new_model(slider_options().with_id("w1"), state)
        .unwrap()
        .await
        .unwrap();
    f.manager
        .display_model(None, &model, ViewOptions::default().with("cell", 2))
        .await
        .unwrap();

    let snapshot = f
        .manager
        .get_state(StateOptions {
            drop_defaults: true,
            ..StateOptions::default()
        })
        .await
        .unwrap();
    let entry = &snapshot.state["w1"];
    assert_eq!(entry.model_name, "IntSliderModel");
    assert_eq!(entry.state.get("value"), Some(&json!(7)));
    assert!(entry.state.get("_model_name").is_none());
    assert_eq!(entry.buffers.len(), 1);
    assert_eq!(entry.views.len(), 1);
    assert_eq!(entry.views[0].extra["cell"], json!(2));

    let json = serde_json::to_string(&snapshot).unwrap();
    let snapshot: crate::protocol::ManagerState = serde_json::from_str(&json).unwrap();

    let other = fixture();
    let restored = other.manager.set_state(&snapshot, None).await.unwrap();
    assert_eq!(restored.len(), 1);
    let copy = &restored[0];
    assert_eq!(copy.id(), "w1");
    assert!(!copy.is_live());
    assert_eq!(copy.get_state(true), model.get_state(true));
    assert_eq!(other.host.displayed().len(), 1);
    assert_eq!(other.host.displayed()[0].options.extra["cell"], json!(2));
}

#[tokio::test]
async fn test_get_state_filters() {
    let f = fixture();
    let live = open_slider(&f, "live", 0).await;
    let _commless = f
        .manager
        .new_model(slider_options().with_id("commless"), Attributes::new())
        .unwrap()
        .await
        .unwrap();
    f.manager
        .create_view(&live, ViewOptions::default())
        .await
        .unwrap();

    let all = f.manager.get_state(StateOptions::default()).await.unwrap();
    assert_eq!(all.state.len(), 2);

    let displayed = f
        .manager
        .get_state(StateOptions {
            only_displayed: true,
            ..StateOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(displayed.state.keys().collect::<Vec<_>>(), vec!["live"]);
    // Embedded views are not recorded for redisplay.
    assert!(displayed.state["live"].views.is_empty());

    let not_live = f
        .manager
        .get_state(StateOptions {
            not_live: true,
            ..StateOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(not_live.state.keys().collect::<Vec<_>>(), vec!["commless"]);
}

#[tokio::test]
async fn test_set_state_updates_registered_model_in_place() {
    let f = fixture();
    let model = open_slider(&f, "w1", 1).await;

    let mut snapshot = f.manager.get_state(StateOptions::default()).await.unwrap();
    snapshot
        .state
        .get_mut("w1")
        .unwrap()
        .state
        .insert("value".into(), json!(9));

    let restored = f.manager.set_state(&snapshot, None).await.unwrap();
    assert!(Arc::ptr_eq(&restored[0], &model));
    assert_eq!(model.get("value"), Some(Value::from(9)));
    assert_eq!(f.manager.model_ids(), vec!["w1".to_string()]);

    model.push_changes().await.unwrap();
    assert!(f.host.messages_to("w1").is_empty());
}

#[tokio::test]
async fn test_set_state_reattaches_live_comm() {
    let f = fixture();
    f.host.kernel_register(TARGET, "w1");
    f.host.kernel_register("other.target", "w2");

    let mut snapshot = crate::protocol::ManagerState::default();
    for id in ["w1", "w2"] {
        snapshot.state.insert(
            id.to_string(),
            crate::protocol::ModelSnapshot {
                model_name: "IntSliderModel".into(),
                model_module: CONTROLS.into(),
                model_module_version: "2.0.0".into(),
                state: serde_json::Map::new(),
                buffers: Vec::new(),
                views: Vec::new(),
            },
        );
    }

    let restored = f.manager.set_state(&snapshot, None).await.unwrap();
    assert!(restored[0].is_live());
    assert!(!restored[1].is_live());
    assert!(f.host.opened().is_empty());
}

#[tokio::test]
async fn test_set_state_resolves_references_between_restored_models() {
    let f = fixture();
    let mut snapshot = crate::protocol::ManagerState::default();
    let mut box_state = serde_json::Map::new();
    box_state.insert("children".into(), json!(["IPY_MODEL_s1"]));
    snapshot.state.insert(
        "b1".into(),
        crate::protocol::ModelSnapshot {
            model_name: "BoxModel".into(),
            model_module: CONTROLS.into(),
            model_module_version: "2.0.0".into(),
            state: box_state,
            buffers: Vec::new(),
            views: Vec::new(),
        },
    );
    snapshot.state.insert(
        "s1".into(),
        crate::protocol::ModelSnapshot {
            model_name: "IntSliderModel".into(),
            model_module: CONTROLS.into(),
            model_module_version: "2.0.0".into(),
            state: serde_json::Map::new(),
            buffers: Vec::new(),
            views: Vec::new(),
        },
    );

    let restored = f.manager.set_state(&snapshot, None).await.unwrap();
    let children = restored[0].get("children").unwrap();
    let children = children.as_array().unwrap();
    assert!(Arc::ptr_eq(children[0].as_model().unwrap(), &restored[1]));
}

#[tokio::test]
async fn test_clear_state() {
    let f = fixture();
    let live = open_slider(&f, "live", 0).await;
    let commless = f
        .manager
        .new_model(slider_options().with_id("commless"), Attributes::new())
        .unwrap()
        .await
        .unwrap();

    f.manager.clear_state(true).await.unwrap();
    assert!(commless.is_closed());
    assert!(!live.is_closed());
    assert_eq!(f.manager.model_ids(), vec!["live".to_string()]);

    f.manager.clear_state(false).await.unwrap();
    assert!(live.is_closed());
    assert!(f.manager.model_ids().is_empty());
    assert!(f.host.comm("live").unwrap().is_closed());
}

// ---------------------------------------------------------------------------
// Version handshake
// ---------------------------------------------------------------------------

async fn version_comm_id(host: &LoopbackHost) -> String {
    wait_until(|| !host.opened().is_empty()).await;
    let opened = host.opened();
    assert_eq!(opened[0].target_name, "jupyter.widget.version");
    opened[0].comm_id.clone()
}

#[tokio::test]
async fn test_validate_version_accepts_requirement() {
    let f = fixture();
    let manager = f.manager.clone();
    let check = tokio::spawn(async move { manager.validate_version().await });

    let id = version_comm_id(&f.host).await;
    f.host.kernel_send(&id, json!({"version": "^2.0.0"}), Vec::new());

    assert!(check.await.unwrap().unwrap());
    assert_eq!(f.host.messages_to(&id), vec![json!({"validated": true})]);
}

#[tokio::test]
async fn test_validate_version_reports_mismatch() {
    let f = fixture();
    let manager = f.manager.clone();
    let check = tokio::spawn(async move { manager.validate_version().await });

    let id = version_comm_id(&f.host).await;
    f.host.kernel_send(&id, json!({"version": "^3.0.0"}), Vec::new());

    assert!(!check.await.unwrap().unwrap());
    assert_eq!(f.host.messages_to(&id), vec![json!({"validated": false})]);
}

#[tokio::test]
async fn test_validate_version_times_out() {
    let f = fixture_with(ManagerConfig::default().with_version_timeout_ms(50));
    let result = f.manager.validate_version().await;
    assert_err!(&result);
    assert!(matches!(result, Err(WidgetError::Timeout(50))));
}
