//! Model and view classes, and how the manager finds them.
//!
//! The manager never knows concrete widget types. It asks a
//! [`ClassResolver`] for the class named by `(name, module, version)` and
//! works through the [`Syncable`] and [`ViewClass`] traits from then on.
//! [`WidgetRegistry`] is the in-process resolver most hosts use.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Result, WidgetError};
use crate::model::ModelHandle;
use crate::serializers::{AttributeSerializer, ModelReferences};
use crate::value::{Attributes, Value};
use crate::version::{Version, VersionReq};
use crate::view::{Renderable, ViewOptions};

/// Module shipping the base widget classes.
pub const BASE_MODULE: &str = "@jupyter-widgets/base";
/// Version of [`BASE_MODULE`] this engine implements.
pub const BASE_MODULE_VERSION: &str = "2.0.0";

// ---------------------------------------------------------------------------
// ClassSpec
// ---------------------------------------------------------------------------

/// Name, module and version requirement identifying a class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassSpec {
    pub name: String,
    pub module: String,
    pub version: String,
}

impl ClassSpec {
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            version: version.into(),
        }
    }

    fn unresolved(&self, source: Option<WidgetError>) -> WidgetError {
        WidgetError::ClassResolution {
            name: self.name.clone(),
            module: self.module.clone(),
            version: self.version.clone(),
            source: source.map(Box::new),
        }
    }
}

impl fmt::Display for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.module, self.version, self.name)
    }
}

// ---------------------------------------------------------------------------
// Model classes
// ---------------------------------------------------------------------------

/// How a model pushes local changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncProtocol {
    /// Send only attributes that changed (`update` messages).
    #[default]
    Diff,
    /// Send the full state on every push (`backbone` messages).
    Backbone,
}

/// Behaviour shared by every model of one class.
pub trait Syncable: Send + Sync {
    fn model_name(&self) -> &str;
    fn model_module(&self) -> &str;
    fn model_module_version(&self) -> &str;

    /// Attribute values a fresh model starts from.
    fn defaults(&self) -> Attributes;

    /// Serializer for `attribute`, when it needs one.
    fn serializer(&self, attribute: &str) -> Option<Arc<dyn AttributeSerializer>> {
        let _ = attribute;
        None
    }

    fn sync_protocol(&self) -> SyncProtocol {
        SyncProtocol::Diff
    }
}

impl fmt::Debug for dyn Syncable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syncable")
            .field("model_name", &self.model_name())
            .field("model_module", &self.model_module())
            .field("model_module_version", &self.model_module_version())
            .finish()
    }
}

/// A data-driven [`Syncable`].
///
/// ```
/// use widget_sync::registry::ModelSpec;
///
/// let slider = ModelSpec::dom_widget("IntSliderModel", "@jupyter-widgets/controls", "2.0.0")
///     .with_view("IntSliderView", "@jupyter-widgets/controls", "2.0.0")
///     .with_default("value", 0)
///     .with_default("msg_throttle", 1);
/// ```
#[derive(Clone)]
pub struct ModelSpec {
    name: String,
    module: String,
    version: String,
    defaults: Attributes,
    serializers: HashMap<String, Arc<dyn AttributeSerializer>>,
    protocol: SyncProtocol,
}

impl ModelSpec {
    /// A class carrying only the base widget attributes.
    pub fn widget(
        name: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let (name, module, version): (String, String, String) =
            (name.into(), module.into(), version.into());
        let mut defaults = Attributes::new();
        defaults.insert("_model_name".into(), Value::from(name.as_str()));
        defaults.insert("_model_module".into(), Value::from(module.as_str()));
        defaults.insert("_model_module_version".into(), Value::from(version.as_str()));
        defaults.insert("_view_name".into(), Value::Null);
        defaults.insert("_view_module".into(), Value::from(BASE_MODULE));
        defaults.insert("_view_module_version".into(), Value::from(BASE_MODULE_VERSION));
        defaults.insert("_view_count".into(), Value::Null);

        Self {
            name,
            module,
            version,
            defaults,
            serializers: HashMap::new(),
            protocol: SyncProtocol::Diff,
        }
    }

    /// A widget that renders into the page, with `layout` and `style`
    /// references and DOM classes.
    pub fn dom_widget(
        name: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self::widget(name, module, version)
            .with_default("_dom_classes", Value::Array(Vec::new()))
            .with_default("layout", Value::Null)
            .with_default("style", Value::Null)
            .with_model_references(["layout", "style"])
    }

    pub fn with_view(
        self,
        name: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let (name, module, version): (String, String, String) =
            (name.into(), module.into(), version.into());
        self.with_default("_view_name", name)
            .with_default("_view_module", module)
            .with_default("_view_module_version", version)
    }

    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    pub fn with_serializer(
        mut self,
        attribute: impl Into<String>,
        serializer: Arc<dyn AttributeSerializer>,
    ) -> Self {
        self.serializers.insert(attribute.into(), serializer);
        self
    }

    /// Resolve `IPY_MODEL_` references in each of `attributes`.
    pub fn with_model_references<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let serializer: Arc<dyn AttributeSerializer> = Arc::new(ModelReferences);
        for attribute in attributes {
            self.serializers.insert(attribute.into(), serializer.clone());
        }
        self
    }

    pub fn with_sync_protocol(mut self, protocol: SyncProtocol) -> Self {
        self.protocol = protocol;
        self
    }
}

impl Syncable for ModelSpec {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn model_module(&self) -> &str {
        &self.module
    }

    fn model_module_version(&self) -> &str {
        &self.version
    }

    fn defaults(&self) -> Attributes {
        self.defaults.clone()
    }

    fn serializer(&self, attribute: &str) -> Option<Arc<dyn AttributeSerializer>> {
        self.serializers.get(attribute).cloned()
    }

    fn sync_protocol(&self) -> SyncProtocol {
        self.protocol
    }
}

impl fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSpec")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// View classes
// ---------------------------------------------------------------------------

/// Factory for views of one class.
pub trait ViewClass: Send + Sync {
    fn create(
        &self,
        model: ModelHandle,
        options: &ViewOptions,
    ) -> anyhow::Result<Arc<dyn Renderable>>;
}

impl<F> ViewClass for F
where
    F: Fn(ModelHandle, &ViewOptions) -> anyhow::Result<Arc<dyn Renderable>> + Send + Sync,
{
    fn create(
        &self,
        model: ModelHandle,
        options: &ViewOptions,
    ) -> anyhow::Result<Arc<dyn Renderable>> {
        self(model, options)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Locates model and view classes for the manager.
#[async_trait]
pub trait ClassResolver: Send + Sync {
    async fn resolve_model(&self, spec: &ClassSpec) -> Result<Arc<dyn Syncable>>;
    async fn resolve_view(&self, spec: &ClassSpec) -> Result<Arc<dyn ViewClass>>;
}

#[derive(Default)]
struct ModuleRelease {
    models: HashMap<String, Arc<dyn Syncable>>,
    views: HashMap<String, Arc<dyn ViewClass>>,
}

/// In-memory class registry keyed by module and released version.
///
/// A requested version is a requirement; the highest registered release
/// satisfying it that has the class wins. A bare version `X.Y.Z` is read as
/// `^X.Y.Z`, an empty one as any version.
#[derive(Default)]
pub struct WidgetRegistry {
    modules: RwLock<HashMap<String, Vec<(Version, ModuleRelease)>>>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model class under its own module and version.
    pub fn register_model(&self, class: Arc<dyn Syncable>) -> Result<()> {
        let version: Version = class.model_module_version().parse()?;
        let module = class.model_module().to_string();
        let name = class.model_name().to_string();
        log::debug!("Registering model class {}@{}:{}", module, version, name);
        self.with_release(module, version, |release| {
            release.models.insert(name, class);
        });
        Ok(())
    }

    pub fn register_view(
        &self,
        module: impl Into<String>,
        version: &str,
        name: impl Into<String>,
        class: Arc<dyn ViewClass>,
    ) -> Result<()> {
        let version: Version = version.parse()?;
        let (module, name) = (module.into(), name.into());
        log::debug!("Registering view class {}@{}:{}", module, version, name);
        self.with_release(module, version, |release| {
            release.views.insert(name, class);
        });
        Ok(())
    }

    fn with_release(&self, module: String, version: Version, f: impl FnOnce(&mut ModuleRelease)) {
        let mut modules = self.modules.write();
        let releases = modules.entry(module).or_default();
        match releases.iter_mut().find(|(v, _)| *v == version) {
            Some((_, release)) => f(release),
            None => {
                let mut release = ModuleRelease::default();
                f(&mut release);
                releases.push((version, release));
            }
        }
    }

    fn lookup<T: ?Sized>(
        &self,
        spec: &ClassSpec,
        pick: impl Fn(&ModuleRelease) -> Option<&Arc<T>>,
    ) -> Result<Arc<T>> {
        let requirement = requirement_for(&spec.version).map_err(|e| spec.unresolved(Some(e)))?;
        let modules = self.modules.read();
        let releases = modules.get(&spec.module).ok_or_else(|| spec.unresolved(None))?;

        releases
            .iter()
            .filter(|(version, release)| requirement.matches(version) && pick(release).is_some())
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .and_then(|(_, release)| pick(release).cloned())
            .ok_or_else(|| spec.unresolved(None))
    }
}

fn requirement_for(version: &str) -> Result<VersionReq> {
    let version = version.trim();
    if version.is_empty() {
        return "*".parse();
    }
    if version.parse::<Version>().is_ok() {
        return format!("^{}", version).parse();
    }
    version.parse()
}

#[async_trait]
impl ClassResolver for WidgetRegistry {
    async fn resolve_model(&self, spec: &ClassSpec) -> Result<Arc<dyn Syncable>> {
        self.lookup(spec, |release| release.models.get(&spec.name))
    }

    async fn resolve_view(&self, spec: &ClassSpec) -> Result<Arc<dyn ViewClass>> {
        self.lookup(spec, |release| release.views.get(&spec.name))
    }
}

impl fmt::Debug for WidgetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modules = self.modules.read();
        let mut list = f.debug_map();
        for (module, releases) in modules.iter() {
            let versions: Vec<String> = releases.iter().map(|(v, _)| v.to_string()).collect();
            list.entry(module, &versions);
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLS: &str = "@jupyter-widgets/controls";

    fn registry() -> WidgetRegistry {
        let registry = WidgetRegistry::new();
        for version in ["1.5.0", "2.0.0", "2.1.0"] {
            let class = ModelSpec::widget("IntSliderModel", CONTROLS, version)
                .with_default("release", version);
            registry.register_model(Arc::new(class)).unwrap();
        }
        registry
            .register_model(Arc::new(ModelSpec::widget("ButtonModel", CONTROLS, "2.0.0")))
            .unwrap();
        registry
    }

    async fn release_of(registry: &WidgetRegistry, name: &str, version: &str) -> Result<String> {
        let class = registry
            .resolve_model(&ClassSpec::new(name, CONTROLS, version))
            .await?;
        Ok(class.defaults()["release"].as_str().unwrap_or_default().to_string())
    }

    #[tokio::test]
    async fn test_bare_version_is_caret() {
        let registry = registry();
        assert_eq!(release_of(&registry, "IntSliderModel", "2.0.0").await.unwrap(), "2.1.0");
        assert_eq!(release_of(&registry, "IntSliderModel", "1.0.0").await.unwrap(), "1.5.0");
        assert_eq!(release_of(&registry, "IntSliderModel", "~2.0.0").await.unwrap(), "2.0.0");
        assert_eq!(release_of(&registry, "IntSliderModel", "").await.unwrap(), "2.1.0");
    }

    #[tokio::test]
    async fn test_release_without_class_is_skipped() {
        let registry = registry();
        let class = registry
            .resolve_model(&ClassSpec::new("ButtonModel", CONTROLS, "^2"))
            .await
            .unwrap();
        assert_eq!(class.model_module_version(), "2.0.0");
    }

    #[tokio::test]
    async fn test_unresolvable_classes() {
        let registry = registry();
        for spec in [
            ClassSpec::new("IntSliderModel", CONTROLS, "3.0.0"),
            ClassSpec::new("IntSliderModel", "@acme/widgets", "1.0.0"),
            ClassSpec::new("NoSuchModel", CONTROLS, "2.0.0"),
        ] {
            let err = registry.resolve_model(&spec).await.unwrap_err();
            assert!(matches!(err, WidgetError::ClassResolution { .. }), "{}", spec);
        }
    }

    #[test]
    fn test_dom_widget_defaults() {
        let class = ModelSpec::dom_widget("ButtonModel", CONTROLS, "2.0.0")
            .with_view("ButtonView", CONTROLS, "2.0.0");
        let defaults = class.defaults();
        assert_eq!(defaults["_model_name"], Value::from("ButtonModel"));
        assert_eq!(defaults["_view_name"], Value::from("ButtonView"));
        assert_eq!(defaults["_dom_classes"], Value::Array(Vec::new()));
        assert!(class.serializer("layout").is_some());
        assert!(class.serializer("description").is_none());
    }
}
