//! # widget-sync
//!
//! Front-end side of the interactive widget protocol: models mirrored
//! between a kernel and a client over comm channels.
//!
//! A [`WidgetManager`] keeps the registry of models keyed by id, builds
//! models and views through a [`ClassResolver`], and talks to the outside
//! world through a [`WidgetHost`]. Each [`WidgetModel`] owns its attribute
//! state, applies remote updates strictly in arrival order, and pushes local
//! changes back with echo suppression and idle-based throttling. Binary
//! values travel beside the JSON payload; see [`buffers`].
//!
//! [`loopback`] provides an in-memory host and kernel for tests and demos.

pub mod buffers;
pub mod comm;
pub mod config;
pub mod error;
pub mod host;
pub mod loopback;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod serializers;
pub mod value;
pub mod version;
pub mod view;
pub mod view_list;

pub use buffers::{extract_buffers, inject_buffers, BufferPath, PathSegment};
pub use comm::{Comm, CommEvent, CommMessage, KernelStatus};
pub use config::ManagerConfig;
pub use error::{Result, WidgetError};
pub use host::{CommOpen, WidgetHost};
pub use manager::{ModelOptions, ModelPromise, StateOptions, WidgetManager, WidgetOptions};
pub use model::{ChangeOrigin, ModelEvent, ModelHandle, ModelInit, SyncMethod, WidgetModel};
pub use protocol::{ManagerState, ModelSnapshot, WidgetMessage};
pub use registry::{
    ClassResolver, ClassSpec, ModelSpec, SyncProtocol, Syncable, ViewClass, WidgetRegistry,
};
pub use serializers::{AttributeSerializer, ModelReferences};
pub use value::{Attributes, Value};
pub use view::{Renderable, ViewHandle, ViewOptions};
pub use view_list::ViewList;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
