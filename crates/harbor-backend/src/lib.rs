//! Backend registry: lifecycle and lookup of runtime-node connections.
//!
//! A [`Backend`] is a live connection to one external runtime node. The
//! [`BackendRegistry`] creates backends through a [`BackendFactory`],
//! categorizes them (the lazily created IDE singleton, one build backend per
//! runtime major version, any number of execution backends per project),
//! reconciles them against a discovery feed's node up/down reports, fans
//! [`harbor_code::CodeBundle`]s out to every live backend, and notifies
//! registered [`BackendListener`]s of changes.

mod backend;
mod registry;

use std::sync::Arc;

use thiserror::Error;

use harbor_core::{NodeName, Project, RuntimeInfo, RuntimeVersion};

pub use backend::Backend;
pub use registry::BackendRegistry;

/// What a backend is for. Determines its lifecycle: the IDE backend survives
/// everything short of full shutdown, build backends are shared per runtime
/// major version, execution backends belong to the launches that created
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendCategory {
    Ide,
    Build,
    Execution,
}

/// Opaque handle tying a backend to the external launch that started it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LaunchId(pub u64);

/// Everything the factory needs to create one backend.
#[derive(Clone, Debug)]
pub struct BackendSpec {
    pub node_name: NodeName,
    pub category: BackendCategory,
    pub runtime: RuntimeInfo,
    pub launch: Option<LaunchId>,
}

impl BackendSpec {
    pub fn new(node_name: NodeName, category: BackendCategory, runtime: RuntimeInfo) -> Self {
        Self {
            node_name,
            category,
            runtime,
            launch: None,
        }
    }

    pub fn with_launch(mut self, launch: LaunchId) -> Self {
        self.launch = Some(launch);
        self
    }
}

/// Structural errors surfaced to registry callers.
///
/// Per-module and per-path failures during code distribution are absorbed by
/// the code manager and only observable via logs; they never appear here.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A build backend was requested but no runtime is resolvable and no
    /// IDE backend exists to fall back to. Fatal for this request only.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The factory could not establish a runtime connection. Registry state
    /// is untouched; the failed backend is never registered.
    #[error("could not connect to node `{node}`: {message}")]
    ConnectionFailed { node: NodeName, message: String },
}

/// Creates backend connections. Implementations may start and connect a node
/// process, so every method is potentially slow (seconds-scale) and blocking.
///
/// A returned backend's RPC channel must either be connected already or
/// queue calls until it is.
pub trait BackendFactory: Send + Sync {
    fn create_backend(&self, spec: BackendSpec) -> Result<Arc<Backend>, BackendError>;

    fn create_build_backend(&self, version: RuntimeVersion) -> Result<Arc<Backend>, BackendError>;

    fn create_ide_backend(&self) -> Result<Arc<Backend>, BackendError>;
}

/// Observer of registry changes.
///
/// Notification is synchronous, in the caller's thread, in listener
/// registration order, against a snapshot taken at publish time.
pub trait BackendListener: Send + Sync {
    fn runtime_added(&self, _backend: &Arc<Backend>) {}

    fn runtime_removed(&self, _backend: &Arc<Backend>) {}

    fn module_loaded(&self, _backend: &Arc<Backend>, _project: Option<&Project>, _module: &str) {}
}
