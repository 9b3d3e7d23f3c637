use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use harbor_code::CodeManager;
use harbor_core::{NodeName, Project, RuntimeInfo};
use harbor_node_rpc::{NodeRpc, PathPriority};

use crate::{BackendCategory, BackendSpec, LaunchId};

/// A live connection handle to one runtime node.
///
/// Everything except disposal goes through either the shared RPC channel or
/// the code manager; the handle itself is immutable after creation and safe
/// to share freely.
pub struct Backend {
    spec: BackendSpec,
    rpc: Arc<dyn NodeRpc>,
    code: Mutex<CodeManager>,
    disposed: AtomicBool,
}

impl Backend {
    pub fn new(spec: BackendSpec, rpc: Arc<dyn NodeRpc>) -> Arc<Self> {
        let code = CodeManager::new(rpc.clone(), spec.runtime.clone());
        Arc::new(Self {
            spec,
            rpc,
            code: Mutex::new(code),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub fn node_name(&self) -> &NodeName {
        &self.spec.node_name
    }

    /// Fully qualified `name@host` form, as the discovery feed reports it.
    pub fn qualified_node_name(&self) -> String {
        self.spec.node_name.to_string()
    }

    pub fn category(&self) -> BackendCategory {
        self.spec.category
    }

    pub fn runtime(&self) -> &RuntimeInfo {
        &self.spec.runtime
    }

    pub fn launch(&self) -> Option<LaunchId> {
        self.spec.launch
    }

    pub fn rpc(&self) -> Arc<dyn NodeRpc> {
        self.rpc.clone()
    }

    /// Code distribution for this backend. All mutation is funneled through
    /// this one mutex, so per-backend code operations are serialized.
    pub fn code(&self) -> MutexGuard<'_, CodeManager> {
        self.code.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Terminal and idempotent. The first call signals the RPC channel to
    /// close; in-flight calls fail on their own once the channel drops.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!(node = %self.spec.node_name, "disposing backend");
            self.rpc.close();
        }
    }

    /// Puts the project's code root on this node's search path (ref-counted,
    /// so repeated associations are harmless).
    pub fn add_project_path(&self, project: &Project) {
        self.code().add_path(PathPriority::Prepend, &project.root);
    }

    pub fn remove_project_path(&self, project: &Project) {
        self.code().remove_path(&project.root);
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("node", &self.qualified_node_name())
            .field("category", &self.spec.category)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
