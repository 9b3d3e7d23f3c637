#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use harbor_backend::{
    Backend, BackendCategory, BackendError, BackendFactory, BackendListener, BackendSpec,
};
use harbor_core::{NodeName, Project, RuntimeInfo, RuntimeVersion};
use harbor_node_rpc::MockNodeRpc;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn exec_spec(node: &str) -> BackendSpec {
    BackendSpec::new(
        NodeName::parse(node),
        BackendCategory::Execution,
        RuntimeInfo::new("exec-runtime", RuntimeVersion::new(25, 3, 0), "/opt/runtime"),
    )
}

/// Factory producing backends wired to [`MockNodeRpc`] channels; the
/// channels stay inspectable by qualified node name.
#[derive(Default)]
pub struct TestFactory {
    channels: Mutex<Vec<(String, Arc<MockNodeRpc>)>>,
    created: AtomicUsize,
    fail_next: AtomicBool,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn channel(&self, node: &str) -> Arc<MockNodeRpc> {
        self.channels
            .lock()
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, rpc)| rpc.clone())
            .unwrap_or_else(|| panic!("no channel for node `{node}`"))
    }

    fn build(&self, spec: BackendSpec) -> Result<Arc<Backend>, BackendError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::ConnectionFailed {
                node: spec.node_name.clone(),
                message: "connection refused".into(),
            });
        }
        let rpc = MockNodeRpc::new();
        self.channels
            .lock()
            .push((spec.node_name.to_string(), rpc.clone()));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Backend::new(spec, rpc))
    }
}

impl BackendFactory for TestFactory {
    fn create_backend(&self, spec: BackendSpec) -> Result<Arc<Backend>, BackendError> {
        self.build(spec)
    }

    fn create_build_backend(&self, version: RuntimeVersion) -> Result<Arc<Backend>, BackendError> {
        let major = version.as_major();
        self.build(BackendSpec::new(
            NodeName::new(format!("build_{major}"), "localhost"),
            BackendCategory::Build,
            RuntimeInfo::new(format!("runtime-{major}"), version, "/opt/runtime"),
        ))
    }

    fn create_ide_backend(&self) -> Result<Arc<Backend>, BackendError> {
        self.build(BackendSpec::new(
            NodeName::new("ide", "localhost"),
            BackendCategory::Ide,
            RuntimeInfo::new("ide-runtime", RuntimeVersion::major(26), "/opt/runtime"),
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Added(String),
    Removed(String),
    ModuleLoaded {
        node: String,
        project: Option<String>,
        module: String,
    },
}

/// Listener recording every notification in arrival order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn added(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Added(node) => Some(node),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Removed(node) => Some(node),
                _ => None,
            })
            .collect()
    }

    pub fn modules_loaded(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::ModuleLoaded { node, module, .. } => Some((node, module)),
                _ => None,
            })
            .collect()
    }
}

impl BackendListener for RecordingListener {
    fn runtime_added(&self, backend: &Arc<Backend>) {
        self.events
            .lock()
            .push(Event::Added(backend.qualified_node_name()));
    }

    fn runtime_removed(&self, backend: &Arc<Backend>) {
        self.events
            .lock()
            .push(Event::Removed(backend.qualified_node_name()));
    }

    fn module_loaded(&self, backend: &Arc<Backend>, project: Option<&Project>, module: &str) {
        self.events.lock().push(Event::ModuleLoaded {
            node: backend.qualified_node_name(),
            project: project.map(|p| p.name.clone()),
            module: module.to_string(),
        });
    }
}
