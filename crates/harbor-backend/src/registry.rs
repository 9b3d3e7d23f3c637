use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use harbor_code::{BundleOwner, CodeBundle, CodeContext, InitCall};
use harbor_core::{Project, RuntimeVersion};
use harbor_node_rpc::NodeRpc;

use crate::{Backend, BackendError, BackendFactory, BackendListener, BackendSpec, LaunchId};

/// Execution backends serving one project, together with the project itself
/// so teardown can release the project path it put on the node.
struct ProjectBackends {
    project: Project,
    backends: Vec<Arc<Backend>>,
}

/// Every index except the IDE slot, guarded by one mutex. Backend creation
/// and teardown are rare and slow next to lookups, so a single coarse lock
/// keeps the indexes trivially consistent with each other.
#[derive(Default)]
struct RegistryState {
    all: Vec<Arc<Backend>>,
    build_by_major: HashMap<RuntimeVersion, Arc<Backend>>,
    execution_by_project: HashMap<String, ProjectBackends>,
    bundles: Vec<Arc<CodeBundle>>,
}

/// Central owner of all backends.
///
/// Creation goes through the injected [`BackendFactory`]; the registry adds
/// categorization, bundle fan-out, node-status reconciliation, and listener
/// notification on top.
pub struct BackendRegistry {
    factory: Arc<dyn BackendFactory>,
    /// IDE singleton, published only once fully initialized.
    ide: RwLock<Option<Arc<Backend>>>,
    /// Serializes the IDE creation path; the slot is re-checked after
    /// acquisition so losers of the race reuse the winner's backend.
    ide_create: Mutex<()>,
    state: Mutex<RegistryState>,
    listeners: RwLock<Vec<Arc<dyn BackendListener>>>,
}

impl BackendRegistry {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            ide: RwLock::new(None),
            ide_create: Mutex::new(()),
            state: Mutex::new(RegistryState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The IDE backend, created lazily on first request. Concurrent callers
    /// all receive the same instance and a single added-notification is
    /// published.
    pub fn get_ide_backend(&self) -> Result<Arc<Backend>, BackendError> {
        if let Some(backend) = self.ide.read().clone() {
            return Ok(backend);
        }
        let _create = self.ide_create.lock();
        if let Some(backend) = self.ide.read().clone() {
            return Ok(backend);
        }

        info!("creating the IDE backend");
        let backend = self.factory.create_ide_backend()?;
        let bundles = self.index_new_backend(&backend);
        self.seed_bundles(&backend, &bundles);
        *self.ide.write() = Some(backend.clone());
        self.notify_added(&backend);
        Ok(backend)
    }

    /// The shared build backend for `project`'s runtime major version,
    /// creating it if this is the first project on that version. Projects
    /// without a configured runtime fall back to the IDE backend if one
    /// already exists.
    pub fn get_build_backend(&self, project: &Project) -> Result<Arc<Backend>, BackendError> {
        let Some(version) = project.runtime_version else {
            info!(project = %project.name, "project has no configured runtime, using the IDE backend");
            return self.ide.read().clone().ok_or_else(|| BackendError::Configuration {
                message: format!(
                    "project `{}` has no configured runtime and no IDE backend exists",
                    project.name
                ),
            });
        };
        let major = version.as_major();

        let (backend, bundles) = {
            let mut state = self.state.lock();
            if let Some(backend) = state.build_by_major.get(&major) {
                return Ok(backend.clone());
            }
            // Creating under the state lock is what guarantees at most one
            // build backend per major version, even though the factory call
            // can take a while.
            info!(version = %major, "creating build backend");
            let backend = self.factory.create_build_backend(version)?;
            state.build_by_major.insert(major, backend.clone());
            state.all.push(backend.clone());
            (backend, state.bundles.clone())
        };
        self.seed_bundles(&backend, &bundles);
        self.notify_added(&backend);
        Ok(backend)
    }

    /// Creates a fresh execution backend; never shared or cached. The caller
    /// associates it with projects via [`Self::add_execution_backend`].
    pub fn create_execution_backend(
        &self,
        spec: BackendSpec,
    ) -> Result<Arc<Backend>, BackendError> {
        debug!(node = %spec.node_name, "creating execution backend");
        let backend = self.factory.create_backend(spec)?;
        let bundles = self.index_new_backend(&backend);
        self.seed_bundles(&backend, &bundles);
        self.notify_added(&backend);
        Ok(backend)
    }

    /// Associates an execution backend with a project and puts the project's
    /// code root on the node's search path. Duplicate associations are
    /// ignored.
    pub fn add_execution_backend(&self, project: &Project, backend: &Arc<Backend>) {
        {
            let mut state = self.state.lock();
            let entry = state
                .execution_by_project
                .entry(project.name.clone())
                .or_insert_with(|| ProjectBackends {
                    project: project.clone(),
                    backends: Vec::new(),
                });
            if entry.backends.iter().any(|b| Arc::ptr_eq(b, backend)) {
                return;
            }
            entry.backends.push(backend.clone());
        }
        backend.add_project_path(project);
    }

    /// Dissolves a project/backend association and releases the project path
    /// reference taken by [`Self::add_execution_backend`].
    pub fn remove_execution_backend(&self, project: &Project, backend: &Arc<Backend>) {
        let removed = {
            let mut state = self.state.lock();
            match state.execution_by_project.get_mut(&project.name) {
                Some(entry) => match entry.backends.iter().position(|b| Arc::ptr_eq(b, backend)) {
                    Some(pos) => {
                        entry.backends.remove(pos);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if removed {
            backend.remove_project_path(project);
        }
    }

    pub fn get_execution_backends(&self, project: &Project) -> Vec<Arc<Backend>> {
        self.state
            .lock()
            .execution_by_project
            .get(&project.name)
            .map(|entry| entry.backends.clone())
            .unwrap_or_default()
    }

    /// Reconciles against a batch of node up/down reports from the discovery
    /// feed. Short names are qualified with `host` before matching.
    pub fn update_node_status(&self, host: &str, started: &[&str], stopped: &[&str]) {
        for name in started {
            // Up reports carry no action today; the feed is only consumed to
            // reap execution backends whose node died.
            debug!(node = %format!("{name}@{host}"), "node reported up");
        }
        for name in stopped {
            self.remote_node_down(&format!("{name}@{host}"));
        }
    }

    fn remote_node_down(&self, node: &str) {
        let mut lost: Vec<(Project, Arc<Backend>)> = Vec::new();
        {
            let mut state = self.state.lock();
            for entry in state.execution_by_project.values_mut() {
                // Prefix match: launch-assigned node names may carry suffixes
                // the discovery feed does not report. At most one backend per
                // project is reaped per report.
                let pos = entry
                    .backends
                    .iter()
                    .position(|b| b.qualified_node_name().starts_with(node));
                if let Some(pos) = pos {
                    let backend = entry.backends.remove(pos);
                    lost.push((entry.project.clone(), backend));
                }
            }
        }
        for (project, backend) in lost {
            warn!(node, project = %project.name, "execution backend lost its node");
            backend.remove_project_path(&project);
            self.dispose_backend(&backend);
        }
    }

    /// Registers a code bundle and distributes it to every live backend.
    /// Future backends receive it at creation. Re-registering an owner is a
    /// no-op.
    pub fn add_bundle(
        &self,
        owner: BundleOwner,
        paths: Vec<(PathBuf, CodeContext)>,
        inits: Vec<InitCall>,
    ) {
        let (bundle, backends) = {
            let mut state = self.state.lock();
            if state.bundles.iter().any(|b| b.owner() == &owner) {
                debug!(%owner, "bundle already registered");
                return;
            }
            let bundle = Arc::new(CodeBundle::new(owner, paths, inits));
            state.bundles.push(bundle.clone());
            (bundle, state.all.clone())
        };
        for backend in &backends {
            let loaded = backend.code().register(bundle.clone());
            for module in loaded {
                self.notify_module_loaded(backend, None, &module);
            }
        }
    }

    pub fn bundles(&self) -> Vec<Arc<CodeBundle>> {
        self.state.lock().bundles.clone()
    }

    /// Visits a snapshot of every registered backend. The visitor runs
    /// without any registry lock held.
    pub fn for_each_backend(&self, mut visitor: impl FnMut(&Arc<Backend>)) {
        let snapshot = self.state.lock().all.clone();
        for backend in &snapshot {
            visitor(backend);
        }
    }

    /// Channel of the backend connected to `node` (fully qualified name).
    pub fn get_by_name(&self, node: &str) -> Option<Arc<dyn NodeRpc>> {
        self.state
            .lock()
            .all
            .iter()
            .find(|b| b.qualified_node_name() == node)
            .map(|b| b.rpc())
    }

    /// Channel of any live backend whose runtime matches `version`'s major.
    pub fn get_by_version(&self, version: RuntimeVersion) -> Option<Arc<dyn NodeRpc>> {
        let major = version.as_major();
        self.state
            .lock()
            .all
            .iter()
            .find(|b| b.runtime().version.as_major() == major)
            .map(|b| b.rpc())
    }

    /// Channel of the build backend serving `project`, creating it on
    /// demand. Lookup misses and creation failures both come back as `None`;
    /// callers that need the cause use [`Self::get_build_backend`].
    pub fn get_by_project(&self, project: &Project) -> Option<Arc<dyn NodeRpc>> {
        match self.get_build_backend(project) {
            Ok(backend) => Some(backend.rpc()),
            Err(err) => {
                debug!(project = %project.name, %err, "no backend available for project");
                None
            }
        }
    }

    /// Re-publishes a module-loaded event, e.g. when a backend reports a
    /// load that happened outside bundle synchronization.
    pub fn module_loaded(&self, backend: &Arc<Backend>, project: Option<&Project>, module: &str) {
        self.notify_module_loaded(backend, project, module);
    }

    pub fn add_backend_listener(&self, listener: Arc<dyn BackendListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_backend_listener(&self, listener: &Arc<dyn BackendListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Tears one backend down: removes it from every index, disposes it, and
    /// publishes a removed-notification. The IDE backend is protected; asking
    /// to dispose it is ignored (only [`Self::dispose`] takes it down).
    pub fn dispose_backend(&self, backend: &Arc<Backend>) {
        if let Some(ide) = self.ide.read().clone() {
            if Arc::ptr_eq(&ide, backend) {
                debug!("ignoring request to dispose the IDE backend");
                return;
            }
        }
        // Unregister even when the backend was already disposed directly
        // through [`Backend::dispose`]; only the dispose/notify pair is
        // once-only.
        self.unregister(backend);
        if backend.is_disposed() {
            return;
        }
        backend.dispose();
        self.notify_removed(backend);
    }

    /// Full shutdown: build backends first, then the IDE backend, then
    /// whatever launch-tagged execution backends remain.
    pub fn dispose(&self) {
        info!("disposing all backends");
        let builds: Vec<Arc<Backend>> =
            self.state.lock().build_by_major.values().cloned().collect();
        for backend in builds {
            self.dispose_backend(&backend);
        }

        // Bind the taken value so the slot's write guard drops here; the
        // removed-notification below may re-enter the registry.
        let ide = self.ide.write().take();
        if let Some(ide) = ide {
            self.unregister(&ide);
            ide.dispose();
            self.notify_removed(&ide);
        }

        let launched: Vec<Arc<Backend>> = {
            let state = self.state.lock();
            state
                .all
                .iter()
                .filter(|b| b.launch().is_some())
                .cloned()
                .collect()
        };
        for backend in launched {
            self.dispose_backend(&backend);
        }
    }

    /// The backend started by `launch`, if it is still registered.
    pub fn get_backend_for_launch(&self, launch: LaunchId) -> Option<Arc<Backend>> {
        self.state
            .lock()
            .all
            .iter()
            .find(|b| b.launch() == Some(launch))
            .cloned()
    }

    /// Tears down every backend tied to `launch`. Safe to call for launches
    /// that never produced a backend or whose backend is already gone.
    pub fn terminate_backends_for_launch(&self, launch: LaunchId) {
        let matching: Vec<Arc<Backend>> = {
            let state = self.state.lock();
            state
                .all
                .iter()
                .filter(|b| b.launch() == Some(launch))
                .cloned()
                .collect()
        };
        for backend in matching {
            self.dispose_backend(&backend);
        }
    }

    /// Puts a freshly created backend into the all-backends index and
    /// returns the bundle snapshot it must be seeded with. One critical
    /// section, so a concurrent `add_bundle` either sees the backend or is
    /// included in the snapshot.
    fn index_new_backend(&self, backend: &Arc<Backend>) -> Vec<Arc<CodeBundle>> {
        let mut state = self.state.lock();
        state.all.push(backend.clone());
        state.bundles.clone()
    }

    fn seed_bundles(&self, backend: &Arc<Backend>, bundles: &[Arc<CodeBundle>]) {
        let mut loaded = Vec::new();
        {
            let mut code = backend.code();
            for bundle in bundles {
                loaded.extend(code.register(bundle.clone()));
            }
        }
        for module in loaded {
            self.notify_module_loaded(backend, None, &module);
        }
    }

    fn unregister(&self, backend: &Arc<Backend>) {
        let mut state = self.state.lock();
        state.all.retain(|b| !Arc::ptr_eq(b, backend));
        state.build_by_major.retain(|_, b| !Arc::ptr_eq(b, backend));
        for entry in state.execution_by_project.values_mut() {
            entry.backends.retain(|b| !Arc::ptr_eq(b, backend));
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn BackendListener>> {
        self.listeners.read().clone()
    }

    fn notify_added(&self, backend: &Arc<Backend>) {
        for listener in self.listeners_snapshot() {
            listener.runtime_added(backend);
        }
    }

    fn notify_removed(&self, backend: &Arc<Backend>) {
        for listener in self.listeners_snapshot() {
            listener.runtime_removed(backend);
        }
    }

    fn notify_module_loaded(&self, backend: &Arc<Backend>, project: Option<&Project>, module: &str) {
        for listener in self.listeners_snapshot() {
            listener.module_loaded(backend, project, module);
        }
    }
}
