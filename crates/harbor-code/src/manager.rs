use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use harbor_core::RuntimeInfo;
use harbor_node_rpc::{NodeRpc, PathPriority};

use crate::bundle::{module_name_for_file, BundleOwner, CodeBundle};
use crate::path_set::PathSet;

/// Per-backend code distribution: keeps the node's module search path in
/// sync with the reference-counted [`PathSet`]s and synchronizes registered
/// [`CodeBundle`]s against the node.
///
/// Not internally synchronized — the owning backend funnels all calls
/// through one mutex, so at most one mutator runs at a time.
pub struct CodeManager {
    rpc: Arc<dyn NodeRpc>,
    runtime: RuntimeInfo,
    prepend: PathSet,
    append: PathSet,
    bundles: Vec<Arc<CodeBundle>>,
}

impl CodeManager {
    pub fn new(rpc: Arc<dyn NodeRpc>, runtime: RuntimeInfo) -> Self {
        Self {
            rpc,
            runtime,
            prepend: PathSet::new(),
            append: PathSet::new(),
            bundles: Vec::new(),
        }
    }

    /// Adds a reference to `path`. Only the first reference issues a live
    /// search-path extension on the node; duplicates are silent ref bumps.
    pub fn add_path(&mut self, priority: PathPriority, path: &Path) {
        let set = match priority {
            PathPriority::Prepend => &mut self.prepend,
            PathPriority::Append => &mut self.append,
        };
        if set.add(path) {
            if let Err(err) = self.rpc.add_search_path(priority, path) {
                warn!(
                    runtime = %self.runtime.name,
                    path = %path.display(),
                    %err,
                    "failed to extend search path"
                );
            }
        }
    }

    /// Releases a reference to `path` in the prepend set; the node's search
    /// path is only touched when the last reference goes away.
    ///
    /// Append-set entries are torn down with the backend, never
    /// individually, so no removal is exposed for them.
    pub fn remove_path(&mut self, path: &Path) {
        if self.prepend.remove(path) {
            if let Err(err) = self.rpc.remove_search_path(path) {
                warn!(
                    runtime = %self.runtime.name,
                    path = %path.display(),
                    %err,
                    "failed to remove search path"
                );
            }
        }
    }

    /// Registers a bundle and synchronizes it against the node.
    ///
    /// Returns the names of modules binary-pushed during this call so the
    /// registry can re-emit them as module-loaded notifications. Registering
    /// an owner twice with the same manager is a no-op.
    pub fn register(&mut self, bundle: Arc<CodeBundle>) -> Vec<String> {
        if self.find_bundle(bundle.owner()).is_some() {
            debug!(owner = %bundle.owner(), "bundle already registered with this backend");
            return Vec::new();
        }
        self.bundles.push(bundle.clone());
        self.sync_bundle(&bundle)
    }

    /// Unregisters the bundle owned by `owner`, if any, and unconditionally
    /// purges every module the bundle's declared locations contain. Unlike
    /// path removal there is no ref counting here.
    pub fn unregister(&mut self, owner: &BundleOwner) {
        let Some(pos) = self.find_bundle(owner) else {
            return;
        };
        let bundle = self.bundles.remove(pos);
        debug!(owner = %bundle.owner(), runtime = %self.runtime.name, "unloading bundle");
        for (dir, _context) in bundle.paths() {
            for file in module_files(dir) {
                if let Some(name) = module_name_for_file(&file) {
                    if let Err(err) = self.rpc.delete_module(&name) {
                        warn!(module = %name, %err, "failed to purge module");
                    }
                }
            }
        }
    }

    /// Re-synchronizes every registered bundle, e.g. after the node's
    /// runtime restarted and lost its search path and loaded modules.
    pub fn re_register_bundles(&mut self) -> Vec<String> {
        let bundles: Vec<Arc<CodeBundle>> = self.bundles.clone();
        let mut loaded = Vec::new();
        for bundle in &bundles {
            loaded.extend(self.sync_bundle(bundle));
        }
        loaded
    }

    pub fn registered_bundles(&self) -> &[Arc<CodeBundle>] {
        &self.bundles
    }

    pub fn prepend_paths(&self) -> Vec<PathBuf> {
        self.prepend.paths()
    }

    pub fn append_paths(&self) -> Vec<PathBuf> {
        self.append.paths()
    }

    fn find_bundle(&self, owner: &BundleOwner) -> Option<usize> {
        self.bundles.iter().position(|b| b.owner() == owner)
    }

    /// One synchronization pass for one bundle.
    ///
    /// 1. A developer override location that the node can reach wins
    ///    outright and short-circuits the declared paths.
    /// 2. A declared path the node can reach is added to the prepend path,
    ///    unless the runtime is embedded and never reads the search path.
    /// 3. Everything else falls back to pushing the compiled modules over
    ///    the channel one by one.
    fn sync_bundle(&mut self, bundle: &CodeBundle) -> Vec<String> {
        if let Some(dir) = external_override(bundle.owner()) {
            if self.probe_reachable(&dir) {
                debug!(
                    owner = %bundle.owner(),
                    path = %dir.display(),
                    runtime = %self.runtime.name,
                    "using external override location"
                );
                self.add_path(PathPriority::Prepend, &dir);
                return Vec::new();
            }
            info!(
                owner = %bundle.owner(),
                path = %dir.display(),
                "external override location not reachable, using bundled code"
            );
        }

        let embedded = match self.rpc.is_embedded() {
            Ok(embedded) => embedded,
            Err(err) => {
                warn!(runtime = %self.runtime.name, %err, "embedded-mode probe failed");
                false
            }
        };

        let mut loaded = Vec::new();
        for (path, _context) in bundle.paths() {
            if self.probe_reachable(path) && !embedded {
                debug!(
                    owner = %bundle.owner(),
                    path = %path.display(),
                    runtime = %self.runtime.name,
                    "adding bundle path to search path"
                );
                self.add_path(PathPriority::Prepend, path);
            } else {
                loaded.extend(self.push_modules(bundle, path));
            }
        }
        loaded
    }

    /// Binary push: loads every compiled module under `dir` directly into
    /// the node. Individual failures are logged and skipped; the batch
    /// continues.
    fn push_modules(&mut self, bundle: &CodeBundle, dir: &Path) -> Vec<String> {
        debug!(
            owner = %bundle.owner(),
            path = %dir.display(),
            runtime = %self.runtime.name,
            "pushing binary modules"
        );
        let mut loaded = Vec::new();
        for file in module_files(dir) {
            let Some(name) = module_name_for_file(&file) else {
                continue;
            };
            let bytes = match std::fs::read(&file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(module = %name, file = %file.display(), %err, "skipping unreadable module file");
                    continue;
                }
            };
            match self.rpc.load_binary_module(&name, &bytes) {
                Ok(()) => loaded.push(name),
                Err(err) => {
                    warn!(module = %name, %err, "module load failed, skipping");
                }
            }
        }
        loaded
    }

    fn probe_reachable(&self, path: &Path) -> bool {
        match self.rpc.is_path_reachable(path) {
            Ok(reachable) => reachable,
            Err(err) => {
                warn!(path = %path.display(), %err, "reachability probe failed");
                false
            }
        }
    }
}

/// Compiled module files under `dir`, in stable (sorted) order.
fn module_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| module_name_for_file(path).is_some())
        .collect();
    files.sort();
    files
}

/// Developer override: an environment variable keyed by the bundle owner's
/// identity can point at a locally built copy of the bundle's code.
fn external_override(owner: &BundleOwner) -> Option<PathBuf> {
    std::env::var_os(override_var_name(owner)).map(PathBuf::from)
}

fn override_var_name(owner: &BundleOwner) -> String {
    let mut name: String = owner
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    name.push_str("_CODE_PATH");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    use harbor_core::RuntimeVersion;
    use harbor_node_rpc::{MockNodeRpc, RpcCall};

    use crate::CodeContext;

    fn runtime() -> RuntimeInfo {
        RuntimeInfo::new("test-runtime", RuntimeVersion::major(25), "/opt/runtime")
    }

    fn manager(rpc: &Arc<MockNodeRpc>) -> CodeManager {
        CodeManager::new(rpc.clone(), runtime())
    }

    fn bundle(owner: &str, paths: Vec<(PathBuf, CodeContext)>) -> Arc<CodeBundle> {
        Arc::new(CodeBundle::new(BundleOwner::new(owner), paths, Vec::new()))
    }

    fn write_module(dir: &Path, name: &str) -> PathBuf {
        let file = dir.join(format!("{name}.beam"));
        std::fs::write(&file, b"fake module bytes").unwrap();
        file
    }

    #[test]
    fn duplicate_path_add_is_silent() {
        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);

        mgr.add_path(PathPriority::Prepend, Path::new("/x/ebin"));
        mgr.add_path(PathPriority::Prepend, Path::new("/x/ebin"));

        assert_eq!(rpc.calls().len(), 1);
        assert_eq!(rpc.search_path(), vec![PathBuf::from("/x/ebin")]);
    }

    #[test]
    fn path_removed_from_node_only_at_zero_refs() {
        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);

        mgr.add_path(PathPriority::Prepend, Path::new("/x"));
        mgr.add_path(PathPriority::Prepend, Path::new("/x"));
        mgr.remove_path(Path::new("/x"));
        assert_eq!(rpc.search_path(), vec![PathBuf::from("/x")]);

        mgr.remove_path(Path::new("/x"));
        assert!(rpc.search_path().is_empty());
        // one add + one remove on the wire, regardless of ref churn
        assert_eq!(rpc.calls().len(), 2);
    }

    #[test]
    fn remove_path_ignores_append_entries() {
        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);

        mgr.add_path(PathPriority::Append, Path::new("/perm"));
        mgr.remove_path(Path::new("/perm"));

        assert_eq!(rpc.search_path(), vec![PathBuf::from("/perm")]);
        assert_eq!(mgr.append_paths(), vec![PathBuf::from("/perm")]);
    }

    #[test]
    fn reachable_path_joins_search_path_without_pushing() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha");

        let rpc = MockNodeRpc::new();
        rpc.mark_reachable(dir.path());
        let mut mgr = manager(&rpc);

        let loaded = mgr.register(bundle(
            "tools",
            vec![(dir.path().to_path_buf(), CodeContext::Common)],
        ));

        assert!(loaded.is_empty());
        assert_eq!(rpc.search_path(), vec![dir.path().to_path_buf()]);
        assert!(rpc.loaded_modules().is_empty());
    }

    #[test]
    fn unreachable_path_falls_back_to_binary_push() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha");
        write_module(dir.path(), "beta");

        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);

        let loaded = mgr.register(bundle(
            "tools",
            vec![(dir.path().to_path_buf(), CodeContext::Common)],
        ));

        assert_eq!(loaded, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(rpc.loaded_modules(), vec!["alpha".to_string(), "beta".to_string()]);
        assert!(rpc.search_path().is_empty());
    }

    #[test]
    fn embedded_runtime_forces_binary_push_even_when_reachable() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha");

        let rpc = MockNodeRpc::new();
        rpc.mark_reachable(dir.path());
        rpc.set_embedded(true);
        let mut mgr = manager(&rpc);

        let loaded = mgr.register(bundle(
            "tools",
            vec![(dir.path().to_path_buf(), CodeContext::Common)],
        ));

        assert_eq!(loaded, vec!["alpha".to_string()]);
        assert!(rpc.search_path().is_empty());
    }

    #[test]
    fn failed_module_load_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "bad");
        write_module(dir.path(), "good");

        let rpc = MockNodeRpc::new();
        rpc.fail_module("bad", "rejected");
        let mut mgr = manager(&rpc);

        let loaded = mgr.register(bundle(
            "tools",
            vec![(dir.path().to_path_buf(), CodeContext::Common)],
        ));

        assert_eq!(loaded, vec!["good".to_string()]);
        assert_eq!(rpc.loaded_modules(), vec!["good".to_string()]);
    }

    #[test]
    fn register_is_idempotent_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha");

        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);
        let b = bundle("tools", vec![(dir.path().to_path_buf(), CodeContext::Common)]);

        let first = mgr.register(b.clone());
        let second = mgr.register(b);

        assert_eq!(first, vec!["alpha".to_string()]);
        assert!(second.is_empty());
        assert_eq!(mgr.registered_bundles().len(), 1);
    }

    #[test]
    fn unregister_purges_every_module() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha");
        write_module(dir.path(), "beta");

        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);
        mgr.register(bundle(
            "tools",
            vec![(dir.path().to_path_buf(), CodeContext::Common)],
        ));

        mgr.unregister(&BundleOwner::new("tools"));

        assert!(mgr.registered_bundles().is_empty());
        assert!(rpc.loaded_modules().is_empty());
        let deletes: Vec<_> = rpc
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RpcCall::DeleteModule { .. }))
            .collect();
        assert_eq!(deletes.len(), 2);
    }

    #[test]
    fn unregister_of_unknown_owner_is_noop() {
        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);
        mgr.unregister(&BundleOwner::new("nobody"));
        assert!(rpc.calls().is_empty());
    }

    #[test]
    fn re_register_replays_after_runtime_restart() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha");

        let rpc = MockNodeRpc::new();
        let mut mgr = manager(&rpc);
        mgr.register(bundle(
            "tools",
            vec![(dir.path().to_path_buf(), CodeContext::Common)],
        ));
        assert_eq!(rpc.loaded_modules(), vec!["alpha".to_string()]);

        rpc.reset_runtime();
        assert!(rpc.loaded_modules().is_empty());

        let loaded = mgr.re_register_bundles();
        assert_eq!(loaded, vec!["alpha".to_string()]);
        assert_eq!(rpc.loaded_modules(), vec!["alpha".to_string()]);
    }

    #[test]
    fn reachable_override_location_wins() {
        let override_dir = tempfile::tempdir().unwrap();
        let declared = tempfile::tempdir().unwrap();
        write_module(declared.path(), "alpha");

        // Owner name is unique to this test; env vars are process-global.
        std::env::set_var(
            "OVERRIDE_PROBE_CODE_PATH",
            override_dir.path().as_os_str(),
        );

        let rpc = MockNodeRpc::new();
        rpc.mark_reachable(override_dir.path());
        let mut mgr = manager(&rpc);

        let loaded = mgr.register(bundle(
            "override-probe",
            vec![(declared.path().to_path_buf(), CodeContext::Common)],
        ));

        assert!(loaded.is_empty());
        assert_eq!(rpc.search_path(), vec![override_dir.path().to_path_buf()]);
        assert!(rpc.loaded_modules().is_empty());

        std::env::remove_var("OVERRIDE_PROBE_CODE_PATH");
    }

    #[test]
    fn override_var_name_is_sanitized() {
        assert_eq!(
            override_var_name(&BundleOwner::new("my-tools.core")),
            "MY_TOOLS_CORE_CODE_PATH"
        );
    }
}
