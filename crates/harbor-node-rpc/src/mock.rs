use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{NodeRpc, PathPriority, RpcError};

/// One recorded call against a [`MockNodeRpc`], in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcCall {
    AddSearchPath {
        priority: PathPriority,
        path: PathBuf,
    },
    RemoveSearchPath {
        path: PathBuf,
    },
    LoadModule {
        name: String,
        len: usize,
    },
    DeleteModule {
        name: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<RpcCall>,
    search_path: Vec<PathBuf>,
    loaded_modules: Vec<String>,
    reachable: BTreeSet<PathBuf>,
    failing_modules: HashMap<String, String>,
    embedded: bool,
    closed: bool,
}

/// Deterministic, in-memory runtime-node test double.
///
/// Records every call in order, maintains the node's live search path and
/// loaded-module set, and supports per-module failure injection.
#[derive(Default)]
pub struct MockNodeRpc {
    state: Mutex<MockState>,
}

impl MockNodeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_embedded(&self, embedded: bool) {
        self.state.lock().embedded = embedded;
    }

    /// Marks a path as readable from the node's side.
    pub fn mark_reachable(&self, path: impl Into<PathBuf>) {
        self.state.lock().reachable.insert(path.into());
    }

    /// Makes every subsequent load of `module` fail with the given reason.
    pub fn fail_module(&self, module: impl Into<String>, reason: impl Into<String>) {
        self.state
            .lock()
            .failing_modules
            .insert(module.into(), reason.into());
    }

    /// Simulates a runtime restart: the live search path and loaded modules
    /// vanish, but the channel stays usable.
    pub fn reset_runtime(&self) {
        let mut state = self.state.lock();
        state.search_path.clear();
        state.loaded_modules.clear();
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn search_path(&self) -> Vec<PathBuf> {
        self.state.lock().search_path.clone()
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        self.state.lock().loaded_modules.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl NodeRpc for MockNodeRpc {
    fn add_search_path(&self, priority: PathPriority, path: &Path) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        state.calls.push(RpcCall::AddSearchPath {
            priority,
            path: path.to_path_buf(),
        });
        match priority {
            PathPriority::Prepend => state.search_path.insert(0, path.to_path_buf()),
            PathPriority::Append => state.search_path.push(path.to_path_buf()),
        }
        Ok(())
    }

    fn remove_search_path(&self, path: &Path) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        state.calls.push(RpcCall::RemoveSearchPath {
            path: path.to_path_buf(),
        });
        state.search_path.retain(|p| p != path);
        Ok(())
    }

    fn load_binary_module(&self, name: &str, bytes: &[u8]) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        state.calls.push(RpcCall::LoadModule {
            name: name.to_string(),
            len: bytes.len(),
        });
        if let Some(reason) = state.failing_modules.get(name) {
            return Err(RpcError::LoadRejected {
                module: name.to_string(),
                reason: reason.clone(),
            });
        }
        if !state.loaded_modules.iter().any(|m| m == name) {
            state.loaded_modules.push(name.to_string());
        }
        Ok(())
    }

    fn delete_module(&self, name: &str) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        state.calls.push(RpcCall::DeleteModule {
            name: name.to_string(),
        });
        state.loaded_modules.retain(|m| m != name);
        Ok(())
    }

    fn is_path_reachable(&self, path: &Path) -> Result<bool, RpcError> {
        let state = self.state.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        Ok(state.reachable.contains(path))
    }

    fn is_embedded(&self) -> Result<bool, RpcError> {
        let state = self.state.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        Ok(state.embedded)
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}
