//! RPC-channel boundary contract for talking to a connected runtime node.
//!
//! The backend core treats the wire protocol as opaque: this crate only
//! defines the handful of synchronous operations the core invokes on a
//! connected node (search-path manipulation, binary module load/delete, and
//! two probes), plus [`MockNodeRpc`], a deterministic in-memory double used
//! throughout the test suites.
//!
//! Calls are blocking with respect to their caller and are never retried by
//! the core; a caller that needs a timeout must wrap the call externally.

mod mock;

use std::path::Path;

use thiserror::Error;

pub use mock::{MockNodeRpc, RpcCall};

/// Where a search-path entry is inserted relative to existing entries.
///
/// `Prepend` entries are searched first and shadow everything behind them;
/// `Append` entries are searched last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathPriority {
    Prepend,
    Append,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("module `{module}` rejected by runtime: {reason}")]
    LoadRejected { module: String, reason: String },
}

/// Synchronous request/response channel to one runtime node.
///
/// Implementations serialize their own traffic; channels belonging to
/// different nodes proceed fully in parallel. A channel is shared between the
/// code-distribution manager and registry lookups, hence `&self` methods.
pub trait NodeRpc: Send + Sync {
    /// Adds `path` to the node's live module search path.
    fn add_search_path(&self, priority: PathPriority, path: &Path) -> Result<(), RpcError>;

    /// Removes `path` from the node's live module search path.
    fn remove_search_path(&self, path: &Path) -> Result<(), RpcError>;

    /// Pushes a compiled module directly into the node, bypassing the
    /// filesystem search path.
    fn load_binary_module(&self, name: &str, bytes: &[u8]) -> Result<(), RpcError>;

    /// Purges a previously loaded module from the node.
    fn delete_module(&self, name: &str) -> Result<(), RpcError>;

    /// Whether `path` is readable from the node's side of the connection.
    fn is_path_reachable(&self, path: &Path) -> Result<bool, RpcError>;

    /// Whether the node runs in embedded/self-contained mode, where code is
    /// never read off the filesystem search path.
    fn is_embedded(&self) -> Result<bool, RpcError>;

    /// Signals the underlying connection to close. In-flight calls are
    /// expected to fail naturally once the channel drops; nothing is
    /// forcibly interrupted.
    fn close(&self);
}
