//! Code distribution for connected runtime nodes.
//!
//! Each backend owns one [`CodeManager`] that keeps the node's module search
//! path in sync (reference-counted, so independent consumers can share a
//! path) and distributes [`CodeBundle`]s: bundle code reaches the node either
//! by extending its search path or, when the path is unreachable or the
//! runtime is embedded, by pushing compiled module files over the RPC channel
//! one by one.

mod bundle;
mod manager;
mod path_set;

pub use bundle::{module_name_for_file, BundleOwner, CodeBundle, CodeContext, InitCall};
pub use manager::CodeManager;
pub use path_set::PathSet;
