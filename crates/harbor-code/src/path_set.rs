use std::path::{Path, PathBuf};

/// One search-path entry plus the number of consumers holding it.
///
/// The count is at least 1 for as long as the item exists; the entry is
/// evicted in the same call that decrements it to zero.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PathItem {
    path: PathBuf,
    refs: usize,
}

/// Ordered, reference-counted set of search-path entries.
///
/// `add`/`remove` return whether the *live* membership changed, which is
/// exactly when the owning [`CodeManager`](crate::CodeManager) must mirror
/// the change to the node over RPC. Duplicate adds and non-final removes are
/// pure bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct PathSet {
    items: Vec<PathItem>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only when `path` was inserted for the first time.
    pub fn add(&mut self, path: &Path) -> bool {
        match self.items.iter_mut().find(|item| item.path == path) {
            Some(item) => {
                item.refs += 1;
                false
            }
            None => {
                self.items.push(PathItem {
                    path: path.to_path_buf(),
                    refs: 1,
                });
                true
            }
        }
    }

    /// Returns `true` only when the last reference was released and the
    /// entry was evicted. Removing an absent path is a no-op.
    pub fn remove(&mut self, path: &Path) -> bool {
        let Some(pos) = self.items.iter().position(|item| item.path == path) else {
            return false;
        };
        self.items[pos].refs -= 1;
        if self.items[pos].refs == 0 {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.items.iter().any(|item| item.path == path)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot of member paths in insertion order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.items.iter().map(|item| item.path.clone()).collect()
    }
}
