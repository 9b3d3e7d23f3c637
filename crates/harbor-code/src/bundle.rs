use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

/// Extension of compiled module files distributable to a runtime node.
pub(crate) const MODULE_FILE_EXTENSION: &str = "beam";

/// Identity of the component contributing a [`CodeBundle`].
///
/// A given owner is registered at most once registry-wide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleOwner(String);

impl BundleOwner {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleOwner {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Usage context a declared bundle path applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeContext {
    Any,
    Common,
    Builder,
    Ide,
    Debugger,
}

/// An initialization hook run on the node once the bundle's code is loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitCall {
    pub module: String,
    pub function: String,
}

impl InitCall {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }
}

/// Immutable descriptor of code contributed by one component: where the
/// compiled modules live and which init hooks to run after loading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeBundle {
    owner: BundleOwner,
    paths: Vec<(PathBuf, CodeContext)>,
    inits: Vec<InitCall>,
}

impl CodeBundle {
    pub fn new(
        owner: BundleOwner,
        paths: Vec<(PathBuf, CodeContext)>,
        inits: Vec<InitCall>,
    ) -> Self {
        Self {
            owner,
            paths,
            inits,
        }
    }

    pub fn owner(&self) -> &BundleOwner {
        &self.owner
    }

    pub fn paths(&self) -> &[(PathBuf, CodeContext)] {
        &self.paths
    }

    pub fn inits(&self) -> &[InitCall] {
        &self.inits
    }
}

/// Derives the module name from a compiled-module file path.
///
/// Returns `None` for anything that is not a `.beam` file or whose stem is
/// not valid UTF-8.
pub fn module_name_for_file(path: &Path) -> Option<String> {
    if path.extension() != Some(OsStr::new(MODULE_FILE_EXTENSION)) {
        return None;
    }
    path.file_stem()
        .and_then(OsStr::to_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_from_beam_file() {
        assert_eq!(
            module_name_for_file(Path::new("/x/ebin/lists_util.beam")),
            Some("lists_util".to_string())
        );
    }

    #[test]
    fn non_module_files_are_ignored() {
        assert_eq!(module_name_for_file(Path::new("/x/ebin/app.config")), None);
        assert_eq!(module_name_for_file(Path::new("/x/ebin/readme")), None);
        assert_eq!(module_name_for_file(Path::new("/x/src/lists_util.erl")), None);
    }
}
