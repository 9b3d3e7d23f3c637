//! Shared data types for the Harbor backend core.
//!
//! Everything here is plain data: runtime versions and install descriptions,
//! qualified node names, and the slice of the workspace-project model the
//! backend core actually needs. The registry and code-distribution crates
//! build on these.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of an installed runtime, e.g. `25.3.2`.
///
/// Build backends are shared per *major* version, so [`RuntimeVersion::as_major`]
/// is the key most callers actually want.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn major(major: u32) -> Self {
        Self::new(major, 0, 0)
    }

    /// Drops minor/patch; two runtimes with equal majors are
    /// build-compatible and share a build backend.
    pub fn as_major(self) -> Self {
        Self::major(self.major)
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if self.minor != 0 || self.patch != 0 {
            write!(f, ".{}", self.minor)?;
        }
        if self.patch != 0 {
            write!(f, ".{}", self.patch)?;
        }
        Ok(())
    }
}

/// Error returned when parsing a [`RuntimeVersion`] from a string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid runtime version `{input}`")]
pub struct ParseVersionError {
    pub input: String,
}

impl FromStr for RuntimeVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError {
            input: s.to_string(),
        };
        let mut parts = s.split('.');
        let mut next = |required: bool| -> Result<Option<u32>, ParseVersionError> {
            match parts.next() {
                Some(part) => part.parse::<u32>().map(Some).map_err(|_| err()),
                None if required => Err(err()),
                None => Ok(None),
            }
        };

        let major = next(true)?.ok_or_else(err)?;
        let minor = next(false)?.unwrap_or(0);
        let patch = next(false)?.unwrap_or(0);
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self::new(major, minor, patch))
    }
}

/// One installed runtime: a human-readable name, its version, and where it
/// lives on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: RuntimeVersion,
    pub home: PathBuf,
}

impl RuntimeInfo {
    pub fn new(name: impl Into<String>, version: RuntimeVersion, home: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version,
            home: home.into(),
        }
    }
}

/// Qualified identity of a runtime node: `short@host`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeName {
    short: String,
    host: String,
}

impl NodeName {
    pub fn new(short: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            short: short.into(),
            host: host.into(),
        }
    }

    /// Parses `short@host`. A bare short name gets the local host.
    pub fn parse(name: &str) -> Self {
        match name.split_once('@') {
            Some((short, host)) => Self::new(short, host),
            None => Self::new(name, "localhost"),
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.short, self.host)
    }
}

/// The view of a workspace project the backend core needs: identity, a root
/// path to push onto execution backends' search paths, and the runtime
/// version the project requires (if any is configured).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub root: PathBuf,
    pub runtime_version: Option<RuntimeVersion>,
}

impl Project {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            runtime_version: None,
        }
    }

    pub fn with_runtime_version(mut self, version: RuntimeVersion) -> Self {
        self.runtime_version = Some(version);
        self
    }
}
