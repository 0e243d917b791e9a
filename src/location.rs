/*!
 * `host:path` locations as written in the topology file
 */

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{MirrorError, Result};

/// A tree on a named host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub host: String,
    pub path: PathBuf,
}

impl Location {
    pub fn new(host: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }

    /// Parse `"host:path"`, splitting on the first colon only
    pub fn parse(text: &str) -> Result<Self> {
        let (host, path) = text
            .trim()
            .split_once(':')
            .ok_or_else(|| MirrorError::InvalidLocation(text.to_string()))?;
        if host.is_empty() || path.is_empty() {
            return Err(MirrorError::InvalidLocation(text.to_string()));
        }
        Ok(Self::new(host, path))
    }

    pub fn is_on(&self, host: &str) -> bool {
        self.host == host
    }

    /// Same host, different path
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self::new(self.host.clone(), path)
    }

    /// A sibling location below this tree, e.g. its control directory
    pub fn join(&self, child: impl AsRef<Path>) -> Self {
        self.with_path(self.path.join(child))
    }

    /// Rendering with a trailing slash, so the transfer tool copies the
    /// directory's contents instead of nesting the directory itself
    pub fn as_dir_source(&self) -> String {
        let rendered = self.to_string();
        if rendered.ends_with('/') {
            rendered
        } else {
            format!("{}/", rendered)
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path.display())
    }
}

impl FromStr for Location {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        Location::parse(s)
    }
}

/// Host part of a `host:path` string (everything before the first colon)
pub fn host_of(text: &str) -> &str {
    text.split_once(':').map(|(host, _)| host).unwrap_or(text)
}

/// Path part of a `host:path` string (everything after the first colon)
pub fn path_of(text: &str) -> &str {
    text.split_once(':').map(|(_, path)| path).unwrap_or("")
}
