/*!
 * Bulk transfer collaborator
 *
 * The node never moves file content itself. A [`Transfer`] implementation
 * copies a tree (or a single store file) between locations, streams its log
 * lines, and reports an exit status. Only the status is acted on.
 */

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::location::Location;

pub mod local;
pub mod rsync;

pub use local::LocalTransfer;
pub use rsync::RsyncTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Copy the contents of the source directory into the destination
    Tree,
    /// Copy one file into the destination directory
    File,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: Location,
    pub destination: Location,
    pub kind: TransferKind,
    /// Extra flags without leading dashes, e.g. `delete`, `bwlimit=10m`
    pub flags: Vec<String>,
    /// Exclusion patterns: `*suffix` or an exact file name
    pub excludes: Vec<String>,
    pub timeout: Duration,
    /// Log tool output at DEBUG instead of INFO
    pub quiet: bool,
}

impl TransferRequest {
    pub fn tree(source: Location, destination: Location) -> Self {
        Self {
            source,
            destination,
            kind: TransferKind::Tree,
            flags: Vec::new(),
            excludes: Vec::new(),
            timeout: Duration::from_secs(180),
            quiet: false,
        }
    }

    pub fn file(source: Location, destination: Location) -> Self {
        Self {
            kind: TransferKind::File,
            quiet: true,
            ..Self::tree(source, destination)
        }
    }

    pub fn with_flags(mut self, flags: &[String]) -> Self {
        self.flags = flags.to_vec();
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn deletes_extraneous(&self) -> bool {
        self.flags.iter().any(|flag| flag == "delete")
    }
}

/// Exclusion pattern matching a name suffix
pub fn suffix_pattern(suffix: &str) -> String {
    format!("*{}", suffix)
}

/// Whether `name` matches one of the `*suffix` / exact-name patterns
pub fn is_excluded(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Exit status; `None` when the tool was killed by a signal or not run
    pub status: Option<i32>,
    pub lines: usize,
}

impl TransferOutcome {
    pub fn completed() -> Self {
        Self {
            status: Some(0),
            lines: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Moves bytes between locations
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Run the transfer to completion. An `Err` means the tool could not be
    /// run at all; a non-zero exit is reported through the outcome.
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome>;
}
