/*!
 * Error types for Orbit Mirror
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::config::ContextId;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug)]
pub enum MirrorError {
    /// I/O error
    Io(io::Error),

    /// Topology or option error
    Config(String),

    /// A `host:path` location that could not be parsed
    InvalidLocation(String),

    /// A duration string such as `1h30m` that could not be parsed
    InvalidDuration(String),

    /// Fingerprint store could not be read or written
    Store { path: PathBuf, message: String },

    /// The external transfer tool could not be run
    Transfer(String),

    /// A context id that the loaded topology does not know
    UnknownContext(ContextId),

    /// PID file could not be created, read or honoured
    PidFile(String),

    /// Generic error with message
    Other(String),
}

impl MirrorError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_FATAL
        } else {
            EXIT_PARTIAL
        }
    }

    /// Configuration-class errors end the process; everything else is
    /// retried on the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MirrorError::Config(_)
                | MirrorError::InvalidLocation(_)
                | MirrorError::InvalidDuration(_)
                | MirrorError::UnknownContext(_)
                | MirrorError::PidFile(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            MirrorError::Io(_) => ErrorCategory::IoError,
            MirrorError::Config(_)
            | MirrorError::InvalidLocation(_)
            | MirrorError::InvalidDuration(_)
            | MirrorError::UnknownContext(_) => ErrorCategory::Configuration,
            MirrorError::Store { .. } => ErrorCategory::Store,
            MirrorError::Transfer(_) => ErrorCategory::Transfer,
            MirrorError::PidFile(_) => ErrorCategory::Process,
            MirrorError::Other(_) => ErrorCategory::Unknown,
        }
    }

    pub(crate) fn store(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        MirrorError::Store {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// I/O operation errors
    IoError,
    /// Topology, option and argument errors
    Configuration,
    /// Fingerprint store persistence
    Store,
    /// External transfer tool
    Transfer,
    /// PID file and signalling
    Process,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Transfer => write!(f, "transfer"),
            ErrorCategory::Process => write!(f, "process"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            MirrorError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            MirrorError::InvalidLocation(loc) => {
                write!(f, "Invalid location '{}': expected host:path", loc)
            }
            MirrorError::InvalidDuration(text) => {
                write!(f, "Invalid duration '{}': expected e.g. 1d2h3m4s", text)
            }
            MirrorError::Store { path, message } => {
                write!(f, "State store {}: {}", path.display(), message)
            }
            MirrorError::Transfer(msg) => {
                write!(f, "Transfer error: {}", msg)
            }
            MirrorError::UnknownContext(id) => {
                write!(f, "Unknown context {}", id)
            }
            MirrorError::PidFile(msg) => {
                write!(f, "PID file error: {}", msg)
            }
            MirrorError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MirrorError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for MirrorError {
    fn from(err: io::Error) -> Self {
        MirrorError::Io(err)
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Other(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(err: toml::de::Error) -> Self {
        MirrorError::Config(format!("TOML parse error: {}", err))
    }
}
