/*!
 * Orbit Mirror - serverless tree replication with fingerprint tracking
 *
 * Every host scans its own trees, keeps a durable per-file fingerprint
 * store, and publishes that store to its peer with the same transfer tool
 * that moves the data. The source side compares the stores its replicas
 * published to report completion and staleness:
 * - Incremental scanning that re-hashes only files whose stat changed
 * - Sampled SHA-256 digests for very large files
 * - Crash-safe JSON stores with lazy flushing and corrupt-file quarantine
 * - Replica cycles that rescan and publish while the pull is running
 * - rsync transfer backend, plus an in-process backend for local setups
 *
 * Version: 0.1.0
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod config;
pub mod core;
pub mod error;
pub mod location;
pub mod logging;
pub mod node;
pub mod pidfile;
pub mod transfer;

// Re-export commonly used types
pub use config::{Context, ContextId, OptionValue, Settings, Topology};
pub use core::{evaluate, ConsistencyReport, Fingerprint, FingerprintStore, Scanner};
pub use error::{MirrorError, Result};
pub use location::Location;
pub use node::{Lifecycle, LifecycleHandle, Node};
pub use transfer::{LocalTransfer, RsyncTransfer, Transfer, TransferRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
