/*!
 * Change detection and consistency tracking
 */

pub mod checksum;
pub mod consistency;
pub mod elapsed;
pub mod fingerprint;
pub mod scanner;
pub mod store;

pub use checksum::{file_digest, HashParams};
pub use consistency::{evaluate, ConsistencyReport, Freshness, ReplicaStatus};
pub use elapsed::{format_duration, parse_duration, ElapsedTimer};
pub use fingerprint::{ContentHash, Fingerprint, Timestamp};
pub use scanner::{ScanSummary, Scanner};
pub use store::{state_file_path, FingerprintStore, CONTROL_DIR};
