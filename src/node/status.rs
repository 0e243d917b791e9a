//! One-line status renderings
//!
//! ```text
//! Source: mini-pi:/Volumes/Media/Movies: 1601 files, 1248.87GB
//! Current @ 100%: mc-wifi:/mnt/media/Movies
//! Active:  42% 672/1601: mc-wifi:/mnt/media/Movies
//! ```

use std::time::Duration;

use crate::core::consistency::{ConsistencyReport, Freshness, ReplicaStatus};
use crate::core::elapsed::format_seconds_f64;
use crate::core::store::FingerprintStore;
use crate::location::Location;

const GIB: f64 = (1u64 << 30) as f64;

pub fn source_line(source: &Location, store: &FingerprintStore) -> String {
    format!(
        "Source: {}: {} files, {:.2}GB",
        source,
        store.len(),
        store.total_bytes() as f64 / GIB
    )
}

pub fn replica_line(replica: &Location, report: &ConsistencyReport, cycle: Duration) -> String {
    match report.status(cycle) {
        ReplicaStatus::NotStarted => format!("Not started: {}", replica),
        ReplicaStatus::NothingOnSource => "Nothing on source".to_string(),
        ReplicaStatus::Overfull => format!(
            "WARNING: too many files in replica {}: {}/{}: {}",
            replica.host, report.replica_files, report.source_files, replica
        ),
        ReplicaStatus::Complete(Freshness::Current) => format!("Current @ 100%: {}", replica),
        ReplicaStatus::Complete(Freshness::Stale) => format!(
            "Stale @ 100%: {}; {} ago",
            replica,
            format_seconds_f64(report.latency)
        ),
        ReplicaStatus::Partial(freshness) => {
            let label = match freshness {
                Freshness::Current => "Active",
                Freshness::Stale => "Stale",
            };
            format!(
                "{}: {:3}% {}/{}: {}",
                label, report.completion_percent, report.reconciled, report.source_files, replica
            )
        }
    }
}
