/*!
 * Source/replica consistency evaluation
 *
 * Compares a source-side store against a replica-side store, both read from
 * the source host's control directory. Sizes decide reconciliation; digests
 * are not compared here.
 */

use std::collections::HashSet;
use std::time::Duration;

use super::store::FingerprintStore;

/// Outcome of one source/replica comparison; derived, never persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    pub source_files: usize,
    pub source_bytes: u64,
    pub replica_files: usize,
    pub replica_bytes: u64,
    /// Paths present on both sides with equal size
    pub reconciled: usize,
    pub missing: usize,
    /// Present on both sides, size differs
    pub mismatched: usize,
    /// Present on the replica only
    pub extra: usize,
    /// `100 * reconciled / source_files`, at most 99 unless fully reconciled
    pub completion_percent: u8,
    /// Newest source hash time minus newest replica hash time, in seconds
    pub latency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Current,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Replica store missing or empty
    NotStarted,
    NothingOnSource,
    /// Replica holds more files than the source
    Overfull,
    Complete(Freshness),
    Partial(Freshness),
}

pub fn evaluate(source: &FingerprintStore, replica: &FingerprintStore) -> ConsistencyReport {
    let mut reconciled = 0;
    let mut missing = 0;
    let mut mismatched = 0;
    let mut seen: HashSet<&str> = HashSet::with_capacity(source.len());

    for (path, theirs) in source.iter() {
        match replica.get(path) {
            Some(ours) => {
                seen.insert(path.as_str());
                if ours.size == theirs.size {
                    reconciled += 1;
                } else {
                    mismatched += 1;
                }
            }
            None => missing += 1,
        }
    }

    let extra = replica
        .iter()
        .filter(|(path, _)| !seen.contains(path.as_str()))
        .count();

    ConsistencyReport {
        source_files: source.len(),
        source_bytes: source.total_bytes(),
        replica_files: replica.len(),
        replica_bytes: replica.total_bytes(),
        reconciled,
        missing,
        mismatched,
        extra,
        completion_percent: completion_percent(reconciled, source.len()),
        latency: source.newest_hash_time() - replica.newest_hash_time(),
    }
}

fn completion_percent(reconciled: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    if reconciled >= total {
        return 100;
    }
    let percent = (reconciled as u128 * 100 / total as u128) as u8;
    percent.min(99)
}

impl ConsistencyReport {
    pub fn is_complete(&self) -> bool {
        self.source_files > 0 && self.reconciled == self.source_files
    }

    /// Current iff the replica lags the source by less than one cycle
    pub fn freshness(&self, cycle: Duration) -> Freshness {
        if self.latency < cycle.as_secs_f64() {
            Freshness::Current
        } else {
            Freshness::Stale
        }
    }

    pub fn status(&self, cycle: Duration) -> ReplicaStatus {
        if self.replica_files == 0 {
            ReplicaStatus::NotStarted
        } else if self.source_files == 0 {
            ReplicaStatus::NothingOnSource
        } else if self.replica_files > self.source_files {
            ReplicaStatus::Overfull
        } else if self.is_complete() {
            ReplicaStatus::Complete(self.freshness(cycle))
        } else {
            ReplicaStatus::Partial(self.freshness(cycle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::{ContentHash, Fingerprint};
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn entry(path: &str, size: u64, hashed_at: f64) -> Fingerprint {
        Fingerprint {
            path: path.to_string(),
            size,
            ctime: 1.0,
            mtime: 1.0,
            hash: ContentHash::Deferred,
            hashed_at,
        }
    }

    fn store(dir: &std::path::Path, name: &str, entries: &[(String, u64, f64)]) -> FingerprintStore {
        let mut store = FingerprintStore::open(dir.join(name), Duration::from_secs(3600)).unwrap();
        for (path, size, at) in entries {
            store.set(path.clone(), entry(path, *size, *at)).unwrap();
        }
        store
    }

    #[test]
    fn test_partial_replica_counts() {
        let dir = tempdir().unwrap();
        let source_entries: Vec<_> = (0..10).map(|i| (format!("f{}", i), 100, 1000.0)).collect();
        let mut replica_entries: Vec<_> = (0..7).map(|i| (format!("f{}", i), 100, 1000.0)).collect();
        replica_entries.push(("f7".to_string(), 55, 1000.0));

        let source = store(dir.path(), "s.json", &source_entries);
        let replica = store(dir.path(), "r.json", &replica_entries);
        let report = evaluate(&source, &replica);

        assert_eq!(report.source_bytes, 1000);
        assert_eq!(report.completion_percent, 70);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.missing, 2);
        assert_eq!(report.extra, 0);
        assert_eq!(report.status(DAY), ReplicaStatus::Partial(Freshness::Current));
    }

    #[test]
    fn test_old_complete_replica_is_stale() {
        let dir = tempdir().unwrap();
        let t = 1_700_000_000.0;
        let source = store(dir.path(), "s.json", &[("a".to_string(), 1, t)]);
        let replica = store(
            dir.path(),
            "r.json",
            &[("a".to_string(), 1, t - 25.0 * 3600.0)],
        );
        let report = evaluate(&source, &replica);

        assert_eq!(report.completion_percent, 100);
        assert_eq!(report.freshness(DAY), Freshness::Stale);
        assert_eq!(report.status(DAY), ReplicaStatus::Complete(Freshness::Stale));
    }

    #[test]
    fn test_percent_never_rounds_up_to_done() {
        assert_eq!(completion_percent(999, 1000), 99);
        assert_eq!(completion_percent(1000, 1000), 100);
        assert_eq!(completion_percent(0, 0), 0);
        assert_eq!(completion_percent(1, 3), 33);
    }

    #[test]
    fn test_extra_and_empty_cases() {
        let dir = tempdir().unwrap();
        let empty = store(dir.path(), "e.json", &[]);
        let source = store(dir.path(), "s.json", &[("a".to_string(), 1, 5.0)]);
        let replica = store(
            dir.path(),
            "r.json",
            &[("a".to_string(), 1, 5.0), ("b".to_string(), 2, 5.0)],
        );

        assert_eq!(evaluate(&source, &empty).status(DAY), ReplicaStatus::NotStarted);
        assert_eq!(evaluate(&empty, &replica).status(DAY), ReplicaStatus::NothingOnSource);

        let report = evaluate(&source, &replica);
        assert_eq!(report.extra, 1);
        assert_eq!(report.status(DAY), ReplicaStatus::Overfull);
    }
}
