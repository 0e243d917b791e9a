/*!
 * Replica role
 *
 * One cycle: pull the source tree on a worker task while the control loop
 * rescans the local tree and publishes its store every `rescan` interval;
 * once the worker is joined, scan and publish one final time. The store is
 * only ever touched from the control loop.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use super::status::replica_line;
use crate::config::Context;
use crate::core::consistency::evaluate;
use crate::core::elapsed::ElapsedTimer;
use crate::core::scanner::{ScanSummary, Scanner};
use crate::core::store::{state_file_name, state_file_path, FingerprintStore, CONTROL_DIR};
use crate::error::{MirrorError, Result};
use crate::location::Location;
use crate::transfer::{suffix_pattern, Transfer, TransferOutcome, TransferRequest};

/// How often the control loop checks on the pull worker
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ReplicaRole {
    context: Context,
    replica: Location,
    transfer: Arc<dyn Transfer>,
}

impl ReplicaRole {
    pub fn new(context: Context, replica: Location, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            context,
            replica,
            transfer,
        }
    }

    pub fn location(&self) -> &Location {
        &self.replica
    }

    /// This replica's own store
    pub fn state_file(&self) -> PathBuf {
        state_file_path(&self.replica.path, &self.replica.host, self.context.id)
    }

    /// The source's store, as last pulled into this tree
    pub fn source_state_file(&self) -> PathBuf {
        state_file_path(&self.replica.path, &self.context.source.host, self.context.id)
    }

    fn scanner(&self) -> Scanner {
        let settings = &self.context.settings;
        Scanner::new(&self.replica.path, &settings.exclusions, settings.hashing)
    }

    fn open_store(&self) -> Result<FingerprintStore> {
        FingerprintStore::open(self.state_file(), self.context.settings.lazy_write)
    }

    /// Source tree into this replica. The replica's own state file is
    /// excluded so the copy the source holds never overwrites it.
    pub fn pull_request(&self) -> TransferRequest {
        let settings = &self.context.settings;
        let mut excludes: Vec<String> = settings
            .exclusions
            .iter()
            .map(|suffix| suffix_pattern(suffix))
            .collect();
        excludes.push(state_file_name(&self.replica.host, self.context.id));

        TransferRequest::tree(self.context.source.clone(), self.replica.clone())
            .with_flags(&settings.transfer_flags)
            .with_excludes(excludes)
            .with_timeout(settings.transfer_timeout)
    }

    /// This replica's store into the source's control directory
    pub fn publish_request(&self) -> TransferRequest {
        TransferRequest::file(
            self.replica.with_path(self.state_file()),
            self.context.source.join(CONTROL_DIR),
        )
        .with_timeout(self.context.settings.transfer_timeout)
    }

    /// Replica tree back onto the source: additive, never deleting
    pub fn restore_request(&self) -> TransferRequest {
        let settings = &self.context.settings;
        let mut excludes: Vec<String> = settings
            .exclusions
            .iter()
            .map(|suffix| suffix_pattern(suffix))
            .collect();
        excludes.push(CONTROL_DIR.to_string());

        TransferRequest::tree(self.replica.clone(), self.context.source.clone())
            .with_excludes(excludes)
            .with_timeout(settings.transfer_timeout)
    }

    /// Full cycle. A failed pull is reported as an error only after the
    /// final scan and publish have run.
    pub async fn run(&self) -> Result<()> {
        info!("Running {}:{}", self.context.id, self.replica);
        let mut store = self.open_store()?;
        let scanner = self.scanner();
        let rescan_interval = self.context.settings.rescan_interval;

        let transfer = Arc::clone(&self.transfer);
        let request = self.pull_request();
        debug!("Starting pull {} -> {}", request.source, request.destination);
        let mut worker = tokio::spawn(async move { transfer.transfer(&request).await });

        let mut timer = ElapsedTimer::new();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let joined = loop {
            tokio::select! {
                joined = &mut worker => break joined,
                _ = poll.tick() => {
                    if timer.once_every(rescan_interval) {
                        // Races the pull; transient differences are expected
                        if let Err(e) = self.scan_and_publish(&scanner, &mut store).await {
                            warn!(category = %e.category(), "Mid-transfer update failed: {}", e);
                        }
                    }
                }
            }
        };

        let pulled = match joined {
            Ok(Ok(outcome)) => self.check_pull(outcome),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(MirrorError::Transfer(format!("pull task failed: {}", e))),
        };
        if let Err(e) = &pulled {
            warn!(category = %e.category(), "Pull into {} failed: {}", self.replica, e);
        }

        self.scan_and_publish(&scanner, &mut store).await?;
        info!("Finished: {}:{}", self.context.id, self.replica);
        pulled
    }

    fn check_pull(&self, outcome: TransferOutcome) -> Result<()> {
        if outcome.success() {
            debug!("Pull into {} complete", self.replica);
            Ok(())
        } else {
            Err(MirrorError::Transfer(format!(
                "pull {} -> {} exited with {:?}",
                self.context.source, self.replica, outcome.status
            )))
        }
    }

    async fn scan_and_publish(
        &self,
        scanner: &Scanner,
        store: &mut FingerprintStore,
    ) -> Result<ScanSummary> {
        let summary = scan_in_place(scanner, store)?;
        self.publish().await?;
        Ok(summary)
    }

    /// Push this replica's store to the source
    pub async fn publish(&self) -> Result<()> {
        info!("Publishing state of {} to {}", self.replica, self.context.source);
        let outcome = self.transfer.transfer(&self.publish_request()).await?;
        if outcome.success() {
            Ok(())
        } else {
            Err(MirrorError::Transfer(format!(
                "publishing {} exited with {:?}",
                self.state_file().display(),
                outcome.status
            )))
        }
    }

    /// Scan and publish without pulling
    pub async fn scan_only(&self) -> Result<ScanSummary> {
        info!("Scanning {}:{}", self.context.id, self.replica);
        let mut store = self.open_store()?;
        let summary = self.scan_and_publish(&self.scanner(), &mut store).await?;
        info!("Finished: {}:{}", self.context.id, self.replica);
        Ok(summary)
    }

    /// Copy this replica back onto the source
    pub async fn restore(&self) -> Result<()> {
        info!("Restoring {} from {}", self.context.source, self.replica);
        let outcome = self.transfer.transfer(&self.restore_request()).await?;
        if outcome.success() {
            Ok(())
        } else {
            Err(MirrorError::Transfer(format!(
                "restore {} -> {} exited with {:?}",
                self.replica, self.context.source, outcome.status
            )))
        }
    }

    /// Status as seen from this replica: its own store against the source
    /// store it last pulled
    pub fn status(&self) -> String {
        let source = FingerprintStore::read_only(self.source_state_file());
        let ours = FingerprintStore::read_only(self.state_file());
        let report = evaluate(&source, &ours);
        replica_line(&self.replica, &report, self.context.settings.cycle)
    }
}

/// Run a scan without stalling the runtime's other tasks. A current-thread
/// runtime has nowhere to move them, so there the scan runs inline.
fn scan_in_place(scanner: &Scanner, store: &mut FingerprintStore) -> Result<ScanSummary> {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| scanner.scan(store)),
        _ => scanner.scan(store),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;
    use crate::core::checksum::HashParams;
    use tempfile::tempdir;

    fn role() -> ReplicaRole {
        let topology = Topology::parse_legacy(
            "ignore suffix: .DS_Store\n\
             source: src:/srv/movies\n\
             replica: dst:/mnt/movies\n\
             rsync options: delete\n",
        )
        .unwrap();
        let context = topology.context(1).unwrap().clone();
        let replica = context.replicas[0].clone();
        ReplicaRole::new(context, replica, Arc::new(crate::transfer::LocalTransfer::new()))
    }

    #[test]
    fn test_state_files() {
        let role = role();
        assert_eq!(role.state_file(), PathBuf::from("/mnt/movies/.mirror/dst.1.json"));
        assert_eq!(
            role.source_state_file(),
            PathBuf::from("/mnt/movies/.mirror/src.1.json")
        );
    }

    #[test]
    fn test_pull_request_protects_own_state() {
        let request = role().pull_request();
        assert_eq!(request.source.to_string(), "src:/srv/movies");
        assert_eq!(request.destination.to_string(), "dst:/mnt/movies");
        assert_eq!(
            request.excludes,
            vec!["*.DS_Store".to_string(), "dst.1.json".to_string()]
        );
        assert!(request.deletes_extraneous());
    }

    #[test]
    fn test_publish_and_restore_requests() {
        let role = role();
        let publish = role.publish_request();
        assert_eq!(publish.source.to_string(), "dst:/mnt/movies/.mirror/dst.1.json");
        assert_eq!(publish.destination.to_string(), "src:/srv/movies/.mirror");

        let restore = role.restore_request();
        assert_eq!(restore.destination.to_string(), "src:/srv/movies");
        assert!(!restore.deletes_extraneous());
        assert!(restore.excludes.contains(&CONTROL_DIR.to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_in_place_on_worker_thread() {
        let tree = tempdir().unwrap();
        let state = tempdir().unwrap();
        std::fs::write(tree.path().join("a.txt"), b"a").unwrap();
        let scanner = Scanner::new(tree.path(), &[], HashParams::default());
        let mut store =
            FingerprintStore::open(state.path().join("s.json"), Duration::from_secs(60)).unwrap();
        assert_eq!(scan_in_place(&scanner, &mut store).unwrap().added, 1);
    }

    #[tokio::test]
    async fn test_scan_in_place_on_current_thread() {
        let tree = tempdir().unwrap();
        let state = tempdir().unwrap();
        std::fs::write(tree.path().join("a.txt"), b"a").unwrap();
        let scanner = Scanner::new(tree.path(), &[], HashParams::default());
        let mut store =
            FingerprintStore::open(state.path().join("s.json"), Duration::from_secs(60)).unwrap();
        assert_eq!(scan_in_place(&scanner, &mut store).unwrap().added, 1);
    }
}
