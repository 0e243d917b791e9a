/*!
 * Per-host orchestration
 *
 * A node looks up which source and replica roles the topology assigns to
 * its hostname and drives them: source roles scan, replica roles pull,
 * rescan and publish. `run_forever` repeats the cycle, sleeping between
 * cycles on a [`Lifecycle`] so reload and terminate requests take effect at
 * the sleep boundary.
 */

pub mod lifecycle;
pub mod replica;
pub mod source;
pub mod status;

use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Topology;
use crate::core::elapsed::format_duration;
use crate::error::{MirrorError, Result};
use crate::transfer::Transfer;

pub use lifecycle::{channel, install_signal_handlers, Lifecycle, LifecycleHandle, Wakeup};
pub use replica::ReplicaRole;
pub use source::SourceRole;

/// Interval of the repeating status display
pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Result of one pass over every role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub roles: usize,
    pub failures: usize,
}

impl CycleOutcome {
    fn record(&mut self, what: &str, result: Result<()>) -> Result<()> {
        self.roles += 1;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(category = %e.category(), "{} failed: {}", what, e);
                self.failures += 1;
                Ok(())
            }
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures == 0
    }
}

pub struct Node {
    topology: Topology,
    /// Re-read on reload
    config_path: Option<PathBuf>,
    hostname: String,
    transfer: Arc<dyn Transfer>,
}

impl Node {
    pub fn new(topology: Topology, hostname: impl Into<String>, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            topology,
            config_path: None,
            hostname: hostname.into(),
            transfer,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn source_roles(&self) -> Vec<SourceRole<'_>> {
        self.topology
            .sources_for_host(&self.hostname)
            .into_keys()
            .filter_map(|id| self.topology.context(id).ok())
            .map(SourceRole::new)
            .collect()
    }

    pub fn replica_roles(&self) -> Vec<ReplicaRole> {
        self.topology
            .replicas_for_host(&self.hostname)
            .into_iter()
            .filter_map(|(id, location)| {
                let context = self.topology.context(id).ok()?;
                Some(ReplicaRole::new(
                    context.clone(),
                    location.clone(),
                    Arc::clone(&self.transfer),
                ))
            })
            .collect()
    }

    /// One cycle: every source role, then every replica role
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        let sources = self.source_roles();
        let replicas = self.replica_roles();
        if sources.is_empty() && replicas.is_empty() {
            warn!("No roles for host {} in the topology", self.hostname);
        }

        for role in &sources {
            let scanned = role.scan().map(|_| ());
            outcome.record("Source scan", scanned)?;
            for line in role.status() {
                info!("{}", line);
            }
        }

        for role in &replicas {
            let ran = role.run().await;
            outcome.record("Replica cycle", ran)?;
            info!("{}", role.status());
        }

        Ok(outcome)
    }

    /// Cycle until terminated. Fatal errors end the loop; anything else is
    /// logged and retried next cycle.
    pub async fn run_forever(&mut self, lifecycle: &mut Lifecycle) -> Result<()> {
        loop {
            if lifecycle.terminate_requested() {
                info!("Termination requested; exiting");
                return Ok(());
            }

            let outcome = self.run_once().await?;
            let cycle = self.topology.settings().cycle;
            info!(
                "Cycle done: {} roles, {} failed; next in {}",
                outcome.roles,
                outcome.failures,
                format_duration(cycle)
            );

            match lifecycle.sleep(cycle).await {
                Wakeup::Elapsed => {}
                Wakeup::Reload => {
                    info!("Reload requested; restarting");
                    self.reload();
                }
                Wakeup::Terminate => {
                    info!("Termination requested; exiting");
                    return Ok(());
                }
            }
        }
    }

    /// Re-read the topology file; keep the current topology if that fails
    pub fn reload(&mut self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match Topology::load(path) {
            Ok(topology) => {
                debug!("Topology reloaded from {}", path.display());
                self.topology = topology;
            }
            Err(e) => warn!("Keeping previous topology; reload failed: {}", e),
        }
    }

    /// Scan and publish every role without pulling
    pub async fn scan_only(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        for role in self.source_roles() {
            let scanned = role.scan().map(|_| ());
            outcome.record("Source scan", scanned)?;
        }
        for role in self.replica_roles() {
            let scanned = role.scan_only().await.map(|_| ());
            outcome.record("Replica scan", scanned)?;
        }
        Ok(outcome)
    }

    /// Push every replica tree hosted here back to its source
    pub async fn restore(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        let replicas = self.replica_roles();
        if replicas.is_empty() {
            return Err(MirrorError::Config(format!(
                "host {} holds no replica to restore from",
                self.hostname
            )));
        }
        for role in replicas {
            let restored = role.restore().await;
            outcome.record("Restore", restored)?;
        }
        Ok(outcome)
    }

    /// Status lines for every role on this host. Never fails: missing or
    /// unreadable stores read as empty.
    pub fn status(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} @ {}",
            self.hostname,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )];
        for role in self.source_roles() {
            lines.extend(role.status());
        }
        for role in self.replica_roles() {
            lines.push(role.status());
        }
        lines
    }

    pub fn print_status(&self) {
        for line in self.status() {
            println!("{}", line);
        }
    }

    /// Print status every [`STATUS_INTERVAL`] until terminated
    pub async fn status_forever(&mut self, lifecycle: &mut Lifecycle) {
        loop {
            self.print_status();
            match lifecycle.sleep(STATUS_INTERVAL).await {
                Wakeup::Elapsed => {}
                Wakeup::Reload => self.reload(),
                Wakeup::Terminate => return,
            }
        }
    }
}

/// This machine's hostname, up to the first dot
pub fn local_hostname() -> String {
    system_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|name| name.split('.').next().unwrap_or_default().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    let mut buffer = [0u8; 256];
    // SAFETY: the buffer is valid for `len` bytes and gethostname writes at most that many
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr().cast::<libc::c_char>(), buffer.len()) };
    if rc != 0 {
        return None;
    }
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    Some(String::from_utf8_lossy(&buffer[..end]).into_owned())
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::LocalTransfer;

    fn node(host: &str) -> Node {
        let topology = Topology::parse_legacy(
            "source: alpha:/srv/a\n\
             replica: beta:/mnt/a\n\
             source: beta:/srv/b\n\
             replica: alpha:/mnt/b\n\
             replica: gamma:/mnt/b\n",
        )
        .unwrap();
        Node::new(topology, host, Arc::new(LocalTransfer::new()))
    }

    #[test]
    fn test_roles_by_host() {
        let alpha = node("alpha");
        assert_eq!(alpha.source_roles().len(), 1);
        let replicas = alpha.replica_roles();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].location().to_string(), "alpha:/mnt/b");

        let gamma = node("gamma");
        assert!(gamma.source_roles().is_empty());
        assert_eq!(gamma.replica_roles().len(), 1);
    }

    #[test]
    fn test_status_never_fails_on_missing_stores() {
        let lines = node("alpha").status();
        assert!(lines[0].starts_with("alpha @ "));
        assert!(lines.iter().any(|l| l == "Not started: beta:/mnt/a"));
        assert!(lines.iter().any(|l| l == "Not started: alpha:/mnt/b"));
    }

    #[tokio::test]
    async fn test_restore_without_replicas_is_config_error() {
        let err = node("delta").restore().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cycle_outcome_records() {
        let mut outcome = CycleOutcome::default();
        outcome.record("a", Ok(())).unwrap();
        outcome
            .record("b", Err(MirrorError::Transfer("exit 23".to_string())))
            .unwrap();
        assert!(outcome
            .record("c", Err(MirrorError::Config("bad".to_string())))
            .is_err());
        assert_eq!(outcome.roles, 3);
        assert_eq!(outcome.failures, 1);
        assert!(!outcome.all_succeeded());
    }

    #[test]
    fn test_local_hostname_is_short() {
        let name = local_hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('.'));
    }
}
