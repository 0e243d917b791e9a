/*!
 * Full source/replica cycles on one machine
 */

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use orbit_mirror::config::Topology;
use orbit_mirror::logging::init_test_logging;
use orbit_mirror::node::{self, Node};
use orbit_mirror::transfer::{
    LocalTransfer, Transfer, TransferKind, TransferOutcome, TransferRequest,
};
use orbit_mirror::Result;

fn topology(source: &Path, replica: &Path, extra: &str) -> Topology {
    Topology::parse_legacy(&format!(
        "ignore suffix: .DS_Store\n\
         source: src:{}\n\
         replica: dst:{}\n\
         {}",
        source.display(),
        replica.display(),
        extra
    ))
    .unwrap()
}

fn populate(root: &Path) {
    fs::create_dir_all(root.join("albums").join("a")).unwrap();
    fs::write(root.join("albums").join("a").join("01.flac"), vec![1u8; 10_000]).unwrap();
    fs::write(root.join("albums").join("a").join("02.flac"), vec![2u8; 20_000]).unwrap();
    fs::write(root.join("notes.txt"), b"liner notes").unwrap();
    fs::write(root.join(".DS_Store"), b"finder junk").unwrap();
}

#[tokio::test]
async fn test_source_then_replica_cycle_reaches_current() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    populate(source.path());

    let src_node = Node::new(
        topology(source.path(), replica.path(), ""),
        "src",
        Arc::new(LocalTransfer::new()),
    );
    let dst_node = Node::new(
        topology(source.path(), replica.path(), ""),
        "dst",
        Arc::new(LocalTransfer::new()),
    );

    let scanned = src_node.run_once().await.unwrap();
    assert!(scanned.all_succeeded());
    assert!(src_node
        .status()
        .iter()
        .any(|line| line == &format!("Not started: dst:{}", replica.path().display())));

    let pulled = dst_node.run_once().await.unwrap();
    assert!(pulled.all_succeeded());

    // data arrived, junk did not
    assert_eq!(
        fs::read(replica.path().join("notes.txt")).unwrap(),
        b"liner notes"
    );
    assert!(!replica.path().join(".DS_Store").exists());
    // replica published its store into the source control directory
    assert!(source.path().join(".mirror").join("dst.1.json").exists());
    // and holds the source's store as pulled
    assert!(replica.path().join(".mirror").join("src.1.json").exists());

    let expected = format!("Current @ 100%: dst:{}", replica.path().display());
    assert!(src_node.status().contains(&expected));
    assert!(dst_node.status().contains(&expected));
}

#[tokio::test]
async fn test_partial_replica_reports_progress() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    populate(source.path());

    let src_node = Node::new(
        topology(source.path(), replica.path(), ""),
        "src",
        Arc::new(LocalTransfer::new()),
    );
    let dst_node = Node::new(
        topology(source.path(), replica.path(), ""),
        "dst",
        Arc::new(LocalTransfer::new()),
    );
    src_node.run_once().await.unwrap();
    dst_node.run_once().await.unwrap();

    // two new files on the source, not yet pulled
    fs::write(source.path().join("bonus1.txt"), b"1").unwrap();
    fs::write(source.path().join("bonus2.txt"), b"2").unwrap();
    src_node.run_once().await.unwrap();

    let line = src_node
        .status()
        .into_iter()
        .find(|line| line.starts_with("Active:"))
        .unwrap();
    assert_eq!(
        line,
        format!("Active:  60% 3/5: dst:{}", replica.path().display())
    );
}

/// Fails every tree pull, passes store publishing through to the local copier
struct FailingPull {
    inner: LocalTransfer,
    pulls: AtomicUsize,
}

#[async_trait]
impl Transfer for FailingPull {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        match request.kind {
            TransferKind::Tree => {
                self.pulls.fetch_add(1, Ordering::SeqCst);
                Ok(TransferOutcome {
                    status: Some(23),
                    lines: 0,
                })
            }
            TransferKind::File => self.inner.transfer(request).await,
        }
    }
}

#[tokio::test]
async fn test_failed_pull_still_scans_and_publishes() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    fs::create_dir_all(source.path()).unwrap();
    fs::write(replica.path().join("already-here.txt"), b"x").unwrap();

    let transfer = Arc::new(FailingPull {
        inner: LocalTransfer::new(),
        pulls: AtomicUsize::new(0),
    });
    let dst_node = Node::new(
        topology(source.path(), replica.path(), ""),
        "dst",
        transfer.clone(),
    );

    let outcome = dst_node.run_once().await.unwrap();
    assert_eq!(outcome.failures, 1);
    assert_eq!(transfer.pulls.load(Ordering::SeqCst), 1);

    let published = source.path().join(".mirror").join("dst.1.json");
    let text = fs::read_to_string(published).unwrap();
    assert!(text.contains("already-here.txt"));
}

/// Holds the tree pull open for a while and counts store publishes
struct SlowPull {
    inner: LocalTransfer,
    pull_time: Duration,
    publishes: AtomicUsize,
    publishes_during_pull: AtomicUsize,
}

#[async_trait]
impl Transfer for SlowPull {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        match request.kind {
            TransferKind::Tree => {
                tokio::time::sleep(self.pull_time).await;
                self.publishes_during_pull
                    .store(self.publishes.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(TransferOutcome {
                    status: Some(0),
                    lines: 0,
                })
            }
            TransferKind::File => {
                self.publishes.fetch_add(1, Ordering::SeqCst);
                self.inner.transfer(request).await
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_pull_publishes_periodically() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    fs::write(replica.path().join("partial.bin"), b"in flight").unwrap();

    let transfer = Arc::new(SlowPull {
        inner: LocalTransfer::new(),
        pull_time: Duration::from_millis(3500),
        publishes: AtomicUsize::new(0),
        publishes_during_pull: AtomicUsize::new(0),
    });
    let dst_node = Node::new(
        topology(source.path(), replica.path(), "rescan: 1s\n"),
        "dst",
        transfer.clone(),
    );

    let outcome = dst_node.run_once().await.unwrap();
    assert!(outcome.all_succeeded());

    let during = transfer.publishes_during_pull.load(Ordering::SeqCst);
    assert!(during >= 2, "only {} publishes while pulling", during);
    // plus the final one after the join
    assert!(transfer.publishes.load(Ordering::SeqCst) > during);
    assert!(source.path().join(".mirror").join("dst.1.json").exists());
}

#[tokio::test]
async fn test_scan_only_and_restore() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    fs::write(replica.path().join("survivor.txt"), b"kept safe").unwrap();

    let dst_node = Node::new(
        topology(source.path(), replica.path(), "rsync options: delete\n"),
        "dst",
        Arc::new(LocalTransfer::new()),
    );

    let scanned = dst_node.scan_only().await.unwrap();
    assert!(scanned.all_succeeded());
    // no pull happened: the delete flag did not remove anything
    assert!(replica.path().join("survivor.txt").exists());
    assert!(source.path().join(".mirror").join("dst.1.json").exists());

    fs::write(source.path().join("source-only.txt"), b"s").unwrap();
    dst_node.restore().await.unwrap();
    assert_eq!(
        fs::read(source.path().join("survivor.txt")).unwrap(),
        b"kept safe"
    );
    // additive: nothing on the source was deleted
    assert!(source.path().join("source-only.txt").exists());
}

#[tokio::test]
async fn test_run_forever_exits_on_terminate() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    populate(source.path());

    let mut src_node = Node::new(
        topology(source.path(), replica.path(), "cycle: 1h\n"),
        "src",
        Arc::new(LocalTransfer::new()),
    );
    let (handle, mut lifecycle) = node::channel();

    let stopper = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.terminate();
    });

    tokio::time::timeout(
        Duration::from_secs(30),
        src_node.run_forever(&mut lifecycle),
    )
    .await
    .expect("terminate should end the loop")
    .unwrap();

    assert!(source.path().join(".mirror").join("src.1.json").exists());
    drop(handle);
}

#[tokio::test]
async fn test_reload_starts_next_cycle_immediately() {
    init_test_logging();
    let source = tempdir().unwrap();
    let replica = tempdir().unwrap();
    let config_dir = tempdir().unwrap();
    populate(source.path());

    let config = config_dir.path().join("config.txt");
    fs::write(
        &config,
        format!(
            "cycle: 1h\nsource: src:{}\nreplica: dst:{}\n",
            source.path().display(),
            replica.path().display()
        ),
    )
    .unwrap();

    let mut src_node = Node::new(
        Topology::load(&config).unwrap(),
        "src",
        Arc::new(LocalTransfer::new()),
    )
    .with_config_path(&config);
    let (handle, mut lifecycle) = node::channel();
    let store = source.path().join(".mirror").join("src.1.json");

    let driver = handle.clone();
    let watched = store.clone();
    let bonus = source.path().join("bonus.txt");
    tokio::spawn(async move {
        // first cycle has published its store
        while !watched.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        fs::write(&bonus, b"added between cycles").unwrap();
        driver.reload();

        for _ in 0..500 {
            let text = fs::read_to_string(&watched).unwrap_or_default();
            if text.contains("bonus.txt") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        driver.terminate();
    });

    tokio::time::timeout(
        Duration::from_secs(30),
        src_node.run_forever(&mut lifecycle),
    )
    .await
    .expect("reload should not wait out the 1h cycle")
    .unwrap();

    let text = fs::read_to_string(&store).unwrap();
    assert!(text.contains("bonus.txt"));
    drop(handle);
}
