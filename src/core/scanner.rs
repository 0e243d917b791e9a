/*!
 * Incremental tree scanner
 *
 * Walks a tree in lexicographic order and brings a [`FingerprintStore`] up to
 * date: new paths are hashed and inserted, paths whose size or timestamps
 * moved are re-hashed, untouched paths cost a single stat. Anything the walk
 * did not see is removed once the pass completes; that is the only way an
 * entry leaves the store.
 */

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use super::checksum::HashParams;
use super::fingerprint::Fingerprint;
use super::store::{FingerprintStore, CONTROL_DIR};
use crate::error::Result;

/// What one pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Entries that vanished between listing and stat
    pub skipped: usize,
    /// The root could not be listed; nothing was touched
    pub root_unreadable: bool,
}

impl ScanSummary {
    pub fn changed(&self) -> bool {
        self.root_unreadable || self.added > 0 || self.modified > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    exclusions: Vec<String>,
    hashing: HashParams,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, exclusions: &[String], hashing: HashParams) -> Self {
        Self {
            root: root.into(),
            exclusions: exclusions.to_vec(),
            hashing,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True for names ending in an exclusion suffix, and for the control
    /// directory at the tree root
    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 1 && name == CONTROL_DIR {
            return true;
        }
        self.exclusions
            .iter()
            .any(|suffix| !suffix.is_empty() && name.ends_with(suffix.as_str()))
    }

    /// Run one full pass against `store` and flush it
    pub fn scan(&self, store: &mut FingerprintStore) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();

        if let Err(e) = std::fs::read_dir(&self.root) {
            warn!("Cannot list {}: {}; skipping scan", self.root.display(), e);
            summary.root_unreadable = true;
            return Ok(summary);
        }

        debug!("Scanning {}", self.root.display());
        store.clear_liveness();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(key) = relative_key(&self.root, entry.path()) else {
                continue;
            };
            let regular = entry.file_type().is_file();
            self.observe_entry(store, entry.path(), &key, regular, &mut summary)?;
        }

        for key in store.unlive_keys() {
            info!("deleted: {}", key);
            store.delete(&key)?;
            summary.removed += 1;
        }

        store.flush()?;
        debug!(
            "Scanned {}: {} new, {} changed, {} removed, {} unchanged",
            self.root.display(),
            summary.added,
            summary.modified,
            summary.removed,
            summary.unchanged
        );
        Ok(summary)
    }

    fn observe_entry(
        &self,
        store: &mut FingerprintStore,
        path: &Path,
        key: &str,
        regular: bool,
        summary: &mut ScanSummary,
    ) -> Result<()> {
        if !store.contains(key) {
            let observed = Fingerprint::observe(path, key, true, &self.hashing);
            if observed.is_vanished() {
                summary.skipped += 1;
                return Ok(());
            }
            info!("new: {}", key);
            store.set(key, observed)?;
            summary.added += 1;
            return Ok(());
        }

        let quick = Fingerprint::observe(path, key, false, &self.hashing);
        if quick.is_vanished() {
            // Left unmarked; removed at the end of the pass
            summary.skipped += 1;
            return Ok(());
        }
        // A regular file whose last hash attempt failed is retried every pass
        let changed = store
            .get(key)
            .map(|previous| {
                quick.quick_changed(previous) || (regular && previous.hash.digest().is_none())
            })
            .unwrap_or(true);
        if changed {
            let observed = Fingerprint::observe(path, key, true, &self.hashing);
            if observed.is_vanished() {
                summary.skipped += 1;
                return Ok(());
            }
            info!("changed: {}", key);
            store.set(key, observed)?;
            summary.modified += 1;
        } else {
            store.mark_live(key);
            summary.unchanged += 1;
        }
        Ok(())
    }
}

/// Store key for `path`: relative to `root`, `/`-separated
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
