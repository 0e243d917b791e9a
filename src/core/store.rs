/*!
 * Durable fingerprint store
 *
 * One JSON document per tree and context, mapping relative path to
 * [`Fingerprint`]. Writes go to a temporary file in the same directory which
 * is then renamed over the target, so readers (including the transfer tool
 * publishing the file to a peer) never see a half-written document.
 *
 * Mutations are flushed lazily: at most once per `lazy_write` interval, or
 * on every mutation when the interval is zero, or when `flush()` is called.
 * A malformed document is moved aside to `<name>.corrupt` and the store
 * starts empty.
 *
 * One process owns a store file at a time; there is no file locking.
 */

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::fingerprint::{Fingerprint, Timestamp};
use crate::config::ContextId;
use crate::error::{MirrorError, Result};

/// Control subdirectory holding store files at the root of every tree
pub const CONTROL_DIR: &str = ".mirror";

/// Suffix given to a store document that failed to parse
pub const QUARANTINE_SUFFIX: &str = "corrupt";

/// `<tree>/.mirror/<host>.<context>.json`
pub fn state_file_path(tree: &Path, host: &str, context: ContextId) -> PathBuf {
    tree.join(CONTROL_DIR).join(state_file_name(host, context))
}

pub fn state_file_name(host: &str, context: ContextId) -> String {
    format!("{}.{}.json", host, context)
}

pub type Entries = BTreeMap<String, Fingerprint>;

#[derive(Debug)]
pub struct FingerprintStore {
    path: PathBuf,
    entries: Entries,
    /// Paths touched during the current scan pass
    live: HashSet<String>,
    lazy_write: Duration,
    last_flush: Instant,
    dirty: bool,
}

impl FingerprintStore {
    /// Open the store at `path`, loading whatever is there
    pub fn open(path: impl Into<PathBuf>, lazy_write: Duration) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            entries: Entries::new(),
            live: HashSet::new(),
            lazy_write,
            last_flush: Instant::now(),
            dirty: false,
        };
        store.load()?;
        Ok(store)
    }

    /// Read a peer's published store for inspection.
    ///
    /// Never fails and never renames anything: a missing, unreadable or
    /// malformed document reads as empty.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_document(&path) {
            Ok(Some(entries)) => entries,
            Ok(None) => Entries::new(),
            Err(e) => {
                warn!("Ignoring unreadable state file {}: {}", path.display(), e);
                Entries::new()
            }
        };
        Self {
            path,
            entries,
            live: HashSet::new(),
            lazy_write: Duration::MAX,
            last_flush: Instant::now(),
            dirty: false,
        }
    }

    /// (Re)load from disk, replacing the in-memory mapping
    pub fn load(&mut self) -> Result<()> {
        debug!("Reading state from {}", self.path.display());
        self.entries = match read_document(&self.path) {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                debug!("No state file at {}", self.path.display());
                Entries::new()
            }
            Err(DocumentError::Io(e)) => return Err(MirrorError::store(&self.path, e)),
            Err(DocumentError::Malformed(e)) => {
                let aside = self.quarantine()?;
                warn!(
                    "Malformed state file {} ({}); saved as {}, starting empty",
                    self.path.display(),
                    e,
                    aside.display()
                );
                Entries::new()
            }
        };
        self.live.clear();
        self.dirty = false;
        debug!("Read {} entries", self.entries.len());
        Ok(())
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(QUARANTINE_SUFFIX);
        let aside = PathBuf::from(name);
        fs::rename(&self.path, &aside).map_err(|e| MirrorError::store(&self.path, e))?;
        Ok(aside)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Fingerprint> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry and mark it live
    pub fn set(&mut self, key: impl Into<String>, fingerprint: Fingerprint) -> Result<()> {
        let key = key.into();
        self.live.insert(key.clone());
        self.entries.insert(key, fingerprint);
        self.dirty = true;
        self.lazy_flush()
    }

    pub fn delete(&mut self, key: &str) -> Result<bool> {
        self.live.remove(key);
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        self.dirty = true;
        self.lazy_flush()?;
        Ok(true)
    }

    /// Record that `key` was observed this pass without changing it
    pub fn mark_live(&mut self, key: &str) {
        if self.entries.contains_key(key) {
            self.live.insert(key.to_string());
        }
    }

    /// Forget all liveness marks; called at the start of a scan pass
    pub fn clear_liveness(&mut self) {
        self.live.clear();
    }

    /// Stored paths not observed since the last `clear_liveness`
    pub fn unlive_keys(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|key| !self.live.contains(*key))
            .cloned()
            .collect()
    }

    fn lazy_flush(&mut self) -> Result<()> {
        if self.lazy_write.is_zero() || self.last_flush.elapsed() > self.lazy_write {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the whole mapping now (temp file + atomic rename)
    pub fn flush(&mut self) -> Result<()> {
        debug!("Writing {} entries to {}", self.entries.len(), self.path.display());
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| MirrorError::store(&self.path, e))?;

        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| MirrorError::store(&self.path, e))?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &self.entries)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| MirrorError::store(&self.path, e.error))?;

        self.last_flush = Instant::now();
        self.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Fingerprint)> {
        self.entries.iter()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|fp| fp.size).sum()
    }

    /// Most recent `hashed_at` across all entries; zero for an empty store
    pub fn newest_hash_time(&self) -> Timestamp {
        self.entries
            .values()
            .map(|fp| fp.hashed_at)
            .fold(0.0, f64::max)
    }
}

enum DocumentError {
    Io(std::io::Error),
    Malformed(serde_json::Error),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Io(e) => write!(f, "{}", e),
            DocumentError::Malformed(e) => write!(f, "{}", e),
        }
    }
}

/// `Ok(None)` when there is no document at all
fn read_document(path: &Path) -> std::result::Result<Option<Entries>, DocumentError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DocumentError::Io(e)),
    };
    if text.trim().is_empty() {
        return Ok(Some(Entries::new()));
    }
    serde_json::from_str::<Option<Entries>>(&text)
        .map(|parsed| Some(parsed.unwrap_or_default()))
        .map_err(DocumentError::Malformed)
}
