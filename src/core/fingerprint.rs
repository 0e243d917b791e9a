/*!
 * Per-file fingerprints
 *
 * A fingerprint is what a host remembers about one file: size, change and
 * modify times, and (when asked for) a content digest. Stat-only comparison
 * decides whether a file needs re-hashing at all.
 *
 * The serialized field names (`filename`, `checksum`, `checksum_time`, ...)
 * are the on-disk store format shared between hosts.
 */

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::checksum::{file_digest, HashParams};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Seconds since the Unix epoch, with sub-second precision
pub type Timestamp = f64;

/// Content digest state of a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentHash {
    /// Not computed yet
    Deferred,
    /// Could not be computed (not a regular file, unreadable, vanished)
    Unavailable,
    /// Hex SHA-256, full or sampled
    Sha256(String),
}

impl ContentHash {
    pub fn digest(&self) -> Option<&str> {
        match self {
            ContentHash::Sha256(hex) => Some(hex),
            _ => None,
        }
    }
}

impl From<String> for ContentHash {
    fn from(value: String) -> Self {
        match value.as_str() {
            "deferred" => ContentHash::Deferred,
            "" | "n/a" => ContentHash::Unavailable,
            _ => ContentHash::Sha256(value),
        }
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        match hash {
            ContentHash::Deferred => "deferred".to_string(),
            ContentHash::Unavailable => "n/a".to_string(),
            ContentHash::Sha256(hex) => hex,
        }
    }
}

/// Observable state of one file, keyed by its path relative to the tree root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(rename = "filename")]
    pub path: String,
    pub size: u64,
    /// Inode change time (creation time where the platform has no ctime)
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    #[serde(rename = "checksum")]
    pub hash: ContentHash,
    /// When the observation that produced `hash` was taken
    #[serde(rename = "checksum_time")]
    pub hashed_at: Timestamp,
}

impl Fingerprint {
    /// Stat `absolute` (without following symlinks) and optionally hash it.
    ///
    /// A path that cannot be stat'ed yields the vanished sentinel instead of
    /// an error: the file disappeared between listing and observation.
    pub fn observe(
        absolute: &Path,
        relative: &str,
        compute_hash: bool,
        params: &HashParams,
    ) -> Fingerprint {
        let metadata = match std::fs::symlink_metadata(absolute) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("{} vanished before stat: {}", absolute.display(), e);
                return Fingerprint::vanished(relative);
            }
        };

        let hash = if !compute_hash {
            ContentHash::Deferred
        } else if !metadata.file_type().is_file() {
            ContentHash::Unavailable
        } else {
            match file_digest(absolute, params) {
                Ok(hex) => ContentHash::Sha256(hex),
                Err(e) => {
                    debug!("Cannot hash {}: {}", absolute.display(), e);
                    ContentHash::Unavailable
                }
            }
        };

        Fingerprint {
            path: relative.to_string(),
            size: metadata.len(),
            ctime: change_time(&metadata),
            mtime: metadata.modified().map(to_timestamp).unwrap_or(0.0),
            hash,
            hashed_at: now(),
        }
    }

    /// Sentinel for a file that disappeared; never stored as a new entry
    pub fn vanished(relative: &str) -> Fingerprint {
        Fingerprint {
            path: relative.to_string(),
            size: 0,
            ctime: 0.0,
            mtime: 0.0,
            hash: ContentHash::Unavailable,
            hashed_at: 0.0,
        }
    }

    pub fn is_vanished(&self) -> bool {
        self.size == 0 && self.ctime == 0.0 && self.mtime == 0.0
    }

    /// Cheap check: did size, ctime or mtime move since `previous`?
    pub fn quick_changed(&self, previous: &Fingerprint) -> bool {
        self.size != previous.size || self.ctime != previous.ctime || self.mtime != previous.mtime
    }

    /// Digest comparison. An unknown digest on either side counts as changed.
    pub fn content_changed(&self, previous: &Fingerprint) -> bool {
        match (self.hash.digest(), previous.hash.digest()) {
            (Some(current), Some(before)) => current != before,
            _ => true,
        }
    }
}

/// Current wall-clock time as a [`Timestamp`]
pub fn now() -> Timestamp {
    to_timestamp(SystemTime::now())
}

fn to_timestamp(time: SystemTime) -> Timestamp {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}

#[cfg(unix)]
fn change_time(metadata: &Metadata) -> Timestamp {
    metadata.ctime() as f64 + metadata.ctime_nsec() as f64 / 1e9
}

#[cfg(not(unix))]
fn change_time(metadata: &Metadata) -> Timestamp {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(to_timestamp)
        .unwrap_or(0.0)
}
