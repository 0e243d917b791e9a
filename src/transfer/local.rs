/*!
 * In-process transfer between local paths
 *
 * Ignores host parts entirely. Copies files whose size or modification time
 * differ, preserves modification times, honours exclusion patterns and the
 * `delete` flag. Used when every role lives on one machine and by tests.
 */

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{is_excluded, Transfer, TransferKind, TransferOutcome, TransferRequest};
use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransfer;

impl LocalTransfer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transfer for LocalTransfer {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || copy_blocking(&request))
            .await
            .map_err(|e| MirrorError::Transfer(format!("copy task failed: {}", e)))?
    }
}

fn copy_blocking(request: &TransferRequest) -> Result<TransferOutcome> {
    let source = &request.source.path;
    let destination = &request.destination.path;
    let copied = match request.kind {
        TransferKind::File => copy_file_into(source, destination, request.quiet)?,
        TransferKind::Tree => copy_tree(source, destination, request)?,
    };
    Ok(TransferOutcome {
        status: Some(0),
        lines: copied,
    })
}

fn copy_file_into(file: &Path, directory: &Path, quiet: bool) -> Result<usize> {
    let name = file
        .file_name()
        .ok_or_else(|| MirrorError::Transfer(format!("{} has no file name", file.display())))?;
    fs::create_dir_all(directory)?;
    let target = directory.join(name);
    if copy_if_changed(file, &target)? {
        log_copied(&target, quiet);
        Ok(1)
    } else {
        Ok(0)
    }
}

fn copy_tree(source: &Path, destination: &Path, request: &TransferRequest) -> Result<usize> {
    if !source.is_dir() {
        return Err(MirrorError::Transfer(format!(
            "source {} is not a directory",
            source.display()
        )));
    }
    fs::create_dir_all(destination)?;

    let mut copied = 0;
    let mut wanted: HashSet<PathBuf> = HashSet::new();
    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(&entry.file_name().to_string_lossy(), &request.excludes));

    for entry in walker {
        let entry = entry.map_err(|e| MirrorError::Transfer(e.to_string()))?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        let target = destination.join(&relative);
        wanted.insert(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() && copy_if_changed(entry.path(), &target)? {
            log_copied(&target, request.quiet);
            copied += 1;
        }
    }

    if request.deletes_extraneous() {
        remove_extraneous(destination, &wanted, &request.excludes)?;
    }
    Ok(copied)
}

fn remove_extraneous(destination: &Path, wanted: &HashSet<PathBuf>, excludes: &[String]) -> Result<()> {
    let walker = WalkDir::new(destination)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_entry(|entry| !is_excluded(&entry.file_name().to_string_lossy(), excludes));
    for entry in walker {
        let entry = entry.map_err(|e| MirrorError::Transfer(e.to_string()))?;
        let Ok(relative) = entry.path().strip_prefix(destination) else {
            continue;
        };
        if wanted.contains(relative) {
            continue;
        }
        info!("> deleting {}", relative.display());
        let removed = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        // A non-empty directory still holds excluded entries; leave it
        if let Err(e) = removed {
            debug!("Keeping {}: {}", entry.path().display(), e);
        }
    }
    Ok(())
}

/// Copy `from` over `to` unless both already agree on size and mtime
fn copy_if_changed(from: &Path, to: &Path) -> io::Result<bool> {
    let source_meta = fs::metadata(from)?;
    if let Ok(target_meta) = fs::metadata(to) {
        let same_size = target_meta.len() == source_meta.len();
        let same_mtime = match (target_meta.modified(), source_meta.modified()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same_size && same_mtime {
            return Ok(false);
        }
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    if let Ok(modified) = source_meta.modified() {
        File::options().write(true).open(to)?.set_modified(modified)?;
    }
    Ok(true)
}

fn log_copied(target: &Path, quiet: bool) {
    if quiet {
        debug!("> {}", target.display());
    } else {
        info!("> {}", target.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::transfer::suffix_pattern;
    use tempfile::tempdir;

    fn loc(path: &Path) -> Location {
        Location::new("localhost", path)
    }

    #[tokio::test]
    async fn test_tree_copy_with_excludes() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();
        fs::write(src.path().join("junk.tmp"), b"j").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub").join("b.txt"), b"bb").unwrap();

        let request = TransferRequest::tree(loc(src.path()), loc(dst.path()))
            .with_excludes(vec![suffix_pattern(".tmp")]);
        let outcome = LocalTransfer::new().transfer(&request).await.unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.lines, 2);
        assert_eq!(fs::read(dst.path().join("sub").join("b.txt")).unwrap(), b"bb");
        assert!(!dst.path().join("junk.tmp").exists());

        // second run has nothing to do
        let again = LocalTransfer::new().transfer(&request).await.unwrap();
        assert_eq!(again.lines, 0);
    }

    #[tokio::test]
    async fn test_delete_flag_spares_excluded() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("keep.txt"), b"k").unwrap();
        fs::write(dst.path().join("stale.txt"), b"s").unwrap();
        fs::write(dst.path().join("mine.json"), b"{}").unwrap();

        let request = TransferRequest::tree(loc(src.path()), loc(dst.path()))
            .with_flags(&["delete".to_string()])
            .with_excludes(vec!["mine.json".to_string()]);
        LocalTransfer::new().transfer(&request).await.unwrap();

        assert!(dst.path().join("keep.txt").exists());
        assert!(!dst.path().join("stale.txt").exists());
        assert!(dst.path().join("mine.json").exists());
    }

    #[tokio::test]
    async fn test_file_copy_creates_directory() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let file = src.path().join("h.1.json");
        fs::write(&file, b"{}").unwrap();

        let target_dir = dst.path().join(".mirror");
        let request = TransferRequest::file(loc(&file), loc(&target_dir));
        LocalTransfer::new().transfer(&request).await.unwrap();
        assert_eq!(fs::read(target_dir.join("h.1.json")).unwrap(), b"{}");
    }
}
