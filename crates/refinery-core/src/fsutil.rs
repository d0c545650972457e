//! Crash-safe file primitives shared by the lock, checkpoint and ledger stores.
//!
//! Writers never expose a partially written file: content goes to a unique
//! temp file in the target directory, is synced, and is then moved into place.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{Error, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Suffix marking in-progress temp files. Readers skip anything ending in it.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        Error::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
        )
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(".{name}.{}.{seq}{TEMP_SUFFIX}", std::process::id())))
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    file.write_all(data).map_err(|e| Error::io(path, e))?;
    file.sync_data().map_err(|e| Error::io(path, e))
}

/// Create parent directories of `path`.
pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Atomically replace `path` with `data`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_path_for(path)?;
    write_synced(&tmp, data)?;
    fs::rename(&tmp, path).map_err(|e| {
        // Best-effort cleanup of the temp file on rename failure
        let _ = fs::remove_file(&tmp);
        Error::io(path, e)
    })
}

/// Atomically create `path` with `data` unless it already exists.
///
/// Returns `false` when another writer got there first. The file is linked into
/// place fully written, so a concurrent reader sees either nothing or everything.
pub(crate) fn create_exclusive(path: &Path, data: &[u8]) -> Result<bool> {
    ensure_parent(path)?;
    let tmp = temp_path_for(path)?;
    write_synced(&tmp, data)?;

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        // Filesystems without hard links: fall back to O_EXCL create
        Err(_) => match write_synced(path, data) {
            Ok(()) => Ok(true),
            Err(Error::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                Ok(false)
            }
            Err(e) => Err(e),
        },
    }
}

/// Read a file to a string, `None` if it does not exist.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Remove a file, returning whether it existed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
}
