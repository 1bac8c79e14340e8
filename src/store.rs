//! On-disk file sets.
//!
//! Every container key owns one directory under the cache root. A set is
//! replaced as a unit: files are written into a fresh staging directory,
//! synced, and the staging directory is renamed over the old set. A crash at
//! any point leaves either the old set, the new set, or no set, plus stray
//! staging directories that [`sweep_stale`] removes.

use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::consts::MAX_FILE_BYTES;
use crate::error::CacheError;

const STAGING_MARKER: &str = ".tmp.";
const RETIRED_MARKER: &str = ".old.";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub enum Loaded {
    Missing,
    Oversize { len: u64 },
    Bytes(Vec<u8>),
}

/// Replace the set `root/dir_name` with `files`, written in the given order.
pub fn write_file_set(
    root: &Path,
    dir_name: &str,
    files: &[(&str, Vec<u8>)],
) -> Result<(), CacheError> {
    fs::create_dir_all(root).map_err(|e| CacheError::io(root, e))?;

    let staging = create_unique_dir(root, dir_name, STAGING_MARKER)?;
    let staged = (|| -> Result<(), CacheError> {
        for (name, bytes) in files {
            let path = staging.join(name);
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| CacheError::io(&path, e))?;
            file.write_all(bytes).map_err(|e| CacheError::io(&path, e))?;
            file.sync_all().map_err(|e| CacheError::io(&path, e))?;
        }
        Ok(())
    })();
    if let Err(err) = staged {
        remove_dir_best_effort(&staging, "write_file_set.staging_failed");
        return Err(err);
    }
    sync_dir_best_effort(&staging, "write_file_set.sync_staging");

    let target = root.join(dir_name);
    let retired = if target.exists() {
        let retired = unique_path(root, dir_name, RETIRED_MARKER);
        if let Err(err) = fs::rename(&target, &retired) {
            remove_dir_best_effort(&staging, "write_file_set.retire_failed");
            return Err(CacheError::io(&target, err));
        }
        Some(retired)
    } else {
        None
    };

    if let Err(err) = fs::rename(&staging, &target) {
        if let Some(retired) = retired.as_deref()
            && let Err(restore_err) = fs::rename(retired, &target)
        {
            tracing::warn!(
                target: "anno_cache",
                path = %target.display(),
                error = %restore_err,
                "failed to restore previous cache entry"
            );
        }
        remove_dir_best_effort(&staging, "write_file_set.publish_failed");
        return Err(CacheError::io(&target, err));
    }

    if let Some(retired) = retired {
        remove_dir_best_effort(&retired, "write_file_set.remove_retired");
    }
    sync_dir_best_effort(root, "write_file_set.sync_root");
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Loaded, CacheError> {
    read_file_with_limit(path, MAX_FILE_BYTES as u64)
}

/// Like [`read_file`], with files longer than `limit` reported as oversize
/// without being read.
pub fn read_file_with_limit(path: &Path, limit: u64) -> Result<Loaded, CacheError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(err) => return Err(CacheError::io(path, err)),
    };
    if !meta.is_file() {
        return Ok(Loaded::Missing);
    }
    if meta.len() > limit {
        return Ok(Loaded::Oversize { len: meta.len() });
    }
    match fs::read(path) {
        Ok(bytes) => Ok(Loaded::Bytes(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Loaded::Missing),
        Err(err) => Err(CacheError::io(path, err)),
    }
}

pub fn remove_file_set(root: &Path, dir_name: &str) -> Result<bool, CacheError> {
    let path = root.join(dir_name);
    match fs::remove_dir_all(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(&path, err)),
    }
}

/// Remove staging and retired directories left behind by a crash.
pub fn sweep_stale(root: &Path) -> Result<usize, CacheError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(CacheError::io(root, err)),
    };
    let mut removed = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(root, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_transient(&name) {
            continue;
        }
        if remove_dir_best_effort(&entry.path(), "sweep_stale") {
            removed += 1;
        }
    }
    Ok(removed)
}

/// `(dir name, total bytes)` of every published set.
pub fn list_sets(root: &Path) -> Result<Vec<(String, u64)>, CacheError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CacheError::io(root, err)),
    };
    let mut sets = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(root, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir || is_transient(&name) {
            continue;
        }
        let mut bytes = 0u64;
        if let Ok(files) = fs::read_dir(entry.path()) {
            for file in files.flatten() {
                bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        sets.push((name, bytes));
    }
    sets.sort();
    Ok(sets)
}

fn is_transient(name: &str) -> bool {
    name.contains(STAGING_MARKER) || name.contains(RETIRED_MARKER)
}

fn unique_path(root: &Path, dir_name: &str, marker: &str) -> PathBuf {
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    root.join(format!("{dir_name}{marker}{}.{counter}", std::process::id()))
}

fn create_unique_dir(root: &Path, dir_name: &str, marker: &str) -> Result<PathBuf, CacheError> {
    loop {
        let path = unique_path(root, dir_name, marker);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(CacheError::io(&path, err)),
        }
    }
}

fn remove_dir_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target: "anno_cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache directory"
            );
            false
        }
    }
}

fn sync_dir_best_effort(dir: &Path, reason: &'static str) {
    #[cfg(unix)]
    {
        static SYNC_DIR_ERROR_LOGGED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
        if let Err(err) = fs::File::open(dir).and_then(|d| d.sync_all())
            && err.kind() != io::ErrorKind::NotFound
            && SYNC_DIR_ERROR_LOGGED.set(()).is_ok()
        {
            tracing::debug!(
                target: "anno_cache",
                dir = %dir.display(),
                reason,
                error = %err,
                "failed to sync directory (best effort)"
            );
        }
    }

    #[cfg(not(unix))]
    let _ = (dir, reason);
}
