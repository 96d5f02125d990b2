use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ModelError;

pub fn ensure_dir(path: &Path) -> Result<(), ModelError> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write bytes to `path` through a temp file and rename, so readers never
/// observe a partially written document.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<(), ModelError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value with object keys in sorted order. `serde_json`'s
/// default map is ordered, so serializing a `Value` built from sorted inputs
/// is already canonical.
pub fn canonical_json_digest(value: &Value) -> Result<String, ModelError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&bytes))
}

/// Recursively copy `src` into `dst`, skipping any top-level-relative path
/// that starts with one of `exclude`. Symlinks are followed for files and
/// ignored otherwise.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<(), ModelError> {
    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(src).unwrap_or(e.path());
            if rel.as_os_str().is_empty() {
                return true;
            }
            !exclude.iter().any(|ex| rel.starts_with(ex))
        });
    for entry in walker {
        let entry = entry.map_err(|e| {
            ModelError::Setup(format!("cannot walk {}: {}", src.display(), e))
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove a directory tree if present; used for overwrite-style replacement.
pub fn clear_dir(path: &Path) -> Result<(), ModelError> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Relative paths of all files under `root`, sorted. Used by archive
/// verification and store scans.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, ModelError> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry =
            entry.map_err(|e| ModelError::Store(format!("cannot walk {}: {}", root.display(), e)))?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
pub fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "emx_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("test dir");
    dir
}
