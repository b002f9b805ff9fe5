//! Content Store (§4.7) — filesystem-backed storage for finished videos.
//!
//! Grounded on the teacher's `job_store.rs` for the thread-safe-handle
//! shape, but the data itself lives on disk, not in the map: the store
//! only tracks enough to answer `list()` without a directory scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::model::StoredVideo;
use crate::validation;

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap());

fn decode_depths(s: &str) -> Vec<String> {
    let once = urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string());
    let twice = urlencoding::decode(&once)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| once.clone());
    vec![s.to_string(), once, twice]
}

fn validate_id(id: &str) -> CoreResult<()> {
    if id.contains('\0') || id.chars().any(|c| c.is_ascii_control()) {
        warn!(security_event = true, id, "content store id contains a control character");
        return Err(CoreError::invalid_input("id contains a control character"));
    }
    if !ID_PATTERN.is_match(id) {
        return Err(CoreError::invalid_input("id does not match the expected pattern"));
    }
    for depth in decode_depths(id) {
        if depth.contains("..") {
            warn!(security_event = true, id, "content store id contains an encoded path traversal attempt");
            return Err(CoreError::invalid_input("id contains a path traversal attempt"));
        }
    }
    Ok(())
}

/// Filesystem-backed store for finished videos.
///
/// `entries` mirrors what's on disk so `list()` doesn't need to re-stat
/// every file; `store`/`delete` keep it in sync with the filesystem
/// under the same lock.
pub struct ContentStore {
    output_dir: PathBuf,
    temp_dir: PathBuf,
    retention: chrono::Duration,
    entries: Arc<RwLock<HashMap<String, StoredVideo>>>,
}

impl ContentStore {
    pub fn new(output_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            temp_dir: temp_dir.into(),
            retention: chrono::Duration::days(retention_days as i64),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Moves `temp_path` into the output directory under a fresh id,
    /// preserving its extension and (on Unix) mode bits.
    pub async fn store(&self, temp_path: &Path) -> CoreResult<String> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| CoreError::new(crate::error::Kind::StorageFailed, format!("failed to create output dir: {e}")))?;

        let id = uuid::Uuid::new_v4().to_string();
        let ext = temp_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let filename = format!("{id}.{ext}");
        let dest = self.output_dir.join(&filename);

        let meta = tokio::fs::metadata(temp_path)
            .await
            .map_err(|e| CoreError::new(crate::error::Kind::StorageFailed, format!("failed to stat temp file: {e}")))?;

        tokio::fs::copy(temp_path, &dest)
            .await
            .map_err(|e| CoreError::new(crate::error::Kind::StorageFailed, format!("failed to copy into output dir: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(meta.permissions().mode());
            let _ = tokio::fs::set_permissions(&dest, perms).await;
        }

        if let Err(e) = tokio::fs::remove_file(temp_path).await {
            warn!(error = %e, path = %temp_path.display(), "failed to remove source temp file after store");
        }

        let stored = StoredVideo {
            id: id.clone(),
            filename,
            size: meta.len(),
            created_at: chrono::Utc::now(),
        };
        self.entries.write().await.insert(id.clone(), stored);
        Ok(id)
    }

    /// Resolves `id` to its file path, rejecting anything that is not a
    /// regular file strictly inside the canonicalized output directory.
    pub async fn get(&self, id: &str) -> CoreResult<PathBuf> {
        validate_id(id)?;

        let output_dir = self.output_dir.clone();
        let id_owned = id.to_string();
        let resolved = tokio::task::spawn_blocking(move || glob_output_path(&output_dir, &id_owned))
            .await
            .map_err(|e| CoreError::internal(format!("store lookup task panicked: {e}")))??;

        Ok(resolved)
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let path = self.get(id).await?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| CoreError::new(crate::error::Kind::StorageFailed, format!("failed to delete stored video: {e}")))?;
        self.entries.write().await.remove(id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<StoredVideo> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Removes regular files older than the retention window from both
    /// `output_dir` and `temp_dir`. Directories are left alone.
    pub async fn cleanup_old(&self) {
        let cutoff = chrono::Utc::now() - self.retention;
        for dir in [&self.output_dir, &self.temp_dir] {
            if let Err(e) = cleanup_dir(dir, cutoff).await {
                warn!(error = %e, dir = %dir.display(), "cleanup of old files failed");
            }
        }
        let to_drop: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, v)| v.created_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect()
        };
        if !to_drop.is_empty() {
            let mut entries = self.entries.write().await;
            for id in to_drop {
                entries.remove(&id);
            }
        }
    }
}

async fn cleanup_dir(dir: &Path, cutoff: chrono::DateTime<chrono::Utc>) -> std::io::Result<()> {
    let mut read = match tokio::fs::read_dir(dir).await {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = read.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let modified: chrono::DateTime<chrono::Utc> = match meta.modified() {
            Ok(m) => m.into(),
            Err(_) => continue,
        };
        if modified < cutoff {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

/// Blocking: globs `output_dir/<id>.*`, rejecting symlinks and anything
/// that escapes the canonicalized `output_dir`.
fn glob_output_path(output_dir: &Path, id: &str) -> CoreResult<PathBuf> {
    let read = std::fs::read_dir(output_dir)
        .map_err(|e| CoreError::not_found(format!("output directory unreadable: {e}")))?;

    let prefix = format!("{id}.");
    for entry in read.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        let candidate = entry.path();

        if let Ok(meta) = std::fs::symlink_metadata(&candidate) {
            if meta.file_type().is_symlink() {
                warn!(security_event = true, id, "content store match is a symlink, rejecting");
                return Err(CoreError::invalid_input("stored entry is a symlink"));
            }
        }

        if !validation::is_within_base(output_dir, &candidate) {
            warn!(security_event = true, id, "content store match escapes the output directory");
            return Err(CoreError::invalid_input("resolved path escapes the output directory"));
        }

        return Ok(candidate);
    }

    Err(CoreError::not_found(format!("no stored video for id {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn valid_id_pattern_chars_are_always_accepted(
            first in "[A-Za-z0-9]",
            rest in "[A-Za-z0-9_-]{0,31}",
        ) {
            let id = format!("{first}{rest}");
            prop_assert!(validate_id(&id).is_ok());
        }

        #[test]
        fn ids_starting_with_a_dash_or_underscore_are_always_rejected(
            rest in "[A-Za-z0-9_-]{0,16}",
        ) {
            let id = format!("-{rest}");
            prop_assert!(validate_id(&id).is_err());
        }
    }

    #[test]
    fn id_pattern_rejects_traversal_and_leading_punctuation() {
        assert!(validate_id("abc123").is_ok());
        assert!(validate_id("abc-123_x").is_ok());
        assert!(validate_id("-abc").is_err());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id("a\0b").is_err());
    }

    #[test]
    fn id_pattern_rejects_double_encoded_traversal() {
        assert!(validate_id("..%2F..%2Fetc").is_err());
        assert!(validate_id("%2e%2e%2f").is_err());
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        let temp = dir.path().join("tmp");
        tokio::fs::create_dir_all(&temp).await.unwrap();
        let store = ContentStore::new(&output, &temp, 7);

        let source = temp.join("video.mp4");
        tokio::fs::write(&source, b"fake mp4 bytes").await.unwrap();

        let id = store.store(&source).await.unwrap();
        assert!(!tokio::fs::try_exists(&source).await.unwrap());

        let path = store.get(&id).await.unwrap();
        assert!(path.starts_with(&output));
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"fake mp4 bytes");

        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }

    #[tokio::test]
    async fn get_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        tokio::fs::create_dir_all(&output).await.unwrap();
        let store = ContentStore::new(&output, dir.path().join("tmp"), 7);
        let err = store.get("nonexistent0000").await.unwrap_err();
        assert_eq!(err.kind, crate::error::Kind::FileNotFound);
    }

    #[tokio::test]
    async fn cleanup_old_removes_stale_files_but_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        tokio::fs::create_dir_all(&output).await.unwrap();
        let nested = output.join("nested");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        let stale = output.join("stale.mp4");
        tokio::fs::write(&stale, b"old").await.unwrap();

        let store = ContentStore::new(&output, dir.path().join("tmp"), 0);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.cleanup_old().await;

        assert!(!tokio::fs::try_exists(&stale).await.unwrap());
        assert!(tokio::fs::try_exists(&nested).await.unwrap());
    }
}
