use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::domains::export::types::{ExportFormat, ExportId};
use crate::errors::{ExportError, ExportResult};

const ARCHIVE_FILE_NAME: &str = "archive.zip";

// --- Local Export Storage ---

/// On-disk layout: one directory per export id holding numbered shard files
/// and, for multi-file exports, one archive.
#[derive(Debug, Clone)]
pub struct ExportStorage {
    base_path: PathBuf,
}

impl ExportStorage {
    /// Creates the storage root if it does not exist yet.
    pub fn new(base_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn session_dir(&self, export_id: ExportId) -> PathBuf {
        self.base_path.join(export_id.to_string())
    }

    pub async fn create_session_dir(&self, export_id: ExportId) -> ExportResult<PathBuf> {
        let dir = self.session_dir(export_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExportError::Write(format!("Failed to create export directory {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    pub fn shard_path(dir: &Path, shard_index: u32, format: ExportFormat) -> PathBuf {
        dir.join(format!("shard_{:04}.{}", shard_index, format.file_extension()))
    }

    pub fn archive_path(dir: &Path) -> PathBuf {
        dir.join(ARCHIVE_FILE_NAME)
    }

    /// Remove an export's directory. The directory is first renamed to a
    /// hidden tombstone so its canonical path disappears in one step.
    /// Missing directories are not an error.
    pub async fn remove_session_dir(&self, export_id: ExportId) -> ExportResult<()> {
        let dir = self.session_dir(export_id);
        let tombstone = self.base_path.join(format!(".{}.evicting-{}", export_id, Uuid::new_v4().simple()));

        match fs::rename(&dir, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ExportError::Write(format!(
                    "Failed to detach export directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        }

        fs::remove_dir_all(&tombstone).await.map_err(|e| {
            ExportError::Write(format!("Failed to remove export directory {}: {}", tombstone.display(), e))
        })?;
        log::debug!("Removed storage for export {}", export_id);
        Ok(())
    }

    /// Delete tombstones left behind by an interrupted removal.
    pub async fn purge_tombstones(&self) -> ExportResult<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') && name.contains(".evicting-") {
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    log::warn!("Failed to purge {}: {}", name, e);
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub async fn exists(&self, export_id: ExportId) -> bool {
        fs::metadata(self.session_dir(export_id)).await.is_ok()
    }
}

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

/// Sanitizes a file name stem so it is safe as an archive member and a
/// download file name.
pub fn sanitize_component(component: &str) -> Option<String> {
    let cleaned = UNSAFE_CHARS.replace_all(component.trim(), "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.chars().take(100).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_session_dir_lifecycle() {
        let root = TempDir::new().unwrap();
        let storage = ExportStorage::new(root.path().join("exports")).unwrap();
        let id = Uuid::new_v4();

        let dir = storage.create_session_dir(id).await.unwrap();
        std::fs::write(ExportStorage::shard_path(&dir, 0, ExportFormat::Csv), b"a\n").unwrap();
        assert!(storage.exists(id).await);

        storage.remove_session_dir(id).await.unwrap();
        assert!(!storage.exists(id).await);
        assert_eq!(std::fs::read_dir(storage.base_path()).unwrap().count(), 0);

        // Removing twice is fine.
        storage.remove_session_dir(id).await.unwrap();
    }

    #[test]
    fn test_shard_naming() {
        let path = ExportStorage::shard_path(Path::new("/x"), 7, ExportFormat::Excel);
        assert_eq!(path, PathBuf::from("/x/shard_0007.xlsx"));
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("payments export 2024").as_deref(), Some("payments_export_2024"));
        assert_eq!(sanitize_component("../../etc/passwd").as_deref(), Some("etc_passwd"));
        assert_eq!(sanitize_component("..."), None);
        assert_eq!(sanitize_component(""), None);
    }

    #[tokio::test]
    async fn test_purge_tombstones() {
        let root = TempDir::new().unwrap();
        let storage = ExportStorage::new(root.path()).unwrap();
        std::fs::create_dir_all(root.path().join(".abc.evicting-1")).unwrap();
        std::fs::create_dir_all(root.path().join("keep")).unwrap();

        assert_eq!(storage.purge_tombstones().await.unwrap(), 1);
        assert!(root.path().join("keep").exists());
    }
}
