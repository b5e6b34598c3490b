//! Pre-update snapshots of the installation and atomic restore.
//!
//! A backup is a directory `backup_v{version}_{YYYYmmdd_HHMMSS_ffffff}` under the
//! backup root (by default `<install_dir>/backup`). It mirrors the relative layout
//! of every captured file and carries a `backup_info.json` manifest recording the
//! size and SHA-256 of each file. Backups are never modified after creation.
//!
//! # Restore guarantees
//!
//! [`BackupManager::restore`] works in two phases:
//!
//! 1. **Stage**: every backed-up file is checked against its manifest checksum and
//!    copied next to its target under a temporary name. A failure here removes all
//!    staged files and leaves the installation untouched.
//! 2. **Commit**: staged files are renamed over their targets. Renames within one
//!    directory are atomic on every supported platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{UpdateError, UpdateResult};
use crate::update::{ChecksumVerifier, Version};
use crate::utils::fs::collect_relative_files;

/// Name of the manifest written into every backup directory.
pub const MANIFEST_FILE: &str = "backup_info.json";

const BACKUP_PREFIX: &str = "backup_v";

/// One file captured in a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the installation directory.
    pub relative_path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the backed-up copy.
    pub sha256: String,
}

/// A completed backup, as persisted in `backup_info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub source_version: Version,
    /// Backup directory. Derived from the location the record was loaded from.
    #[serde(skip)]
    pub path: PathBuf,
    pub file_manifest: Vec<ManifestEntry>,
}

impl BackupRecord {
    /// Total size of all captured files.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.file_manifest.iter().map(|e| e.size).sum()
    }
}

/// Creates, lists and restores installation backups.
pub struct BackupManager {
    backup_root: PathBuf,
}

impl BackupManager {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
        }
    }

    /// Manager using the default `<install_dir>/backup` root.
    pub fn for_install_dir(install_dir: &Path) -> Self {
        Self::new(install_dir.join("backup"))
    }

    #[must_use]
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Snapshot `relative_files` from `install_dir`.
    ///
    /// A listed directory is captured with every file beneath it. Listed paths
    /// that do not exist are skipped; they are not part of the current
    /// installation. Cancellation is checked between files, and a cancelled or
    /// failed backup leaves no directory behind.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::InsufficientSpace`] if the files do not fit on the backup volume
    /// - [`UpdateError::Io`] if a copy or the manifest write fails
    /// - [`UpdateError::Cancelled`] if `cancel` fires
    pub async fn create_backup(
        &self,
        install_dir: &Path,
        relative_files: &[PathBuf],
        source_version: &Version,
        cancel: &CancellationToken,
    ) -> UpdateResult<BackupRecord> {
        let mut present = Vec::with_capacity(relative_files.len());
        let mut required: u64 = 0;
        for relative in relative_files {
            let source = install_dir.join(relative);
            match fs::metadata(&source).await {
                Ok(meta) if meta.is_dir() => {
                    let nested = collect_relative_files(&source)
                        .await
                        .map_err(|e| UpdateError::io("list directory for backup", &source, e))?;
                    debug!("Backing up directory {} ({} files)", relative.display(), nested.len());
                    for file in nested {
                        let path = source.join(&file);
                        let meta = fs::metadata(&path)
                            .await
                            .map_err(|e| UpdateError::io("inspect file for backup", path, e))?;
                        required += meta.len();
                        present.push(relative.join(file));
                    }
                }
                Ok(meta) if meta.is_file() => {
                    required += meta.len();
                    present.push(relative.clone());
                }
                Ok(_) => debug!("Skipping special backup entry: {}", relative.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Not installed, nothing to back up: {}", relative.display());
                }
                Err(e) => return Err(UpdateError::io("inspect file for backup", source, e)),
            }
        }
        present.sort();
        present.dedup();

        fs::create_dir_all(&self.backup_root)
            .await
            .map_err(|e| UpdateError::io("create backup root", &self.backup_root, e))?;

        let available = fs4::available_space(&self.backup_root)
            .map_err(|e| UpdateError::io("query free space", &self.backup_root, e))?;
        if required > available {
            return Err(UpdateError::InsufficientSpace {
                path: self.backup_root.clone(),
                required,
                available,
            });
        }

        let created_at = Utc::now();
        let backup_id = format!(
            "{BACKUP_PREFIX}{source_version}_{}",
            created_at.format("%Y%m%d_%H%M%S_%6f")
        );
        let backup_path = self.backup_root.join(&backup_id);
        fs::create_dir(&backup_path)
            .await
            .map_err(|e| UpdateError::io("create backup directory", &backup_path, e))?;

        info!("Creating backup {} ({} files, {} bytes)", backup_id, present.len(), required);

        match Self::copy_files(install_dir, &backup_path, &present, cancel).await {
            Ok(file_manifest) => {
                let record = BackupRecord {
                    backup_id,
                    created_at,
                    source_version: source_version.clone(),
                    path: backup_path.clone(),
                    file_manifest,
                };
                if let Err(e) = Self::write_manifest(&record).await {
                    Self::discard(&backup_path).await;
                    return Err(e);
                }
                info!("Backup created at {}", backup_path.display());
                Ok(record)
            }
            Err(e) => {
                Self::discard(&backup_path).await;
                Err(e)
            }
        }
    }

    async fn copy_files(
        install_dir: &Path,
        backup_path: &Path,
        files: &[PathBuf],
        cancel: &CancellationToken,
    ) -> UpdateResult<Vec<ManifestEntry>> {
        let mut manifest = Vec::with_capacity(files.len());

        for relative in files {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled {
                    operation: "backup".to_string(),
                });
            }

            let source = install_dir.join(relative);
            let dest = backup_path.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| UpdateError::io("create backup directory", parent, e))?;
            }

            let size = fs::copy(&source, &dest)
                .await
                .map_err(|e| UpdateError::io("copy file into backup", &source, e))?;
            let sha256 = ChecksumVerifier::compute_sha256(&dest).await?;
            debug!("Backed up {} ({} bytes)", relative.display(), size);

            manifest.push(ManifestEntry {
                relative_path: relative.clone(),
                size,
                sha256,
            });
        }

        Ok(manifest)
    }

    async fn write_manifest(record: &BackupRecord) -> UpdateResult<()> {
        let path = record.path.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(record).map_err(|e| {
            UpdateError::io("serialize backup manifest", &path, std::io::Error::other(e))
        })?;
        crate::utils::fs::atomic_write(&path, &json)
            .await
            .map_err(|e| UpdateError::io("write backup manifest", &path, e))
    }

    async fn discard(backup_path: &Path) {
        if let Err(e) = fs::remove_dir_all(backup_path).await {
            warn!("Failed to remove partial backup {}: {}", backup_path.display(), e);
        }
    }

    /// Restore every file in `record` into `install_dir`.
    ///
    /// After a successful restore every manifested file matches its recorded
    /// checksum. Files not in the manifest are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if a backed-up file is missing or corrupted, or if
    /// staging or committing fails.
    pub async fn restore(&self, record: &BackupRecord, install_dir: &Path) -> UpdateResult<()> {
        warn!("Restoring {} files from backup {}", record.file_manifest.len(), record.backup_id);

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(record.file_manifest.len());
        for entry in &record.file_manifest {
            match Self::stage_entry(record, entry, install_dir).await {
                Ok(pair) => staged.push(pair),
                Err(e) => {
                    Self::remove_staged(&staged).await;
                    return Err(e);
                }
            }
        }

        for (index, (temp, target)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(temp, target).await {
                Self::remove_staged(&staged[index..]).await;
                return Err(UpdateError::io("move restored file into place", target, e));
            }
        }

        info!("Restored backup {}", record.backup_id);
        Ok(())
    }

    async fn stage_entry(
        record: &BackupRecord,
        entry: &ManifestEntry,
        install_dir: &Path,
    ) -> UpdateResult<(PathBuf, PathBuf)> {
        let source = record.path.join(&entry.relative_path);
        match ChecksumVerifier::verify(&source, &entry.sha256).await {
            Ok(()) => {}
            Err(UpdateError::ReadError {
                path,
                source,
            }) => return Err(UpdateError::io("read backup file", path, source)),
            Err(e) => {
                return Err(UpdateError::io(
                    "verify backup file",
                    &source,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                ));
            }
        }

        let target = install_dir.join(&entry.relative_path);
        let parent = target.parent().unwrap_or(install_dir);
        fs::create_dir_all(parent)
            .await
            .map_err(|e| UpdateError::io("create directory for restore", parent, e))?;

        let file_name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let temp = parent.join(format!(".{file_name}.{}.restore", record.backup_id));
        fs::copy(&source, &temp)
            .await
            .map_err(|e| UpdateError::io("stage restored file", &temp, e))?;

        Ok((temp, target))
    }

    async fn remove_staged(staged: &[(PathBuf, PathBuf)]) {
        for (temp, _) in staged {
            if let Err(e) = fs::remove_file(temp).await {
                debug!("Could not remove staged file {}: {}", temp.display(), e);
            }
        }
    }

    /// Every readable backup under the root, oldest first.
    ///
    /// Directories without a readable manifest are skipped with a warning.
    pub async fn list_backups(&self) -> UpdateResult<Vec<BackupRecord>> {
        let mut entries = match fs::read_dir(&self.backup_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpdateError::io("list backups", &self.backup_root, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UpdateError::io("list backups", &self.backup_root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(BACKUP_PREFIX) && entry.path().is_dir() {
                names.push(name);
            }
        }
        names.sort_by_key(|name| sort_key(name));

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            match self.load(&name).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("Ignoring unreadable backup {}: {}", name, e),
            }
        }
        Ok(records)
    }

    /// Load one backup by id (its directory name).
    pub async fn load(&self, backup_id: &str) -> UpdateResult<BackupRecord> {
        if backup_id.is_empty() || backup_id.contains(['/', '\\']) || backup_id.starts_with('.') {
            return Err(UpdateError::io(
                "load backup",
                self.backup_root.join(backup_id),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid backup id"),
            ));
        }

        let path = self.backup_root.join(backup_id);
        let manifest_path = path.join(MANIFEST_FILE);
        let content = fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| UpdateError::io("read backup manifest", &manifest_path, e))?;
        let mut record: BackupRecord = serde_json::from_str(&content).map_err(|e| {
            UpdateError::io(
                "parse backup manifest",
                &manifest_path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        record.path = path;
        Ok(record)
    }
}

/// The version a backup was taken from, read from its id
/// (`backup_v{version}_{timestamp}`).
#[must_use]
pub fn version_from_id(backup_id: &str) -> Option<Version> {
    let rest = backup_id.strip_prefix(BACKUP_PREFIX)?;
    let version = rest.split('_').next()?;
    Version::parse(version).ok()
}

/// Backups sort by creation timestamp (the trailing `YYYYmmdd_HHMMSS_ffffff`),
/// falling back to the full name.
fn sort_key(name: &str) -> (String, String) {
    let timestamp = name
        .rsplitn(4, '_')
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("_");
    (timestamp, name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, content: &[u8]) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn files(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[tokio::test]
    async fn test_backup_and_restore_round_trip() {
        let install = TempDir::new().unwrap();
        write(install.path(), "arcpress", b"binary v1");
        write(install.path(), "lib/core.dat", b"core v1");
        write(install.path(), "version.json", b"{\"version\":\"1.0.0\"}");

        let manager = BackupManager::for_install_dir(install.path());
        let version = Version::parse("1.0.0").unwrap();
        let record = manager
            .create_backup(
                install.path(),
                &files(&["arcpress", "lib/core.dat", "version.json", "missing.txt"]),
                &version,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(record.backup_id.starts_with("backup_v1.0.0_"));
        assert_eq!(record.file_manifest.len(), 3);
        assert!(record.path.join(MANIFEST_FILE).exists());
        assert_eq!(record.total_size(), 9 + 7 + 19);

        // Simulate a half-applied update
        write(install.path(), "arcpress", b"binary v2 broken");
        write(install.path(), "lib/core.dat", b"core v2");

        manager.restore(&record, install.path()).await.unwrap();

        assert_eq!(std::fs::read(install.path().join("arcpress")).unwrap(), b"binary v1");
        assert_eq!(std::fs::read(install.path().join("lib/core.dat")).unwrap(), b"core v1");
        for entry in &record.file_manifest {
            let actual = ChecksumVerifier::compute_sha256(&install.path().join(&entry.relative_path))
                .await
                .unwrap();
            assert_eq!(actual, entry.sha256);
        }

        // No staging leftovers
        let leftovers: Vec<_> = std::fs::read_dir(install.path().join("lib"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_with_corrupted_backup_leaves_install_untouched() {
        let install = TempDir::new().unwrap();
        write(install.path(), "a.txt", b"a1");
        write(install.path(), "b.txt", b"b1");

        let manager = BackupManager::for_install_dir(install.path());
        let record = manager
            .create_backup(
                install.path(),
                &files(&["a.txt", "b.txt"]),
                &Version::parse("1.0.0").unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        write(install.path(), "a.txt", b"a2");
        write(install.path(), "b.txt", b"b2");
        write(&record.path, "b.txt", b"tampered");

        let err = manager.restore(&record, install.path()).await.unwrap_err();
        assert!(matches!(err, UpdateError::Io { .. }));

        assert_eq!(std::fs::read(install.path().join("a.txt")).unwrap(), b"a2");
        assert_eq!(std::fs::read(install.path().join("b.txt")).unwrap(), b"b2");
        let names: Vec<_> = std::fs::read_dir(install.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".restore"))
            .collect();
        assert!(names.is_empty(), "staged files left behind: {names:?}");
    }

    #[tokio::test]
    async fn test_backup_captures_directories() {
        let install = TempDir::new().unwrap();
        write(install.path(), "arcpress", b"binary");
        write(install.path(), "core/engine.dat", b"engine v1");
        write(install.path(), "core/codecs/lzma.dat", b"lzma v1");

        let manager = BackupManager::for_install_dir(install.path());
        let record = manager
            .create_backup(
                install.path(),
                &files(&["core", "core/engine.dat", "arcpress"]),
                &Version::parse("1.0.0").unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let captured: Vec<&Path> = record.file_manifest.iter().map(|e| e.relative_path.as_path()).collect();
        assert_eq!(
            captured,
            [Path::new("arcpress"), Path::new("core/codecs/lzma.dat"), Path::new("core/engine.dat")]
        );

        std::fs::remove_dir_all(install.path().join("core")).unwrap();
        manager.restore(&record, install.path()).await.unwrap();
        assert_eq!(std::fs::read(install.path().join("core/codecs/lzma.dat")).unwrap(), b"lzma v1");
        assert_eq!(std::fs::read(install.path().join("core/engine.dat")).unwrap(), b"engine v1");
    }

    #[tokio::test]
    async fn test_cancelled_backup_removes_directory() {
        let install = TempDir::new().unwrap();
        write(install.path(), "a.txt", b"a");

        let manager = BackupManager::for_install_dir(install.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .create_backup(install.path(), &files(&["a.txt"]), &Version::parse("1.0.0").unwrap(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled { .. }));
        assert!(manager.list_backups().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(manager.backup_root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_list_and_load_backups() {
        let install = TempDir::new().unwrap();
        write(install.path(), "a.txt", b"a");
        let manager = BackupManager::for_install_dir(install.path());
        assert!(manager.list_backups().await.unwrap().is_empty());

        let first = manager
            .create_backup(
                install.path(),
                &files(&["a.txt"]),
                &Version::parse("1.0.0").unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let second = manager
            .create_backup(
                install.path(),
                &files(&["a.txt"]),
                &Version::parse("1.1.0").unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // A directory without a manifest is ignored
        std::fs::create_dir_all(manager.backup_root().join("backup_v0.1.0_broken")).unwrap();

        let listed = manager.list_backups().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.backup_id.as_str()).collect();
        assert_eq!(ids, [first.backup_id.as_str(), second.backup_id.as_str()]);

        let loaded = manager.load(&second.backup_id).await.unwrap();
        assert_eq!(loaded, second);

        assert!(manager.load("../etc").await.is_err());
        assert!(manager.load("backup_v9.9.9_none").await.is_err());
    }

    #[test]
    fn test_version_from_id() {
        assert_eq!(
            version_from_id("backup_v1.2.0-beta.1_20240101_120000_000001"),
            Some(Version::parse("1.2.0-beta.1").unwrap())
        );
        assert_eq!(version_from_id("backup_vnope_20240101"), None);
        assert_eq!(version_from_id("snapshot_1.0.0"), None);
    }

    #[test]
    fn test_sort_key_uses_timestamp() {
        let older = sort_key("backup_v2.0.0_20240101_120000_000001");
        let newer = sort_key("backup_v1.0.0_20240102_120000_000000");
        assert!(older < newer);
    }
}
