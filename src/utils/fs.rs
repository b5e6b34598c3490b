//! File system helpers shared by the update engine.
//!
//! - [`atomic_write`] writes through a synced temp file and a rename, so readers
//!   never observe a half-written descriptor or manifest.
//! - [`collect_relative_files`] lists every regular file under a directory as
//!   paths relative to it, in a stable order.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Write `content` to `path` atomically, creating parent directories.
pub async fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Every regular file below `root`, relative to `root`, sorted.
///
/// Symlinks are not followed. Runs on the blocking pool since `walkdir` is
/// synchronous.
pub async fn collect_relative_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(io::Error::other)?
                    .to_path_buf();
                files.push(relative);
            }
        }
        Ok(files)
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_atomic_write_creates_parent_dirs() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("subdir").join("version.json");

        atomic_write(&file_path, b"{}").await.unwrap();

        assert_eq!(std::fs::read(&file_path).unwrap(), b"{}");
        assert!(!temp.path().join("subdir").join("version.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_existing() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("data.txt");
        std::fs::write(&file_path, "old").unwrap();

        atomic_write(&file_path, b"new").await.unwrap();

        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_collect_relative_files() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("b/c")).unwrap();
        std::fs::create_dir_all(temp.path().join("empty")).unwrap();
        std::fs::write(temp.path().join("a.txt"), "").unwrap();
        std::fs::write(temp.path().join("b/c/d.txt"), "").unwrap();

        let files = collect_relative_files(temp.path()).await.unwrap();
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("b/c/d.txt")]);
    }
}
