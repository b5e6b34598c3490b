//! Update artifact handling: ZIP validation, extraction and file replacement.
//!
//! An artifact is a ZIP archive whose contents mirror the installation
//! directory. Applying it copies every extracted file over the installation;
//! the version descriptor is written separately once all files are in place.

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::core::{UpdateError, UpdateResult};
use crate::update::descriptor::DESCRIPTOR_FILE;

/// Extracted artifact contents.
#[derive(Debug, Clone)]
pub struct ExtractedArtifact {
    pub root: PathBuf,
    /// Every extracted file, relative to `root`, sorted.
    pub files: Vec<PathBuf>,
}

/// Which installation files an apply will touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    /// Files that exist now and will be replaced.
    pub overwritten: Vec<PathBuf>,
    /// Files that do not exist yet.
    pub created: Vec<PathBuf>,
}

impl ApplyPlan {
    /// Every file in apply order.
    pub fn all_files(&self) -> impl Iterator<Item = &PathBuf> {
        let mut all: Vec<&PathBuf> = self.overwritten.iter().chain(&self.created).collect();
        all.sort();
        all.into_iter()
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> UpdateError {
    UpdateError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Validate `archive` and extract it into `dest`.
///
/// The archive must contain at least one file, every entry must be readable
/// and stay inside `dest`, and every path in `required_paths` must be present
/// afterwards (as a file or a directory).
///
/// # Errors
///
/// Returns [`UpdateError::InvalidArtifact`] for any validation failure and
/// [`UpdateError::Io`] if `dest` cannot be written.
pub async fn extract_artifact(
    archive: &Path,
    dest: &Path,
    required_paths: &[String],
) -> UpdateResult<ExtractedArtifact> {
    let archive_path = archive.to_path_buf();
    let dest_path = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip(&archive_path, &dest_path))
        .await
        .map_err(|e| invalid(archive, format!("extraction task failed: {e}")))??;

    for required in required_paths {
        let relative = Path::new(required);
        if !is_plain_relative(relative) {
            return Err(invalid(archive, format!("required path '{required}' is not a relative path")));
        }
        if fs::metadata(dest.join(relative)).await.is_err() {
            return Err(invalid(archive, format!("missing required path '{required}'")));
        }
    }

    let files = crate::utils::fs::collect_relative_files(dest)
        .await
        .map_err(|e| UpdateError::io("list extracted files", dest, e))?;
    if files.is_empty() {
        return Err(invalid(archive, "archive contains no files"));
    }

    debug!("Extracted {} files from {}", files.len(), archive.display());
    Ok(ExtractedArtifact {
        root: dest.to_path_buf(),
        files,
    })
}

fn extract_zip(zip_path: &Path, dest: &Path) -> UpdateResult<()> {
    let file = std::fs::File::open(zip_path).map_err(|e| UpdateError::ReadError {
        path: zip_path.to_path_buf(),
        source: e,
    })?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| invalid(zip_path, format!("not a valid ZIP archive: {e}")))?;
    if archive.len() == 0 {
        return Err(invalid(zip_path, "archive is empty"));
    }

    std::fs::create_dir_all(dest).map_err(|e| UpdateError::io("create extraction directory", dest, e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| invalid(zip_path, format!("unreadable entry #{i}: {e}")))?;
        let Some(name) = entry.enclosed_name() else {
            return Err(invalid(zip_path, format!("entry '{}' escapes the archive root", entry.name())));
        };
        let out_path = dest.join(&name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| UpdateError::io("create extraction directory", &out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UpdateError::io("create extraction directory", parent, e))?;
        }
        let mut outfile = std::fs::File::create(&out_path)
            .map_err(|e| UpdateError::io("create extracted file", &out_path, e))?;
        // Reading to the end checks the entry's CRC.
        io::copy(&mut entry, &mut outfile).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                invalid(zip_path, format!("corrupt entry '{}': {e}", name.display()))
            } else {
                UpdateError::io("extract archive entry", &out_path, e)
            }
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    Ok(())
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Paths the artifact may not overwrite: the descriptor (written by the
/// orchestrator) and anything under the backup directory.
fn is_reserved(relative: &Path) -> bool {
    relative == Path::new(DESCRIPTOR_FILE)
        || relative.components().next().is_some_and(|c| c.as_os_str() == "backup")
}

/// Split the artifact's files into those that replace existing files and those
/// that are new.
///
/// # Errors
///
/// Returns [`UpdateError::Io`] if a target cannot be inspected, for example
/// when an installed file sits where the artifact needs a directory.
pub async fn plan_apply(artifact: &ExtractedArtifact, install_dir: &Path) -> UpdateResult<ApplyPlan> {
    let mut plan = ApplyPlan::default();
    for relative in &artifact.files {
        if is_reserved(relative) {
            warn!("Ignoring reserved path in artifact: {}", relative.display());
            continue;
        }
        let target = install_dir.join(relative);
        match fs::symlink_metadata(&target).await {
            Ok(_) => plan.overwritten.push(relative.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => plan.created.push(relative.clone()),
            Err(e) => return Err(UpdateError::io("inspect install path", target, e)),
        }
    }
    Ok(plan)
}

/// Copy every planned file from the artifact into `install_dir`.
///
/// Each file is written to a temporary sibling and renamed into place, so a
/// target is either the old or the new content. Stops at the first failure.
pub async fn apply_plan(artifact: &ExtractedArtifact, plan: &ApplyPlan, install_dir: &Path) -> UpdateResult<()> {
    for relative in plan.all_files() {
        let source = artifact.root.join(relative);
        let target = install_dir.join(relative);
        let parent = target.parent().unwrap_or(install_dir);
        fs::create_dir_all(parent)
            .await
            .map_err(|e| UpdateError::io("create install directory", parent, e))?;

        let file_name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let temp = parent.join(format!(".{file_name}.update"));
        fs::copy(&source, &temp)
            .await
            .map_err(|e| UpdateError::io("copy update file", &target, e))?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(UpdateError::io("replace installed file", &target, e));
        }
        debug!("Installed {}", relative.display());
    }
    Ok(())
}

/// Remove files an interrupted apply created. Files that were never written
/// are ignored; directories left empty are removed.
pub async fn remove_created(install_dir: &Path, created: &[PathBuf]) -> UpdateResult<()> {
    for relative in created {
        let target = install_dir.join(relative);
        match fs::remove_file(&target).await {
            Ok(()) => debug!("Removed {}", relative.display()),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {}
            Err(e) => return Err(UpdateError::io("remove file created by update", &target, e)),
        }

        let mut dir = target.parent();
        while let Some(parent) = dir {
            if parent == install_dir || fs::remove_dir(parent).await.is_err() {
                break;
            }
            dir = parent.parent();
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Build a ZIP at `path` from `(name, contents)` pairs.
    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extract_valid_archive() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("update.zip");
        write_zip(&zip_path, &[("arcpress", b"bin"), ("lib/", b""), ("lib/core.dat", b"core")]);

        let extracted = extract_artifact(&zip_path, &temp.path().join("out"), &["lib".to_string()])
            .await
            .unwrap();
        assert_eq!(extracted.files, vec![PathBuf::from("arcpress"), PathBuf::from("lib/core.dat")]);
        assert_eq!(std::fs::read(temp.path().join("out/lib/core.dat")).unwrap(), b"core");
    }

    #[tokio::test]
    async fn test_extract_rejects_missing_required_path() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("update.zip");
        write_zip(&zip_path, &[("arcpress", b"bin")]);

        let err = extract_artifact(&zip_path, &temp.path().join("out"), &["lib".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArtifact { .. }));
    }

    #[tokio::test]
    async fn test_extract_rejects_non_zip_and_empty() {
        let temp = TempDir::new().unwrap();
        let not_zip = temp.path().join("bad.zip");
        std::fs::write(&not_zip, b"definitely not a zip").unwrap();
        let err = extract_artifact(&not_zip, &temp.path().join("out1"), &[]).await.unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArtifact { .. }));

        let only_dirs = temp.path().join("dirs.zip");
        write_zip(&only_dirs, &[("lib/", b"")]);
        let err = extract_artifact(&only_dirs, &temp.path().join("out2"), &[]).await.unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArtifact { .. }));
    }

    #[tokio::test]
    async fn test_extract_rejects_escaping_entries() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("evil.zip");
        write_zip(&zip_path, &[("../evil.txt", b"x")]);

        let err = extract_artifact(&zip_path, &temp.path().join("out"), &[]).await.unwrap_err();
        assert!(matches!(err, UpdateError::InvalidArtifact { .. }));
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn test_plan_apply_and_remove_created() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join("arcpress"), b"old").unwrap();

        let zip_path = temp.path().join("update.zip");
        write_zip(
            &zip_path,
            &[("arcpress", b"new"), ("plugins/extra.dat", b"extra"), ("version.json", b"{}")],
        );
        let extracted = extract_artifact(&zip_path, &temp.path().join("out"), &[]).await.unwrap();

        let plan = plan_apply(&extracted, &install).await.unwrap();
        assert_eq!(plan.overwritten, vec![PathBuf::from("arcpress")]);
        assert_eq!(plan.created, vec![PathBuf::from("plugins/extra.dat")]);

        apply_plan(&extracted, &plan, &install).await.unwrap();
        assert_eq!(std::fs::read(install.join("arcpress")).unwrap(), b"new");
        assert_eq!(std::fs::read(install.join("plugins/extra.dat")).unwrap(), b"extra");
        assert!(!install.join("version.json").exists());

        remove_created(&install, &plan.created).await.unwrap();
        assert!(!install.join("plugins").exists());
        assert!(install.join("arcpress").exists());
    }

    #[tokio::test]
    async fn test_plan_apply_rejects_file_in_place_of_directory() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join("plugins"), b"not a directory").unwrap();

        let zip_path = temp.path().join("update.zip");
        write_zip(&zip_path, &[("arcpress", b"new"), ("plugins/x.dat", b"x")]);
        let extracted = extract_artifact(&zip_path, &temp.path().join("out"), &[]).await.unwrap();

        let err = plan_apply(&extracted, &install).await.unwrap_err();
        assert!(matches!(err, UpdateError::Io { .. }));
    }

    #[tokio::test]
    async fn test_remove_created_ignores_paths_under_a_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("plugins"), b"file").unwrap();

        remove_created(temp.path(), &[PathBuf::from("plugins/x.dat"), PathBuf::from("gone.txt")])
            .await
            .unwrap();
        assert_eq!(std::fs::read(temp.path().join("plugins")).unwrap(), b"file");
    }
}
