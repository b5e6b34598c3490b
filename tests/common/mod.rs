//! Shared fixtures for CLI integration tests.
//!
//! [`UpdateEnv`] lays out an installation, a state directory (`ARCPRESS_HOME`)
//! and a local release feed served over `file://` URLs.

use assert_cmd::Command;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A published release: its feed entry fields.
pub struct Release {
    pub version: String,
    pub url: String,
    pub checksum: String,
    pub size: u64,
}

impl Release {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "download_url": self.url,
            "checksum": self.checksum,
            "size": self.size,
            "notes": format!("Release notes for {}", self.version),
        })
    }
}

pub struct UpdateEnv {
    _temp_dir: TempDir,
    pub home: PathBuf,
    pub install: PathBuf,
    pub releases: PathBuf,
}

impl UpdateEnv {
    /// An installation of version 1.0.0 with two files.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let home = temp_dir.path().join("home");
        let install = temp_dir.path().join("install");
        let releases = temp_dir.path().join("releases");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&releases).unwrap();

        let env = Self {
            _temp_dir: temp_dir,
            home,
            install,
            releases,
        };
        env.write_install_file("arcpress.bin", "binary 1.0.0");
        env.write_install_file("data/readme.txt", "readme 1.0.0");
        env.write_install_file(
            "version.json",
            r#"{"version":"1.0.0","updated_at":"2026-01-01T00:00:00Z"}"#,
        );
        env
    }

    pub fn write_install_file(&self, relative: &str, content: &str) {
        let path = self.install.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn read_install_file(&self, relative: &str) -> String {
        fs::read_to_string(self.install.join(relative)).unwrap()
    }

    pub fn feed_path(&self) -> PathBuf {
        self.releases.join("feed.json")
    }

    /// Write a release ZIP and return its feed entry.
    pub fn publish(&self, version: &str, entries: &[(&str, &str)]) -> Release {
        let path = self.releases.join(format!("arcpress-{version}.zip"));
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();

        let bytes = fs::read(&path).unwrap();
        Release {
            version: version.to_string(),
            url: file_url(&path),
            checksum: hex::encode(Sha256::digest(&bytes)),
            size: bytes.len() as u64,
        }
    }

    pub fn write_feed(&self, releases: &[Release]) {
        let entries: Vec<serde_json::Value> = releases.iter().map(Release::to_json).collect();
        let feed = serde_json::json!({ "releases": entries });
        fs::write(self.feed_path(), serde_json::to_string_pretty(&feed).unwrap()).unwrap();
    }

    /// Write `config.toml` pointing at the local feed, plus extra `[updates]` keys.
    pub fn write_config(&self, extra: &str) {
        let content = format!(
            "[updates]\nupdate_server_url = \"{}\"\n{extra}\n",
            file_url(&self.feed_path())
        );
        fs::write(self.config_path(), content).unwrap();
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn backup_ids(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.install.join("backup")) else {
            return Vec::new();
        };
        let mut ids: Vec<String> =
            entries.map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect();
        ids.sort();
        ids
    }

    /// `arcpress --install-dir <install> <args>` with an isolated home.
    pub fn arcpress(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("arcpress").unwrap();
        cmd.arg("--install-dir")
            .arg(&self.install)
            .arg("--no-progress")
            .args(args)
            .env("ARCPRESS_HOME", &self.home)
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG");
        cmd
    }
}

pub fn file_url(path: &Path) -> String {
    reqwest::Url::from_file_path(path).unwrap().to_string()
}
