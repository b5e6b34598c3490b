use crate::common::UpdateEnv;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_apply_installs_update() {
    let env = UpdateEnv::new();
    let release = env.publish(
        "1.1.0",
        &[("arcpress.bin", "binary 1.1.0"), ("data/readme.txt", "readme 1.1.0"), ("plugins/lz.dat", "lz")],
    );
    env.write_feed(&[release]);
    env.write_config("");

    env.arcpress(&["update", "apply"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated arcpress 1.0.0 -> 1.1.0"));

    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.1.0");
    assert_eq!(env.read_install_file("plugins/lz.dat"), "lz");

    let descriptor: serde_json::Value =
        serde_json::from_str(&env.read_install_file("version.json")).unwrap();
    assert_eq!(descriptor["version"], "1.1.0");
    assert_eq!(descriptor["previous_version"], "1.0.0");

    assert_eq!(env.backup_ids().len(), 1);
    assert!(env.backup_ids()[0].starts_with("backup_v1.0.0_"));
    assert!(!env.home.join("staging").exists() || fs::read_dir(env.home.join("staging")).unwrap().next().is_none());

    // The new version is now current.
    env.arcpress(&["update", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("arcpress 1.1.0 is up to date"));
}

#[test]
fn test_apply_rejects_tampered_artifact() {
    let env = UpdateEnv::new();
    let mut release = env.publish("1.1.0", &[("arcpress.bin", "binary 1.1.0")]);
    release.checksum = "0".repeat(64);
    env.write_feed(&[release]);
    env.write_config("");

    env.arcpress(&["update", "apply"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Checksum mismatch"));

    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.0.0");
    assert!(env.backup_ids().is_empty());

    env.arcpress(&["update", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed"));
}

#[test]
fn test_apply_without_backups_needs_acknowledgement() {
    let env = UpdateEnv::new();
    let release = env.publish("1.1.0", &[("arcpress.bin", "binary 1.1.0")]);
    env.write_feed(&[release]);
    env.write_config("backup_enabled = false");

    env.arcpress(&["update", "apply"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot be rolled back"));
    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.0.0");

    env.arcpress(&["update", "apply", "--accept-no-backup"])
        .assert()
        .success();
    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.1.0");
    assert!(env.backup_ids().is_empty());
}

#[test]
fn test_failed_apply_is_rolled_back() {
    let env = UpdateEnv::new();
    // A directory where the release ships a file cannot be replaced.
    env.write_install_file("zz_plugins/keep.dat", "keep");
    let release = env.publish(
        "1.1.0",
        &[("arcpress.bin", "binary 1.1.0"), ("new.dat", "new"), ("zz_plugins", "not a directory")],
    );
    env.write_feed(&[release]);
    env.write_config("");

    env.arcpress(&["update", "apply"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("restored"));

    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.0.0");
    assert!(!env.install.join("new.dat").exists());
    assert_eq!(env.read_install_file("zz_plugins/keep.dat"), "keep");
    assert!(env.read_install_file("version.json").contains("\"1.0.0\""));

    env.arcpress(&["update", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rolled_back"));
}

#[test]
fn test_apply_when_up_to_date_changes_nothing() {
    let env = UpdateEnv::new();
    env.write_feed(&[]);
    env.write_config("");

    env.arcpress(&["update", "apply"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is up to date"));
    assert!(env.backup_ids().is_empty());
}
