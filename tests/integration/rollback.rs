use crate::common::UpdateEnv;
use predicates::prelude::*;

#[test]
fn test_rollback_restores_backup() {
    let env = UpdateEnv::new();
    let release = env.publish("1.1.0", &[("arcpress.bin", "binary 1.1.0")]);
    env.write_feed(&[release]);
    env.write_config("");
    env.arcpress(&["update", "apply"]).assert().success();

    let ids = env.backup_ids();
    assert_eq!(ids.len(), 1);

    env.arcpress(&["update", "backups"])
        .assert()
        .success()
        .stdout(predicate::str::contains(ids[0].as_str()).and(predicate::str::contains("version 1.0.0")));

    env.arcpress(&["update", "rollback", &ids[0]])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored arcpress 1.0.0"));

    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.0.0");
    assert!(env.read_install_file("version.json").contains("\"1.0.0\""));

    env.arcpress(&["update", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rolled_back"));
}

#[test]
fn test_rollback_of_unknown_backup_exits_with_two() {
    let env = UpdateEnv::new();
    env.write_config("");

    env.arcpress(&["update", "rollback", "backup_v0.1.0_20260101_000000_000000"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Rollback from"));
}

#[test]
fn test_backups_empty() {
    let env = UpdateEnv::new();
    env.arcpress(&["update", "backups"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups"));
}
