use crate::common::UpdateEnv;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_check_reports_up_to_date() {
    let env = UpdateEnv::new();
    let old = env.publish("0.9.0", &[("arcpress.bin", "binary 0.9.0")]);
    env.write_feed(&[old]);
    env.write_config("");

    env.arcpress(&["update", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("arcpress 1.0.0 is up to date"));

    env.arcpress(&["update", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No updates recorded"));
}

#[test]
fn test_check_finds_stable_candidate() {
    let env = UpdateEnv::new();
    let stable = env.publish("1.1.0", &[("arcpress.bin", "binary 1.1.0")]);
    let beta = env.publish("1.2.0-beta", &[("arcpress.bin", "binary 1.2.0-beta")]);
    env.write_feed(&[stable, beta]);
    env.write_config("");

    env.arcpress(&["update", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Update available: 1.0.0 -> 1.1.0"))
        .stdout(predicate::str::contains("arcpress update apply"));

    // Checking never modifies the installation.
    assert_eq!(env.read_install_file("arcpress.bin"), "binary 1.0.0");
    let config = fs::read_to_string(env.config_path()).unwrap();
    assert!(config.contains("last_check"), "last_check not recorded:\n{config}");
}

#[test]
fn test_check_includes_prereleases_when_allowed() {
    let env = UpdateEnv::new();
    let stable = env.publish("1.1.0", &[("arcpress.bin", "1.1.0")]);
    let beta = env.publish("1.2.0-beta", &[("arcpress.bin", "1.2.0-beta")]);
    env.write_feed(&[stable, beta]);
    env.write_config("allow_prereleases = true");

    env.arcpress(&["update", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.0.0 -> 1.2.0-beta"));
}

#[test]
fn test_check_if_due_skips_recent_check() {
    let env = UpdateEnv::new();
    let release = env.publish("1.1.0", &[("arcpress.bin", "1.1.0")]);
    env.write_feed(&[release]);
    env.write_config("");

    env.arcpress(&["update", "check", "--if-due"]).assert().success();

    // The feed is gone, so a real check would fail.
    fs::remove_file(env.feed_path()).unwrap();
    env.arcpress(&["update", "check", "--if-due"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Next update check is due"));
}

#[test]
fn test_check_with_unreachable_feed_fails() {
    let env = UpdateEnv::new();
    env.write_config("");

    env.arcpress(&["update", "check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Network error during feed fetch"));

    env.arcpress(&["update", "history", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"outcome\": \"failed\""));
}

#[test]
fn test_malformed_feed_entries_are_skipped() {
    let env = UpdateEnv::new();
    let good = env.publish("1.0.5", &[("arcpress.bin", "1.0.5")]);
    let feed = serde_json::json!({
        "releases": [
            good.to_json(),
            { "version": "2.0.0", "download_url": "file:///nowhere.zip" },
            { "version": "not-a-version", "download_url": "x", "checksum": good.checksum },
        ]
    });
    fs::write(env.feed_path(), feed.to_string()).unwrap();
    env.write_config("");

    env.arcpress(&["update", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.0.0 -> 1.0.5"));
}

#[test]
fn test_invalid_config_is_reported() {
    let env = UpdateEnv::new();
    env.write_config("check_frequency_hours = 0");

    env.arcpress(&["update", "check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("check_frequency_hours"));
}

#[test]
fn test_dismissed_version_is_not_offered() {
    let env = UpdateEnv::new();
    let minor = env.publish("1.1.0", &[("arcpress.bin", "binary 1.1.0")]);
    let major = env.publish("2.0.0", &[("arcpress.bin", "binary 2.0.0")]);
    env.write_feed(&[minor, major]);
    env.write_config("");

    env.arcpress(&["update", "dismiss", "v2.0.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2.0.0 will no longer be offered"));
    let config = fs::read_to_string(env.config_path()).unwrap();
    assert!(
        config.contains("dismissed_versions") && config.contains("\"2.0.0\""),
        "not saved:\n{config}"
    );

    env.arcpress(&["update", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Update available: 1.0.0 -> 1.1.0"));

    env.arcpress(&["update", "dismiss", "2.0"]).assert().code(1);
}
