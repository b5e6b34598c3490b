use crate::common::UpdateEnv;
use predicates::prelude::*;

#[test]
fn test_history_lists_outcomes_in_order() {
    let env = UpdateEnv::new();
    let first = env.publish("1.1.0", &[("arcpress.bin", "binary 1.1.0")]);
    env.write_feed(&[first]);
    env.write_config("");
    env.arcpress(&["update", "apply"]).assert().success();

    let second = env.publish("1.2.0", &[("arcpress.bin", "binary 1.2.0")]);
    env.write_feed(&[second]);
    env.arcpress(&["update", "apply"]).assert().success();

    let output = env.arcpress(&["update", "history", "--json"]).assert().success();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&output.get_output().stdout).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["version"], "1.1.0");
    assert_eq!(entries[0]["outcome"], "applied");
    assert_eq!(entries[1]["version"], "1.2.0");
    assert!(entries[1]["session_id"].is_string());

    env.arcpress(&["update", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.1.0").and(predicate::str::contains("applied")));
}

#[test]
fn test_history_is_empty_initially() {
    let env = UpdateEnv::new();
    let output = env.arcpress(&["update", "history", "--json"]).assert().success();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&output.get_output().stdout).unwrap();
    assert!(entries.is_empty());
}
