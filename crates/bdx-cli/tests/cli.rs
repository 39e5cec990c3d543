// SPDX-License-Identifier: MIT OR Apache-2.0
//! Argument-parsing smoke tests that never touch a database: clap rejects
//! malformed invocations before `main` ever calls `CliContext::load`.

use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn help_lists_every_top_level_subcommand() {
    Command::cargo_bin("bdx")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("assets-roots"))
        .stdout(contains("assets-fanout-roots"))
        .stdout(contains("worker"))
        .stdout(contains("ingest"));
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    Command::cargo_bin("bdx").unwrap().assert().failure().code(2);
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    Command::cargo_bin("bdx").unwrap().arg("not-a-real-command").assert().failure().code(2);
}

#[test]
fn roots_enable_rejects_instance_id_combined_with_slug() {
    Command::cargo_bin("bdx")
        .unwrap()
        .args(["assets-roots", "enable", "--instance-id", "1", "--slug", "segment_followers"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("cannot be used with"));
}

#[test]
fn fanout_roots_enable_rejects_unknown_fanout_mode() {
    Command::cargo_bin("bdx")
        .unwrap()
        .args([
            "assets-fanout-roots",
            "enable",
            "--source-instance-id",
            "1",
            "--target-slug",
            "segment_followers",
            "--fanout-mode",
            "not-a-mode",
        ])
        .assert()
        .failure()
        .code(2);
}
