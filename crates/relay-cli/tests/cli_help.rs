use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_shows_all_commands() {
    cargo_bin_cmd!("relay")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("recipe"));
}

#[test]
fn test_chat_help_shows_flags() {
    cargo_bin_cmd!("relay")
        .args(["chat", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--recipe"))
        .stdout(predicate::str::contains("--param"))
        .stdout(predicate::str::contains("--resume"))
        .stdout(predicate::str::contains("--working-dir"));
}

#[test]
fn test_recipe_help_shows_subcommands() {
    cargo_bin_cmd!("relay")
        .args(["recipe", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("render"));
}

#[test]
fn test_resume_conflicts_with_new() {
    cargo_bin_cmd!("relay")
        .args(["chat", "--resume", "abc", "--new"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_version_flag() {
    cargo_bin_cmd!("relay")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1"));
}
