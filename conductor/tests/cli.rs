//! CLI tests: spawn the conductor binary and check exit codes and output.

use std::fs;
use std::process::Command;

use conductor::exit_codes;
use conductor::io::init::{InitOptions, init_conductor};

fn conductor(root: &std::path::Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_conductor"));
    command.arg("--root").arg(root);
    command
}

#[test]
fn check_accepts_the_scaffolded_sample_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_conductor(temp.path(), &InitOptions { force: false }).expect("init");

    let output = conductor(temp.path()).arg("check").output().expect("conductor check");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("reviewer (tool: review_code)"));
}

#[test]
fn check_reports_every_broken_specification() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_conductor(temp.path(), &InitOptions { force: false }).expect("init");
    fs::write(paths.agents_dir.join("empty.toml"), "id = \"empty\"\n").expect("write");
    fs::write(paths.agents_dir.join("broken.json"), "{ not json").expect("write");

    let output = conductor(temp.path()).arg("check").output().expect("conductor check");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("empty.toml"));
    assert!(stderr.contains("broken.json"));
}

#[test]
fn preview_prints_the_rendered_instructions() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_conductor(temp.path(), &InitOptions { force: false }).expect("init");

    let output = conductor(temp.path())
        .args([
            "preview",
            "reviewer",
            "--description",
            "check token expiry",
            "--input",
            r#"{"target":"src/auth.rs"}"#,
        ])
        .output()
        .expect("conductor preview");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Review src/auth.rs. Focus: check token expiry"));
    assert!(stdout.contains("# Response Contract"));
}

#[test]
fn init_twice_without_force_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = conductor(temp.path()).arg("init").status().expect("first init");
    assert_eq!(first.code(), Some(exit_codes::OK));
    let second = conductor(temp.path()).arg("init").status().expect("second init");
    assert_eq!(second.code(), Some(exit_codes::INVALID));
}

#[test]
fn sessions_is_empty_before_any_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_conductor(temp.path(), &InitOptions { force: false }).expect("init");
    let output = conductor(temp.path())
        .arg("sessions")
        .output()
        .expect("conductor sessions");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(output.stdout.is_empty());
}
