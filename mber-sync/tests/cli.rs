use assert_cmd::Command;
use mber_sync::cli::{read_session, write_session};
use mber_sync::load_config::load_config;
use mber_sync_core::session::{BuildStatus, SessionState};
use predicates::prelude::*;
use serial_test::serial;
use std::fs::write;
use tempfile::{tempdir, NamedTempFile};

fn config_with_url(url: &str) -> NamedTempFile {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(
        config.path(),
        format!("url: \"{url}\"\napplication: my-game\nusername: ci-bot\nattempts: 1\nretry_wait_seconds: 0\n"),
    )
    .expect("Writing temp config failed");
    config
}

#[test]
fn cli_help_lists_every_step() {
    let mut cmd = Command::cargo_bin("mber-sync").expect("Binary exists");
    cmd.arg("--help");
    cmd.assert().success().stdout(
        predicate::str::contains("validate")
            .and(predicate::str::contains("start"))
            .and(predicate::str::contains("upload"))
            .and(predicate::str::contains("download"))
            .and(predicate::str::contains("finish")),
    );
}

#[test]
fn cli_fails_on_missing_config_even_when_optional() {
    let mut cmd = Command::cargo_bin("mber-sync").expect("Binary exists");
    cmd.args(["--config", "does/not/exist.yaml", "--optional", "validate"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn validate_rejects_a_url_that_is_not_mber() {
    let config = config_with_url("not a url");
    let mut cmd = Command::cargo_bin("mber-sync").expect("Binary exists");
    cmd.arg("--config")
        .arg(config.path())
        .arg("validate")
        .env("MBER_PASSWORD", "hunter2");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("does not look like an Mber service"));
}

#[test]
fn optional_step_failure_exits_successfully() {
    let config = config_with_url("not a url");
    let mut cmd = Command::cargo_bin("mber-sync").expect("Binary exists");
    cmd.arg("--config")
        .arg(config.path())
        .arg("--optional")
        .arg("validate")
        .env("MBER_PASSWORD", "hunter2");
    cmd.assert().success();
}

#[test]
#[serial]
fn session_file_round_trips_between_steps() {
    std::env::set_var("MBER_PASSWORD", "hunter2");
    let config = load_config(config_with_url("https://mber.example/").path()).unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");

    let fresh = read_session(&path, &config).unwrap();
    assert_eq!(fresh, config.session());

    let mut state = SessionState::new("https://mber.example/", "my-game");
    state.access_token = "tok".into();
    state.build_id = "b-1".into();
    state.build_alias = "game/42/".into();
    state.record(&[BuildStatus::Running]);
    write_session(&path, &state).unwrap();

    let restored = read_session(&path, &config).unwrap();
    assert_eq!(restored, state);
}

#[test]
#[serial]
fn partial_session_file_is_completed_from_config() {
    std::env::set_var("MBER_PASSWORD", "hunter2");
    let config = load_config(config_with_url("https://mber.example/").path()).unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");
    write(&path, r#"{"buildId": "b-9"}"#).unwrap();

    let state = read_session(&path, &config).unwrap();
    assert_eq!(state.build_id, "b-9");
    assert_eq!(state.url, "https://mber.example/");
    assert_eq!(state.application, "my-game");
}
