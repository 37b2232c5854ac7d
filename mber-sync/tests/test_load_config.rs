use mber_sync::load_config::{load_config, PASSWORD_ENV};
use serial_test::serial;
use std::env;
use std::fs::write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), yaml).unwrap();
    config_file
}

#[test]
#[serial]
fn test_load_config_applies_defaults_and_reads_password_from_env() {
    let config_file = config_file(
        r#"
application: my-game
username: ci-bot
"#,
    );
    env::set_var(PASSWORD_ENV, "hunter2");

    let config = load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.url, "https://member.firepub.net/");
    assert_eq!(config.application, "my-game");
    assert_eq!(config.username, "ci-bot");
    assert_eq!(config.password, "hunter2");
    assert_eq!(config.attempts, 5);
    assert_eq!(config.retry_wait_seconds, 10);

    let retry = config.retry();
    assert_eq!(retry.max_attempts(), 5);
    assert_eq!(retry.backoff(1), Duration::from_secs(10));

    let session = config.session();
    assert_eq!(session.url, "https://member.firepub.net/");
    assert_eq!(session.application, "my-game");
    assert!(session.access_token.is_empty());
}

#[test]
#[serial]
fn test_load_config_honours_explicit_values() {
    let config_file = config_file(
        r#"
url: "  https://mber.example/  "
application: my-game
username: ci-bot
attempts: -3
retry_wait_seconds: 0
"#,
    );
    env::set_var(PASSWORD_ENV, "hunter2");

    let config = load_config(config_file.path()).expect("Config should load");
    assert_eq!(config.url, "https://mber.example/");
    assert_eq!(config.retry().max_attempts(), 3);
    assert_eq!(config.retry().backoff(2), Duration::ZERO);
}

#[test]
#[serial]
fn test_load_config_requires_password_env() {
    let config_file = config_file("application: my-game\nusername: ci-bot\n");
    env::remove_var(PASSWORD_ENV);

    let err = load_config(config_file.path()).expect_err("Missing password must fail");
    assert!(
        err.to_string().contains(PASSWORD_ENV),
        "error should name the variable, got: {err}"
    );
}

#[test]
#[serial]
fn test_load_config_rejects_incomplete_yaml() {
    let config_file = config_file("url: https://mber.example/\n");
    env::set_var(PASSWORD_ENV, "hunter2");

    let err = load_config(config_file.path()).expect_err("Missing application must fail");
    assert!(err.to_string().contains("Failed to parse config YAML"));
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config("does/not/exist.yaml").expect_err("Missing file must fail");
    assert!(err.to_string().contains("Failed to read config file"));
}
