/// `load_config` module: reads the YAML access profile and injects the password from the environment.
///
/// The file names the service, the application and the user, plus retry tuning. It never
/// holds secrets: the password comes from `MBER_PASSWORD` (a `.env` file is honoured).
///
/// ```yaml
/// url: https://member.firepub.net/   # optional, empty means the default service
/// application: my-game
/// username: ci-bot
/// attempts: 5                         # optional
/// retry_wait_seconds: 10              # optional
/// ```
use anyhow::{anyhow, Result};
use mber_sync_core::client::DEFAULT_URL;
use mber_sync_core::retry::Retry;
use mber_sync_core::session::SessionState;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

pub const PASSWORD_ENV: &str = "MBER_PASSWORD";

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub url: String,
    pub application: String,
    pub username: String,
    pub password: String,
    pub attempts: i32,
    pub retry_wait_seconds: u64,
}

impl CliConfig {
    /// Retry policy for every build step.
    pub fn retry(&self) -> Retry {
        Retry::new(self.attempts).with_wait(Duration::from_secs(self.retry_wait_seconds))
    }

    /// A fresh session against the configured service and application.
    pub fn session(&self) -> SessionState {
        SessionState::new(&self.url, &self.application)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    url: String,
    application: String,
    username: String,
    #[serde(default = "default_attempts")]
    attempts: i32,
    #[serde(default = "default_retry_wait")]
    retry_wait_seconds: u64,
}

fn default_attempts() -> i32 {
    5
}

fn default_retry_wait() -> u64 {
    10
}

/// Loads the access profile at `path` and reads the password from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    dotenvy::dotenv().ok();
    let password = env::var(PASSWORD_ENV)
        .map_err(|_| anyhow!("{PASSWORD_ENV} environment variable must be set"))?;

    let url = if raw.url.trim().is_empty() {
        DEFAULT_URL.to_string()
    } else {
        raw.url.trim().to_string()
    };

    Ok(CliConfig {
        url,
        application: raw.application,
        username: raw.username,
        password,
        attempts: raw.attempts,
        retry_wait_seconds: raw.retry_wait_seconds,
    })
}
