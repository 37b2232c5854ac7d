/// # mber-sync CLI Interface (Module)
///
/// Command parsing and orchestration for the `mber-sync` binary. Each subcommand is one
/// build step from [`mber_sync_core::pipeline`]; the session (token, project, build) is
/// handed from one invocation to the next through a JSON session file.
///
/// ## How To Use
/// - `mber-sync --config mber.yaml validate`
/// - `mber-sync --config mber.yaml start --project game --name "#42" --alias game/42/`
/// - `mber-sync --config mber.yaml upload --file "dist/*.zip" --folder builds/42`
/// - `mber-sync --config mber.yaml finish --name "#42" --test-results report.json`
///
/// All remote logic lives in `mber-sync-core`; this module only maps arguments to
/// requests, reads and writes the session file, and decides the exit status.
use crate::load_config::{load_config, CliConfig};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use mber_sync_core::client::{generate_transaction_id, is_mber_url, MberClient};
use mber_sync_core::http::HttpTransport;
use mber_sync_core::ledger::CallLedger;
use mber_sync_core::pipeline::{
    BuildInfo, BuildSteps, DownloadRequest, FinishRequest, StepResult, UploadRequest,
};
use mber_sync_core::session::SessionState;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// CLI for mber-sync: provision Mber builds and move artifacts from CI jobs.
#[derive(Parser)]
#[clap(
    name = "mber-sync",
    version,
    about = "Provision Mber projects and builds, and upload or download build artifacts"
)]
pub struct Cli {
    /// Path to the YAML access profile
    #[clap(long)]
    pub config: PathBuf,

    /// Session file handed between steps
    #[clap(long, default_value = ".mber-session.json")]
    pub session: PathBuf,

    /// Report step failures without failing the command
    #[clap(long)]
    pub optional: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the configured URL is an Mber service and the credentials work
    Validate,

    /// Find or create the project and create a running build
    Start {
        #[clap(long)]
        project: String,
        #[clap(long, default_value = "")]
        project_description: String,
        /// Build name, e.g. the CI build number
        #[clap(long)]
        name: String,
        #[clap(long, default_value = "")]
        description: String,
        /// Unique alias for this build; defaults to PROJECT/NAME/
        #[clap(long)]
        alias: Option<String>,
    },

    /// Upload (or link) files into a folder
    Upload {
        #[clap(long, default_value = ".")]
        workspace: PathBuf,
        /// Workspace-relative glob, repeatable
        #[clap(long = "file", required = true)]
        files: Vec<String>,
        /// Remote folder below the application root
        #[clap(long, default_value = "")]
        folder: String,
        #[clap(long = "tag")]
        tags: Vec<String>,
        /// Link to the files in place instead of uploading their bytes
        #[clap(long)]
        link: bool,
        #[clap(long)]
        overwrite: bool,
        #[clap(long)]
        progress: bool,
    },

    /// Download documents into the workspace
    Download {
        #[clap(long, default_value = ".")]
        workspace: PathBuf,
        /// Document id or alias (or tag with --by-tags), repeatable
        #[clap(long = "id", required = true)]
        ids: Vec<String>,
        #[clap(long)]
        by_tags: bool,
        #[clap(long)]
        overwrite: bool,
        #[clap(long)]
        progress: bool,
    },

    /// Mark the build completed and optionally publish test results
    Finish {
        #[clap(long)]
        name: String,
        #[clap(long, default_value = "")]
        description: String,
        /// Mark the build as failed instead of successful
        #[clap(long)]
        failed: bool,
        /// JSON test report with failCount, skipCount, passCount, totalCount
        #[clap(long)]
        test_results: Option<PathBuf>,
        /// Folder receiving tests.json
        #[clap(long, default_value = "")]
        folder: String,
        #[clap(long = "tag")]
        tags: Vec<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Validate => "validate",
            Commands::Start { .. } => "start",
            Commands::Upload { .. } => "upload",
            Commands::Download { .. } => "download",
            Commands::Finish { .. } => "finish",
        }
    }
}

/// A subcommand turned into its pipeline request.
enum Step {
    Validate,
    Start(BuildInfo),
    Upload(UploadRequest),
    Download(DownloadRequest),
    Finish(FinishRequest),
}

impl TryFrom<Commands> for Step {
    type Error = anyhow::Error;

    fn try_from(command: Commands) -> Result<Self> {
        Ok(match command {
            Commands::Validate => Step::Validate,
            Commands::Start {
                project,
                project_description,
                name,
                description,
                alias,
            } => {
                let alias = alias.unwrap_or_else(|| format!("{project}/{name}/"));
                Step::Start(BuildInfo {
                    project,
                    project_description,
                    name,
                    description,
                    alias,
                })
            }
            Commands::Upload {
                workspace,
                files,
                folder,
                tags,
                link,
                overwrite,
                progress,
            } => Step::Upload(UploadRequest {
                workspace,
                patterns: files,
                folder,
                tags,
                link_local_files: link,
                overwrite,
                show_progress: progress,
            }),
            Commands::Download {
                workspace,
                ids,
                by_tags,
                overwrite,
                progress,
            } => Step::Download(DownloadRequest {
                workspace,
                identifiers: ids,
                use_tags: by_tags,
                overwrite,
                show_progress: progress,
            }),
            Commands::Finish {
                name,
                description,
                failed,
                test_results,
                folder,
                tags,
            } => Step::Finish(FinishRequest {
                name,
                description,
                failed,
                test_results: test_results.as_deref().map(read_test_results).transpose()?,
                folder,
                tags,
            }),
        })
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    let command = cli.command.name();
    tracing::info!(command, "[CLI] Starting step");

    let config = load_config(&cli.config)?;
    let step = Step::try_from(cli.command)?;
    let session_path = cli.session;

    match execute(&config, &session_path, step).await {
        Ok(()) => {
            tracing::info!(command, "[CLI] Step complete");
            Ok(())
        }
        Err(e) if cli.optional => {
            tracing::warn!(command, error = %e, "[CLI] Step failed; continuing because it is optional");
            Ok(())
        }
        Err(e) => {
            tracing::error!(command, error = %e, "[CLI] Step failed");
            Err(e)
        }
    }
}

async fn execute(config: &CliConfig, session_path: &Path, step: Step) -> Result<()> {
    let transport = HttpTransport::new().context("Failed to construct HTTP client")?;

    let state = match step {
        Step::Validate => {
            if !is_mber_url(&transport, &config.url).await {
                bail!("{} does not look like an Mber service", config.url);
            }
            config.session()
        }
        Step::Start(_) => config.session(),
        _ => read_session(session_path, config)?,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("[CLI] Interrupted, aborting");
            on_signal.cancel();
        }
    });

    let client = MberClient::new(transport, state)
        .with_ledger(Arc::new(CallLedger::new()), generate_transaction_id())
        .with_cancellation(cancel.clone());
    let steps = BuildSteps::new(client, config.retry().with_cancellation(cancel));

    let outcome = run_step(&steps, config, &step).await;
    steps.close(&outcome);
    outcome?;

    if !matches!(step, Step::Validate) {
        write_session(session_path, &steps.into_state())?;
    }
    Ok(())
}

async fn run_step(
    steps: &BuildSteps<HttpTransport>,
    config: &CliConfig,
    step: &Step,
) -> StepResult<()> {
    steps.connect(&config.username, &config.password).await?;
    match step {
        Step::Validate => {
            tracing::info!(url = %config.url, "[CLI] Connection verified");
        }
        Step::Start(build) => {
            let state = steps.start_build(build).await?;
            tracing::info!(project = %state.project_id, build = %state.build_id, "[CLI] Build started");
        }
        Step::Upload(request) => {
            let uploaded = steps.upload_artifacts(request).await?;
            tracing::info!(count = uploaded.len(), "[CLI] Files uploaded");
        }
        Step::Download(request) => {
            for path in steps.download_files(request).await? {
                tracing::info!(file = %path.display(), "[CLI] Downloaded");
            }
        }
        Step::Finish(request) => {
            steps.finish_build(request).await?;
        }
    }
    Ok(())
}

fn read_test_results(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read test results {:?}", path))?;
    match serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test results {:?}", path))?
    {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("Test results {:?} must be a JSON object", path)),
    }
}

/// The session handed over by an earlier step, or a fresh one when there is none.
pub fn read_session(path: &Path, config: &CliConfig) -> Result<SessionState> {
    if !path.exists() {
        tracing::info!(session = ?path, "[CLI] No session file, starting a fresh session");
        return Ok(config.session());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file {:?}", path))?;
    let mut state = SessionState::from_json(&content)
        .with_context(|| format!("Failed to parse session file {:?}", path))?;
    if state.url.is_empty() {
        state.url = config.url.clone();
    }
    if state.application.is_empty() {
        state.application = config.application.clone();
    }
    Ok(state)
}

pub fn write_session(path: &Path, state: &SessionState) -> Result<()> {
    let json = state.to_json().context("Failed to serialise session")?;
    fs::write(path, json).with_context(|| format!("Failed to write session file {:?}", path))
}
