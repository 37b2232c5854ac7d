//! Build steps: the retried compositions of resolver and transfer calls.
//!
//! Resolver and transfer operations are single attempts. [`BuildSteps`] wraps
//! them in a [`Retry`] the way a CI job uses them:
//!
//! - [`BuildSteps::connect`]: log in, retried until an access token arrives
//! - [`BuildSteps::start_build`]: find or create the project, then the build (`Running`)
//! - [`BuildSteps::upload_artifacts`]: expand globs, create folders, upload or link each file
//! - [`BuildSteps::download_files`]: by id or by tag, refusing to clobber existing files
//! - [`BuildSteps::finish_build`]: mark the build `Completed` plus its result, publish tests
//!
//! After a step, [`BuildSteps::close`] drains the session's call ledger and
//! prints it when the step failed.

use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::client::MberClient;
use crate::contract::Transport;
use crate::envelope::Envelope;
use crate::error::StepError;
use crate::retry::Retry;
use crate::session::{BuildStatus, SessionState};
use crate::transfer::{LogProgress, Progress};

pub type StepResult<T> = Result<T, StepError>;

/// Names a build within its project.
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    pub project: String,
    pub project_description: String,
    pub name: String,
    pub description: String,
    /// Unique per build run; used as the build alias.
    pub alias: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub workspace: PathBuf,
    /// Workspace-relative glob patterns, or absolute paths when linking.
    pub patterns: Vec<String>,
    /// Remote base folder below the application root.
    pub folder: String,
    pub tags: Vec<String>,
    /// Link to the files where they are instead of uploading their bytes.
    pub link_local_files: bool,
    pub overwrite: bool,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub workspace: PathBuf,
    /// Document ids or aliases, or tags when `use_tags` is set.
    pub identifiers: Vec<String>,
    pub use_tags: bool,
    pub overwrite: bool,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FinishRequest {
    pub name: String,
    pub description: String,
    pub failed: bool,
    /// Test report with `failCount`, `skipCount`, `passCount`, `totalCount`.
    pub test_results: Option<Map<String, Value>>,
    /// Folder receiving `tests.json`.
    pub folder: String,
    pub tags: Vec<String>,
}

pub struct BuildSteps<T: Transport> {
    client: MberClient<T>,
    retry: Retry,
}

/// Attempt result for steps that retry only on `Failed`.
fn unless_failed(response: Envelope) -> Result<Envelope, String> {
    if response.is_failed() {
        Err(response.error_message().to_string())
    } else {
        Ok(response)
    }
}

/// Attempt result for transfers: done on success, and on abort since retrying cannot help.
fn until_settled(response: Envelope) -> Result<Envelope, String> {
    if response.is_success() || response.is_aborted() {
        Ok(response)
    } else {
        Err(response.error_message().to_string())
    }
}

fn require_success(response: Option<Envelope>, context: impl Into<String>) -> StepResult<Envelope> {
    match response {
        Some(response) if response.is_success() => Ok(response),
        Some(response) if response.is_aborted() => Err(StepError::Aborted),
        Some(response) => Err(StepError::remote(context, response.error_message())),
        None => Err(StepError::remote(context, "retries exhausted")),
    }
}

/// Remote folder for `file`: the base folder plus the file's workspace-relative parent.
pub fn remote_folder(base: &str, workspace: &Path, file: &Path, linking: bool) -> String {
    if linking {
        return base.to_string();
    }
    let relative = file.strip_prefix(workspace).unwrap_or(file);
    let parent = relative
        .parent()
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();
    match (base.is_empty(), parent.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => parent,
        (false, false) => format!("{}/{}", base.trim_end_matches('/'), parent),
    }
}

/// Files matched by workspace-relative glob patterns, in pattern order.
pub fn expand_patterns(workspace: &Path, patterns: &[String]) -> StepResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns.iter().filter(|p| !p.trim().is_empty()) {
        let full = workspace.join(pattern);
        let pattern_error = |reason: String| StepError::Pattern {
            pattern: pattern.clone(),
            reason,
        };
        let entries = glob::glob(&full.to_string_lossy()).map_err(|e| pattern_error(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| pattern_error(e.to_string()))?;
            if path.is_file() {
                files.push(path);
            }
        }
    }
    Ok(files)
}

impl<T: Transport> BuildSteps<T> {
    pub fn new(client: MberClient<T>, retry: Retry) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &MberClient<T> {
        &self.client
    }

    pub fn into_state(self) -> SessionState {
        self.client.into_state()
    }

    pub async fn connect(&self, username: &str, password: &str) -> StepResult<()> {
        let url = self.client.state().url;
        info!(url = %url, "[STEP] Connecting to Mber");
        let response = self
            .retry
            .run(|| async move {
                let response = self.client.login(username, password).await;
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(format!(
                        "Failed to connect to Mber: {}",
                        response.error_message()
                    ))
                }
            })
            .await;
        if response.is_none() {
            error!(url = %url, "[STEP] Failed to connect to Mber");
            return Err(StepError::Connect);
        }
        Ok(())
    }

    /// Find or create the project and the build, leaving both ids in the session.
    pub async fn start_build(&self, build: &BuildInfo) -> StepResult<SessionState> {
        info!(project = %build.project, "[STEP] Creating Mber project");
        let project = self
            .retry
            .run(|| async move {
                unless_failed(
                    self.client
                        .make_project(&build.project, &build.project_description)
                        .await,
                )
            })
            .await;
        require_success(project, format!("Failed to find Mber project named {}", build.project))?;

        info!(build = %build.name, alias = %build.alias, "[STEP] Creating Mber build");
        let created = self
            .retry
            .run(|| async move {
                unless_failed(
                    self.client
                        .make_build(
                            &build.name,
                            &build.description,
                            &build.alias,
                            &[BuildStatus::Running],
                        )
                        .await,
                )
            })
            .await;
        require_success(created, format!("Failed to find Mber build with alias {}", build.alias))?;
        Ok(self.client.state())
    }

    /// Upload (or link) every file the request matches. Returns one envelope per file.
    pub async fn upload_artifacts(&self, request: &UploadRequest) -> StepResult<Vec<Envelope>> {
        let files = if request.link_local_files {
            request
                .patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .collect()
        } else {
            expand_patterns(&request.workspace, &request.patterns)?
        };
        if files.is_empty() {
            return Err(StepError::NoFiles);
        }

        let has_build = self.client.state().has_build();
        let mut uploaded = Vec::with_capacity(files.len());
        for file in &files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut tags = request.tags.clone();
            tags.push(name.clone());
            info!(file = %file.display(), "[STEP] Uploading file");

            let folder = remote_folder(
                &request.folder,
                &request.workspace,
                file,
                request.link_local_files,
            );
            let folder = folder.as_str();
            let created = self
                .retry
                .run(|| async move { unless_failed(self.client.make_path(&folder).await) })
                .await;
            let created = require_success(created, format!("Failed to create Mber folder {folder}"))?;
            let directory = created
                .get_str("directoryId")
                .map(str::to_string)
                .ok_or_else(|| StepError::remote(format!("Failed to create Mber folder {folder}"), "no directoryId"))?;
            let directory = directory.as_str();
            let (name, tags) = (name.as_str(), tags.as_slice());

            if has_build {
                let attached = self
                    .retry
                    .run(|| async move { unless_failed(self.client.set_build_directory(directory).await) })
                    .await;
                require_success(
                    attached,
                    format!("Failed to update Mber build with folder {folder}"),
                )?;
            }

            let response = self
                .retry
                .run(|| async move {
                    let response = if request.link_local_files {
                        self.client
                            .link(
                                &file.display().to_string(),
                                directory,
                                name,
                                tags,
                                request.overwrite,
                            )
                            .await
                    } else {
                        let progress: Option<Progress> =
                            request.show_progress.then(|| LogProgress::uploading(name));
                        self.client
                            .upload(file, directory, name, tags, request.overwrite, progress)
                            .await
                    };
                    until_settled(response)
                })
                .await;
            uploaded.push(require_success(
                response,
                format!("Failed to upload file {}", file.display()),
            )?);
        }
        Ok(uploaded)
    }

    /// Download the requested documents into the workspace. Returns the written paths.
    pub async fn download_files(&self, request: &DownloadRequest) -> StepResult<Vec<PathBuf>> {
        let identifiers: Vec<String> = request
            .identifiers
            .iter()
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .collect();
        let mut documents: Vec<Map<String, Value>> = Vec::new();

        if request.use_tags {
            let identifiers = identifiers.as_slice();
            let found = self
                .retry
                .run(|| async move {
                    unless_failed(self.client.find_documents_with_tags(identifiers).await)
                })
                .await;
            let joined = identifiers.join(", ");
            let found = match found {
                Some(found) if found.is_success() && !found.results().is_empty() => found,
                _ => return Err(StepError::NoTaggedFiles(joined)),
            };
            for document in found.results().iter().filter_map(Value::as_object) {
                ensure_downloadable(document)?;
                documents.push(document.clone());
            }
        } else {
            for id in &identifiers {
                let read = self
                    .retry
                    .run(|| async move { unless_failed(self.client.read_document(id).await) })
                    .await;
                let document = match read {
                    Some(read) if read.is_success() => read.result().cloned().unwrap_or_default(),
                    _ => return Err(StepError::DocumentNotFound(id.clone())),
                };
                ensure_downloadable(&document).map_err(|_| StepError::NotDownloadable(id.clone()))?;
                documents.push(document);
            }
        }

        let mut written = Vec::with_capacity(documents.len());
        for document in &documents {
            let name = local_file_name(&string_field(document, "name"))?;
            let document_id = string_field(document, "documentId");
            let dest = request.workspace.join(&name);
            if !request.overwrite && dest.exists() {
                return Err(StepError::AlreadyExists(name));
            }
            info!(file = %name, "[STEP] Downloading file");
            let (dest_path, document_id, label) = (dest.as_path(), document_id.as_str(), name.as_str());
            let response = self
                .retry
                .run(|| async move {
                    let progress: Option<Progress> =
                        request.show_progress.then(|| LogProgress::downloading(label));
                    until_settled(self.client.download(dest_path, document_id, progress).await)
                })
                .await;
            require_success(response, format!("Failed to download file {name}"))?;
            written.push(dest);
        }
        Ok(written)
    }

    /// Mark the build completed with its result, then publish test results if any.
    pub async fn finish_build(&self, request: &FinishRequest) -> StepResult<()> {
        if !self.client.state().has_build() {
            return Err(StepError::NoBuild);
        }
        let outcome = if request.failed {
            BuildStatus::Failure
        } else {
            BuildStatus::Success
        };
        info!(status = %outcome, "[STEP] Setting Mber build status to Completed");
        self.client.state.lock().reset_status();
        let updated = self
            .retry
            .run(|| async move {
                unless_failed(
                    self.client
                        .update_build(
                            &request.name,
                            &request.description,
                            &[BuildStatus::Completed, outcome],
                        )
                        .await,
                )
            })
            .await;
        require_success(updated, "Failed to update Mber build status")?;

        if let Some(results) = &request.test_results {
            self.publish_tests(request, results).await;
        }
        Ok(())
    }

    /// Test results are best effort: failures are logged, not returned.
    async fn publish_tests(&self, request: &FinishRequest, results: &Map<String, Value>) {
        info!("[STEP] Uploading test results to Mber");
        let folder = self.client.make_path(&request.folder).await;
        let Some(directory) = folder.get_str("directoryId").filter(|_| folder.is_success()) else {
            warn!(error = %folder.error_message(), "[STEP] Failed to create test results folder");
            return;
        };
        let mut tags = vec!["tests.json".to_string()];
        tags.extend(request.tags.iter().cloned());
        let stored = self
            .client
            .upload_json(&Value::Object(results.clone()), directory, "tests.json", &tags)
            .await;
        if stored.is_duplicate() {
            warn!("[STEP] You already have a build artifact named \"tests.json\". Please rename your build artifact.");
            return;
        }
        if !stored.is_success() {
            warn!(error = %stored.error_message(), "[STEP] Failed to upload test results");
        }
        let published = self.client.publish_test_results(results).await;
        if !published.is_success() {
            warn!(error = %published.error_message(), "[STEP] Failed to publish test counts");
        }
    }

    /// Drain the session's call ledger. On failure the calls are logged as
    /// `METHOD URL - CODE` (query strings removed) and returned.
    pub fn close<R>(&self, result: &StepResult<R>) -> Vec<String> {
        let calls = self.client.ledger().drain(self.client.session_id());
        if result.is_ok() {
            return Vec::new();
        }
        let lines: Vec<String> = calls.iter().map(ToString::to_string).collect();
        error!("[STEP] The following calls were made to Mber:");
        for line in &lines {
            error!("[STEP] {line}");
        }
        lines
    }
}

fn ensure_downloadable(document: &Map<String, Value>) -> StepResult<()> {
    if document
        .get("canDownload")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        Ok(())
    } else {
        Err(StepError::NotDownloadable(string_field(document, "documentId")))
    }
}

/// A server-supplied document name, accepted only as a single plain path
/// component so the download stays inside the workspace.
fn local_file_name(name: &str) -> StepResult<String> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if !name.contains(['/', '\\']) => {
            Ok(part.to_string_lossy().into_owned())
        }
        _ => Err(StepError::remote("Invalid file name", name)),
    }
}

fn string_field(document: &Map<String, Value>, key: &str) -> String {
    document
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
