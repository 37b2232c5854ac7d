//! File transfer: streamed uploads to upload slots, in-memory JSON uploads,
//! and verified downloads.
//!
//! # Upload
//! [`MberClient::upload`] asks for an upload slot, then streams the file to
//! the slot URL as `application/octet-stream`. An empty response body is
//! success; anything else is the error. A `Duplicate` slot request with
//! `overwrite` is reconciled against the existing document of the same name.
//!
//! # Download
//! [`MberClient::download`] resolves redirects one hop at a time (at most
//! [`MAX_REDIRECTS`]), opens the final URL, and streams it to disk while
//! counting bytes. Fewer bytes than the declared length is an integrity
//! failure naming the shortfall; the partial file is removed.
//!
//! # Progress and cancellation
//! Both directions report whole-percent progress to an optional
//! [`ProgressListener`]; with an unknown or zero total nothing is reported.
//! Both stop at the next chunk boundary when the client's cancellation token
//! fires and come back `Aborted`. File handles are owned by the transfer and
//! dropped on every exit path.

use std::io;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::client::MberClient;
use crate::contract::{DownloadBody, Transport, UploadBody};
use crate::envelope::Envelope;
use crate::error::{MberError, MberResult};
use crate::identifier::resolve;
use crate::query::{encode_uri_component, to_query};
use crate::resolver::object;

pub const MAX_REDIRECTS: usize = 10;

/// Receives percent-complete values between 0 and 100.
pub trait ProgressListener: Send + Sync {
    fn progress(&self, percent: u8);
}

impl<F> ProgressListener for F
where
    F: Fn(u8) + Send + Sync,
{
    fn progress(&self, percent: u8) {
        self(percent)
    }
}

pub type Progress = Arc<dyn ProgressListener>;

/// Logs "Uploaded N% of NAME" style lines.
#[derive(Debug, Clone)]
pub struct LogProgress {
    verb: &'static str,
    name: String,
}

impl LogProgress {
    pub fn uploading(name: impl Into<String>) -> Progress {
        Arc::new(Self {
            verb: "Uploaded",
            name: name.into(),
        })
    }

    pub fn downloading(name: impl Into<String>) -> Progress {
        Arc::new(Self {
            verb: "Downloaded",
            name: name.into(),
        })
    }
}

impl ProgressListener for LogProgress {
    fn progress(&self, percent: u8) {
        info!(file = %self.name, percent, "{} {}% of {}", self.verb, percent, self.name);
    }
}

/// Turns byte counts into whole-percent callbacks.
pub struct ProgressTracker {
    total: Option<u64>,
    seen: u64,
    last: Option<u8>,
    listener: Option<Progress>,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>, listener: Option<Progress>) -> Self {
        Self {
            total: total.filter(|total| *total > 0),
            seen: 0,
            last: None,
            listener,
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Count `bytes` more and fire the listener if a new whole percent was reached.
    pub fn advance(&mut self, bytes: usize) {
        self.seen += bytes as u64;
        let (Some(total), Some(listener)) = (self.total, &self.listener) else {
            return;
        };
        let percent = (self.seen.saturating_mul(100) / total).min(100) as u8;
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            listener.progress(percent);
        }
    }
}

fn aborted_io() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, MberError::Aborted.to_string())
}

impl<T: Transport> MberClient<T> {
    /// Upload the file at `path` into `directory` as `name`.
    pub async fn upload(
        &self,
        path: &Path,
        directory: &str,
        name: &str,
        tags: &[String],
        overwrite: bool,
        progress: Option<Progress>,
    ) -> Envelope {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => return Envelope::from_error(&MberError::Io(e)),
        };
        let data = self.transactional(object(json!({
            "name": name,
            "size": size,
            "directoryId": directory,
            "tags": tags,
        })));
        let mut slot = self.post("service/json/data/upload", data.clone()).await;
        if slot.is_duplicate() && overwrite {
            slot = self
                .reconcile_duplicate(directory, name, "service/json/data/upload/", data)
                .await;
        }
        if !slot.is_success() {
            return slot;
        }
        match slot.get_str("url") {
            Some(url) => self.put_file(path, url, progress).await,
            None => Envelope::failed(format!("Upload slot for {name} carried no url")),
        }
    }

    /// Stream the file at `path` to an upload slot URL.
    pub async fn put_file(&self, path: &Path, url: &str, progress: Option<Progress>) -> Envelope {
        info!(file = %path.display(), "[UPLOAD] Uploading file");
        let body = match self.open_upload(path, progress).await {
            Ok(body) => body,
            Err(e) => return Envelope::from_error(&e),
        };
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => Err(MberError::Aborted),
            sent = self.transport().put_stream(url, body) => sent,
        };
        let call = match sent {
            Ok(call) => call,
            Err(_) if self.cancel.is_cancelled() => return Envelope::aborted(),
            Err(e) => {
                error!(file = %path.display(), error = %e, "[UPLOAD] Upload failed");
                return Envelope::from_error(&e);
            }
        };
        let body = call.body.clone();
        self.record(call);
        if !body.trim().is_empty() {
            return Envelope::failed(body);
        }
        let mut envelope = Envelope::success_with("url", url);
        envelope
            .payload
            .insert("path".into(), Value::from(path.display().to_string()));
        envelope
    }

    async fn open_upload(&self, path: &Path, progress: Option<Progress>) -> MberResult<UploadBody> {
        let file = File::open(path).await?;
        let length = file.metadata().await?.len();
        let mut tracker = ProgressTracker::new(Some(length), progress);
        let cancel = self.cancel.clone();
        let stream = ReaderStream::new(file).map(move |chunk| {
            if cancel.is_cancelled() {
                return Err(aborted_io());
            }
            if let Ok(bytes) = &chunk {
                tracker.advance(bytes.len());
            }
            chunk
        });
        Ok(UploadBody {
            length,
            stream: Box::pin(stream),
        })
    }

    /// Store `content` as a JSON document without touching the disk.
    pub async fn upload_json(
        &self,
        content: &Value,
        directory: &str,
        name: &str,
        tags: &[String],
    ) -> Envelope {
        let encoded = STANDARD.encode(content.to_string());
        let data = self.transactional(object(json!({
            "name": name,
            "content": encoded,
            "directoryId": directory,
            "tags": tags,
        })));
        self.post("service/json/data/document", data).await
    }

    /// Download a document (by alias or UUID) to `dest`.
    pub async fn download(&self, dest: &Path, document: &str, progress: Option<Progress>) -> Envelope {
        let base = match self.endpoint("service/raw/data/download") {
            Ok(base) => base,
            Err(e) => return Envelope::from_error(&e),
        };
        let query = to_query(&self.authorised(Map::new()));
        let url = format!("{base}{}{query}", encode_uri_component(&resolve(document)));
        match self.fetch(&url, dest, progress).await {
            Ok(bytes) => {
                let mut envelope = Envelope::success_with("path", dest.display().to_string());
                envelope.payload.insert("bytes".into(), Value::from(bytes));
                envelope
            }
            Err(e) => {
                error!(file = %dest.display(), error = %e, "[DOWNLOAD] Download failed");
                Envelope::from_error(&e)
            }
        }
    }

    /// Follow redirects from `url`, then stream the body into `dest`.
    /// Returns the number of bytes written.
    pub async fn fetch(&self, url: &str, dest: &Path, progress: Option<Progress>) -> MberResult<u64> {
        let target = self.resolve_redirects(url).await?;
        let mut body = self.transport().open(&target).await?;
        let file = File::create(dest).await?;
        let result = self.write_to(file, &mut body, dest, progress).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn write_to(
        &self,
        mut file: File,
        body: &mut DownloadBody,
        dest: &Path,
        progress: Option<Progress>,
    ) -> MberResult<u64> {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dest.display().to_string());
        let mut tracker = ProgressTracker::new(body.content_length, progress);
        info!(file = %name, expected = ?body.content_length, "[DOWNLOAD] Downloading file");
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MberError::Aborted),
                chunk = body.stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            tracker.advance(chunk.len());
        }
        file.flush().await?;
        let written = tracker.seen();
        if let Some(expected) = body.content_length {
            if written < expected {
                return Err(MberError::Integrity {
                    missing: expected - written,
                    file: name,
                });
            }
        }
        Ok(written)
    }

    /// Follow redirect `Location`s until a non-redirect response.
    pub async fn resolve_redirects(&self, url: &str) -> MberResult<String> {
        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            match self.transport().redirect_target(&current).await? {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(MberError::TooManyRedirects(url.to_string()))
    }
}
