//! Error taxonomy for transport and transfer failures.
//!
//! Remote rejections (`Failed`, `NotFound`) and duplicates are not errors here:
//! they travel as [`crate::envelope::Envelope`] values. `MberError` covers what
//! goes wrong underneath a response: the network, the body, the local disk.

use thiserror::Error;

/// Result type for transport and transfer plumbing.
pub type MberResult<T> = Result<T, MberError>;

#[derive(Error, Debug)]
pub enum MberError {
    /// DNS, connection, TLS, or any other failure before a response arrived.
    #[error("{0}")]
    Network(String),

    /// The body was not JSON, or lacked a field the caller depended on.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid Mber URL: {url}")]
    InvalidUrl { url: String },

    /// Cancelled by the caller. Never retried.
    #[error("Aborted by user")]
    Aborted,

    /// Fewer bytes arrived than the server declared.
    #[error("Missing {missing} bytes in {file}")]
    Integrity { missing: u64, file: String },

    #[error("Too many redirects while resolving {0}")]
    TooManyRedirects(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl MberError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, MberError::Aborted)
    }
}

impl From<reqwest::Error> for MberError {
    fn from(e: reqwest::Error) -> Self {
        MberError::Network(e.to_string())
    }
}

/// Why a build step gave up, after its retries.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("Failed to connect to Mber. Check your configuration settings.")]
    Connect,

    /// A remote operation stayed unsuccessful. `context` says what was attempted.
    #[error("{context}: {reason}")]
    Remote { context: String, reason: String },

    #[error("Failed to access local files matching {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("No uploadable files were found. Check that you spelled the file names correctly.")]
    NoFiles,

    #[error("A file with ID {0} was not found in Mber. Check that you spelled the file identifier correctly.")]
    DocumentNotFound(String),

    #[error("Failed to find files with tags: {0}")]
    NoTaggedFiles(String),

    #[error("The file with ID {0} is not downloadable from Mber. Check that the file has been uploaded or synced to a CDN.")]
    NotDownloadable(String),

    #[error("A file named {0} already exists in the workspace.")]
    AlreadyExists(String),

    #[error("No active build in this session. Run the start step first.")]
    NoBuild,

    #[error("Aborted by user")]
    Aborted,
}

impl StepError {
    pub fn remote(context: impl Into<String>, reason: impl Into<String>) -> Self {
        StepError::Remote {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
