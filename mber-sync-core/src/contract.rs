//! # contract: the transport seam between the engine and the network
//!
//! This module defines the single trait ([`Transport`]) through which every
//! remote interaction flows, plus the plain data types passed across it.
//!
//! ## Interface & Extensibility
//! - [`crate::http::HttpTransport`] is the production implementation (reqwest).
//! - JSON calls go through [`Transport::send`] and come back as a [`RemoteCall`]
//!   holding the raw status code and body; classification happens later in
//!   [`crate::envelope`].
//! - Byte payloads go through [`Transport::put_stream`] and [`Transport::open`] so
//!   the transfer engine can count bytes, report progress, and stop on
//!   cancellation without knowing which HTTP library is underneath.
//! - Redirects are resolved one hop at a time with [`Transport::redirect_target`];
//!   the caller owns the hop limit.
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall`, so tests (inside and outside the crate,
//!   with the default `test-export-mocks` feature) get a `MockTransport`.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde_json::Value;

use crate::error::MberResult;

/// HTTP verbs the remote protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single JSON-protocol request. GET and DELETE carry their data in `url`;
/// PUT and POST carry it in `json`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub json: Option<Value>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            json: None,
        }
    }

    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }
}

/// Record of one completed remote call. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl RemoteCall {
    /// The URL without its query string. Query strings carry access tokens.
    pub fn redacted_url(&self) -> &str {
        match self.url.find('?') {
            Some(offset) => &self.url[..offset],
            None => &self.url,
        }
    }
}

impl fmt::Display for RemoteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} - {}", self.method, self.redacted_url(), self.status)
    }
}

/// Chunked byte stream used for both upload and download bodies.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// A file body to stream to an upload slot.
pub struct UploadBody {
    /// Declared length in bytes, sent as the content length.
    pub length: u64,
    pub stream: ByteStream,
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBody")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// An opened download: the server's declared length and the body.
pub struct DownloadBody {
    /// `None` when the server did not declare a length.
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl fmt::Debug for DownloadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Trait for issuing requests against the remote service.
///
/// Implementations attach the protocol version header to every request and
/// never follow redirects on their own when asked for [`Transport::redirect_target`].
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a JSON-protocol request and return the raw status and body.
    async fn send(&self, request: Request) -> MberResult<RemoteCall>;

    /// PUT a byte stream as `application/octet-stream`.
    async fn put_stream(&self, url: &str, body: UploadBody) -> MberResult<RemoteCall>;

    /// Request `url` with redirects disabled. Returns the absolute `Location`
    /// target when the response is a redirect, `None` otherwise.
    async fn redirect_target(&self, url: &str) -> MberResult<Option<String>>;

    /// GET `url` and hand back its body as a stream.
    async fn open(&self, url: &str) -> MberResult<DownloadBody>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hides_query_strings() {
        let call = RemoteCall {
            method: Method::Get,
            url: "https://mber.example/service/json/data/directory/abc?access_token=secret".into(),
            status: 200,
            body: "{}".into(),
        };
        assert_eq!(
            call.to_string(),
            "GET https://mber.example/service/json/data/directory/abc - 200"
        );
        assert!(!call.to_string().contains("secret"));
    }
}
