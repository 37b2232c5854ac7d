//! [`Transport`] over reqwest.
//!
//! Two clients: one for ordinary calls and one with redirects disabled, used
//! to resolve download locations hop by hop. Every request carries the
//! `REST-API-Version` header.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{redirect, Body, Client, RequestBuilder, StatusCode, Url};
use tracing::debug;

use crate::contract::{DownloadBody, Method, RemoteCall, Request, Transport, UploadBody};
use crate::error::{MberError, MberResult};

pub const API_VERSION_HEADER: &str = "REST-API-Version";
pub const API_VERSION: &str = "2.0.x";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    no_redirect: Client,
}

impl HttpTransport {
    pub fn new() -> MberResult<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// `connect_timeout` bounds connection setup only; transfers may take as long as they need.
    pub fn with_timeout(connect_timeout: Duration) -> MberResult<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        let no_redirect = Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            no_redirect,
        })
    }

    fn request(&self, client: &Client, method: Method, url: &str) -> RequestBuilder {
        let method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };
        client
            .request(method, url)
            .header(API_VERSION_HEADER, API_VERSION)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> MberResult<RemoteCall> {
        let mut builder = self.request(&self.client, request.method, &request.url);
        if let Some(json) = &request.json {
            builder = builder
                .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(json.to_string());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(method = %request.method, status, "[HTTP] Response received");
        Ok(RemoteCall {
            method: request.method,
            url: request.url,
            status,
            body,
        })
    }

    async fn put_stream(&self, url: &str, body: UploadBody) -> MberResult<RemoteCall> {
        let response = self
            .request(&self.client, Method::Put, url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, body.length)
            .body(Body::wrap_stream(body.stream))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RemoteCall {
            method: Method::Put,
            url: url.to_string(),
            status,
            body,
        })
    }

    async fn redirect_target(&self, url: &str) -> MberResult<Option<String>> {
        let response = self.request(&self.no_redirect, Method::Get, url).send().await?;
        if !is_redirect(response.status()) {
            return Ok(None);
        }
        let Some(location) = response.headers().get(LOCATION) else {
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|e| MberError::MalformedResponse(format!("Location header: {e}")))?;
        let base = Url::parse(url).map_err(|_| MberError::InvalidUrl {
            url: url.to_string(),
        })?;
        let target = base.join(location).map_err(|_| MberError::InvalidUrl {
            url: location.to_string(),
        })?;
        debug!(from = %url, to = %target, "[HTTP] Following redirect");
        Ok(Some(target.to_string()))
    }

    async fn open(&self, url: &str) -> MberResult<DownloadBody> {
        let response = self.request(&self.client, Method::Get, url).send().await?;
        if !response.status().is_success() {
            return Err(MberError::Network(format!(
                "GET {} returned {}",
                url.split('?').next().unwrap_or(url),
                response.status()
            )));
        }
        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(DownloadBody {
            content_length,
            stream: Box::pin(stream),
        })
    }
}
