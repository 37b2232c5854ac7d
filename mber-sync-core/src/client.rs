//! Client handle: session state, transport, and the JSON call plumbing.
//!
//! [`MberClient`] is the one object resolver and transfer operations hang off
//! (see [`crate::resolver`] and [`crate::transfer`]). It owns the
//! [`SessionState`] for one session, records every call into a shared
//! [`CallLedger`], and turns every response (or failure to get one) into an
//! [`Envelope`].

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::contract::{Method, RemoteCall, Request, Transport};
use crate::envelope::Envelope;
use crate::error::{MberError, MberResult};
use crate::ledger::CallLedger;
use crate::query::{encode_uri_component, to_query};
use crate::session::SessionState;

pub const DEFAULT_URL: &str = "https://member.firepub.net/";

/// Keep only scheme and authority of `url`, then append `path` with a trailing slash.
pub fn base_url_with_path(url: &str, path: &str) -> MberResult<String> {
    let invalid = || MberError::InvalidUrl {
        url: url.to_string(),
    };
    let base = Url::parse(url).map_err(|_| invalid())?;
    if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
        return Err(invalid());
    }
    let root = Url::parse(&base.origin().ascii_serialization()).map_err(|_| invalid())?;
    let mut path = path.to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    Ok(root.join(&path).map_err(|_| invalid())?.to_string())
}

/// Fresh id for a mutating call: 16 random bytes, base64 encoded.
pub fn generate_transaction_id() -> String {
    STANDARD.encode(Uuid::new_v4().as_bytes())
}

/// Whether `url` answers like an Mber service (a non-empty JSON document at `/jsdl/`).
pub async fn is_mber_url<T: Transport + ?Sized>(transport: &T, url: &str) -> bool {
    let Ok(jsdl) = base_url_with_path(url, "jsdl") else {
        return false;
    };
    match transport.send(Request::new(Method::Get, jsdl)).await {
        Ok(call) => match serde_json::from_str::<Value>(&call.body) {
            Ok(Value::Object(map)) => !map.is_empty(),
            Ok(Value::Array(items)) => !items.is_empty(),
            _ => false,
        },
        Err(_) => false,
    }
}

pub struct MberClient<T: Transport> {
    transport: T,
    pub(crate) state: Mutex<SessionState>,
    ledger: Arc<CallLedger>,
    session_id: String,
    pub(crate) cancel: CancellationToken,
}

impl<T: Transport> MberClient<T> {
    /// A client with its own ledger. The session id defaults to the application name.
    pub fn new(transport: T, state: SessionState) -> Self {
        let session_id = state.application.clone();
        Self {
            transport,
            state: Mutex::new(state),
            ledger: Arc::new(CallLedger::new()),
            session_id,
            cancel: CancellationToken::new(),
        }
    }

    /// Record calls into a shared ledger under `session_id`, which must be unique
    /// to this logical session.
    pub fn with_ledger(mut self, ledger: Arc<CallLedger>, session_id: impl Into<String>) -> Self {
        self.ledger = ledger;
        self.session_id = session_id.into();
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Snapshot of the session state.
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        self.state.get_mut()
    }

    pub fn into_state(self) -> SessionState {
        self.state.into_inner()
    }

    pub fn ledger(&self) -> &Arc<CallLedger> {
        &self.ledger
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Absolute URL of a service endpoint on this session's host.
    pub fn endpoint(&self, path: &str) -> MberResult<String> {
        let url = self.state.lock().url.clone();
        base_url_with_path(&url, path)
    }

    /// `data` extended with the session's access token.
    pub(crate) fn authorised(&self, mut data: Map<String, Value>) -> Map<String, Value> {
        let token = self.state.lock().access_token.clone();
        data.insert("access_token".to_string(), Value::from(token));
        data
    }

    /// Like [`Self::authorised`], plus a fresh transaction id.
    pub(crate) fn transactional(&self, data: Map<String, Value>) -> Map<String, Value> {
        let mut data = self.authorised(data);
        data.insert(
            "transactionId".to_string(),
            Value::from(generate_transaction_id()),
        );
        data
    }

    pub(crate) fn record(&self, call: RemoteCall) {
        self.ledger.record(&self.session_id, call);
    }

    /// GET `service` + encoded `resource`, with `data` as the query string.
    pub(crate) async fn get(&self, service: &str, resource: &str, data: Map<String, Value>) -> Envelope {
        let url = match self.endpoint(service) {
            Ok(base) => format!("{base}{}{}", encode_uri_component(resource), to_query(&data)),
            Err(e) => return Envelope::from_error(&e),
        };
        self.call(Request::new(Method::Get, url)).await
    }

    /// PUT `data` as JSON to `service` + encoded `resource`.
    pub(crate) async fn put(&self, service: &str, resource: &str, data: Map<String, Value>) -> Envelope {
        let url = match self.endpoint(service) {
            Ok(base) => format!("{base}{}", encode_uri_component(resource)),
            Err(e) => return Envelope::from_error(&e),
        };
        self.call(Request::new(Method::Put, url).with_json(Value::Object(data)))
            .await
    }

    /// POST `data` as JSON to `endpoint`.
    pub(crate) async fn post(&self, endpoint: &str, data: Map<String, Value>) -> Envelope {
        let url = match self.endpoint(endpoint) {
            Ok(url) => url,
            Err(e) => return Envelope::from_error(&e),
        };
        self.call(Request::new(Method::Post, url).with_json(Value::Object(data)))
            .await
    }

    async fn call(&self, request: Request) -> Envelope {
        let method = request.method;
        match self.transport.send(request).await {
            Ok(call) => {
                debug!(call = %call, "[MBER] Remote call completed");
                let envelope = Envelope::parse(&call.body);
                self.record(call);
                envelope
            }
            Err(e) => {
                debug!(method = %method, error = %e, "[MBER] Remote call failed");
                Envelope::from_error(&e)
            }
        }
    }
}
