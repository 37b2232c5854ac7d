//! Per-session record of remote calls, kept for diagnostics on failure.
//!
//! Session ids must be unique per logical session (a job-run id, a build URL).
//! Callers drain their session when it ends; nothing is evicted otherwise.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::contract::RemoteCall;

#[derive(Debug, Default)]
pub struct CallLedger {
    calls: Mutex<HashMap<String, Vec<RemoteCall>>>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session: &str, call: RemoteCall) {
        self.calls
            .lock()
            .entry(session.to_string())
            .or_default()
            .push(call);
    }

    /// Remove and return the session's calls in the order they were recorded.
    pub fn drain(&self, session: &str) -> Vec<RemoteCall> {
        self.calls.lock().remove(session).unwrap_or_default()
    }

    /// Number of calls currently held for `session`.
    pub fn len(&self, session: &str) -> usize {
        self.calls.lock().get(session).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}
