//! Classification of raw response bodies into tagged outcomes.
//!
//! Every remote response is a JSON object with a `status` field. [`Envelope::parse`]
//! turns a body into an [`Envelope`] without touching the network, normalising
//! the error message so that any non-success outcome always carries one.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::MberError;

/// Outcome tag. `Aborted` is never sent by the server; it marks local cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Duplicate,
    NotFound,
    Failed,
    Aborted,
}

impl Status {
    /// Case-sensitive match against the protocol's status strings.
    /// Anything unrecognised is `Failed`.
    pub fn from_protocol(value: &str) -> Self {
        match value {
            "Success" => Status::Success,
            "Duplicate" => Status::Duplicate,
            "NotFound" => Status::NotFound,
            _ => Status::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::Duplicate => "Duplicate",
            Status::NotFound => "NotFound",
            Status::Failed => "Failed",
            Status::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised view of a response: status, error message and the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub status: Status,
    /// Present and non-empty whenever `status` is not `Success`.
    pub error: Option<String>,
    /// The parsed JSON object, or an empty object for synthesised envelopes.
    pub payload: Map<String, Value>,
}

const EMPTY_BODY: &str = "Empty response body";

impl Envelope {
    /// Classify a raw body.
    ///
    /// - a body that is not a JSON object becomes `Failed` with the raw text as error
    /// - a missing `status` becomes `Failed`
    /// - a non-success envelope takes its error from `error`, then `message`,
    ///   then `"Invalid " + invalid`, then the raw body
    pub fn parse(body: &str) -> Envelope {
        let payload = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => map,
            _ => return Envelope::failed(non_empty_or(body, EMPTY_BODY)),
        };
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(Status::from_protocol)
            .unwrap_or(Status::Failed);
        if status == Status::Success {
            return Envelope {
                status,
                error: None,
                payload,
            };
        }
        let error = ["error", "message"]
            .iter()
            .find_map(|key| text_field(&payload, key).map(str::to_string))
            .or_else(|| text_field(&payload, "invalid").map(|field| format!("Invalid {field}")))
            .unwrap_or_else(|| non_empty_or(body, EMPTY_BODY));
        Envelope {
            status,
            error: Some(error),
            payload,
        }
    }

    pub fn success() -> Envelope {
        Envelope {
            status: Status::Success,
            error: None,
            payload: Map::new(),
        }
    }

    /// A success carrying a single extra field, e.g. a resolved id.
    pub fn success_with(key: &str, value: impl Into<Value>) -> Envelope {
        let mut envelope = Envelope::success();
        envelope.payload.insert(key.to_string(), value.into());
        envelope
    }

    pub fn failed(error: impl Into<String>) -> Envelope {
        Envelope {
            status: Status::Failed,
            error: Some(non_empty_or(&error.into(), "Failed")),
            payload: Map::new(),
        }
    }

    pub fn aborted() -> Envelope {
        Envelope {
            status: Status::Aborted,
            error: Some(MberError::Aborted.to_string()),
            payload: Map::new(),
        }
    }

    /// Fold a transport or transfer error into an envelope. Cancellation stays
    /// distinguishable as `Aborted`; everything else is `Failed`.
    pub fn from_error(err: &MberError) -> Envelope {
        if err.is_aborted() {
            Envelope::aborted()
        } else {
            Envelope::failed(err.to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_duplicate(&self) -> bool {
        self.status == Status::Duplicate
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn is_aborted(&self) -> bool {
        self.status == Status::Aborted
    }

    /// The error message, or an empty string for successes.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }

    /// A string field of the payload, if present and non-empty.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        text_field(&self.payload, key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.payload.contains_key(key)
    }

    /// The nested `result` object of read responses.
    pub fn result(&self) -> Option<&Map<String, Value>> {
        self.payload.get("result").and_then(Value::as_object)
    }

    /// The `results` array of listing responses.
    pub fn results(&self) -> &[Value] {
        self.payload
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Mark as success and attach an id, used when a fallback path found the resource.
    pub(crate) fn promote(&mut self, key: &str, id: &str) {
        self.status = Status::Success;
        self.error = None;
        self.payload
            .insert("status".to_string(), Value::from(Status::Success.as_str()));
        self.payload.insert(key.to_string(), Value::from(id));
    }

    /// Serialise back to a JSON object, `status` and `error` included.
    pub fn to_json(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert("status".to_string(), Value::from(self.status.as_str()));
        if let Some(error) = &self.error {
            map.insert("error".to_string(), Value::from(error.as_str()));
        }
        Value::Object(map)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{}: {}", self.status, error),
            None => write!(f, "{}", self.status),
        }
    }
}

/// A non-empty string value.
pub(crate) fn text_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
