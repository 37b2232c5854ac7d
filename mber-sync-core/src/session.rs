//! Session state shared by resolver and transfer calls, and handed between
//! pipeline stages as a flat JSON object.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::text_field;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    Running,
    Completed,
    Success,
    Failure,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStatus::Running => "Running",
            BuildStatus::Completed => "Completed",
            BuildStatus::Success => "Success",
            BuildStatus::Failure => "Failure",
        };
        f.write_str(name)
    }
}

/// Live context of one session. Ids are empty strings when unknown.
///
/// Missing fields deserialise to their empty defaults, so a partially written
/// handoff file clears what it does not mention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub url: String,
    pub application: String,
    pub access_token: String,
    #[serde(rename = "applicationId")]
    pub application_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "buildId")]
    pub build_id: String,
    #[serde(rename = "buildAlias")]
    pub build_alias: String,
    #[serde(rename = "buildStatus")]
    pub build_status: BTreeSet<BuildStatus>,
}

impl SessionState {
    pub fn new(url: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            application: application.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Add statuses to the accumulated set.
    pub fn record(&mut self, statuses: &[BuildStatus]) {
        self.build_status.extend(statuses.iter().copied());
    }

    pub fn reset_status(&mut self) {
        self.build_status.clear();
    }

    /// Status set as the protocol's string array.
    pub fn status_json(&self) -> Value {
        Value::from(
            self.build_status
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        )
    }

    pub fn has_build(&self) -> bool {
        !self.build_id.is_empty()
    }

    /// Copy credentials from a login response, clearing them when absent.
    pub(crate) fn set_or_clear_login(&mut self, payload: &Map<String, Value>) {
        self.access_token = owned(payload, "access_token");
        self.application_id = owned(payload, "applicationId");
    }

    pub(crate) fn set_or_clear_project(&mut self, payload: &Map<String, Value>) {
        self.project_id = owned(payload, "projectId");
    }

    pub(crate) fn set_or_clear_build(&mut self, payload: &Map<String, Value>) {
        self.build_id = owned(payload, "buildId");
    }
}

fn owned(payload: &Map<String, Value>, key: &str) -> String {
    text_field(payload, key).unwrap_or_default().to_string()
}
