//! Idempotent create-or-find for directories, projects, builds and document links.
//!
//! Every "create" may race with an earlier partial success or another actor.
//! [`MberClient::resolve_or_create`] turns that into one deterministic outcome:
//!
//! 1. POST the create call; a `Success` carrying the id is done.
//! 2. On `Duplicate`, read the resource back by its canonical alias.
//! 3. If that misses, list the parent's children and match on the exact name.
//!
//! Only a definitively obtained id yields `Success`. The per-kind differences
//! (endpoint, id field, how to read, how to list) live in [`ResourceKind`]
//! descriptors so the algorithm exists once.
//!
//! All operations here are single attempts. Retrying is the caller's concern
//! (see [`crate::retry`] and [`crate::pipeline`]).

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::client::MberClient;
use crate::contract::Transport;
use crate::envelope::{text_field, Envelope};
use crate::identifier::{directory_key, is_uuid, make_alias, resolve};
use crate::session::BuildStatus;

/// How to find an existing resource among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    /// No listing fallback.
    Unlisted,
    /// `result.directories[]` of the parent directory, matched on `name`.
    ParentDirectories,
    /// `result.documents[]` of the parent directory, matched on `name`.
    ParentDocuments,
    /// `results[]` of the project listing, matched on `alias` (or `name` when unaliased).
    AllProjects,
}

/// Descriptor of one kind of remote resource.
#[derive(Debug, Clone, Copy)]
pub struct ResourceKind {
    pub label: &'static str,
    /// POST endpoint for creation.
    pub create: &'static str,
    /// GET service for read-by-alias, if the kind supports it.
    pub read: Option<&'static str>,
    /// Turns an alias into the read resource key.
    pub key: fn(&str) -> String,
    pub id_field: &'static str,
    pub listing: Listing,
}

pub const DIRECTORY: ResourceKind = ResourceKind {
    label: "directory",
    create: "service/json/data/directory",
    read: Some("service/json/data/directory/"),
    key: directory_key,
    id_field: "directoryId",
    listing: Listing::ParentDirectories,
};

pub const PROJECT: ResourceKind = ResourceKind {
    label: "project",
    create: "service/json/build/project",
    read: None,
    key: resolve,
    id_field: "projectId",
    listing: Listing::AllProjects,
};

pub const BUILD: ResourceKind = ResourceKind {
    label: "build",
    create: "service/json/build/build",
    read: Some("service/json/build/build/"),
    key: resolve,
    id_field: "buildId",
    listing: Listing::Unlisted,
};

pub const DOCUMENT_LINK: ResourceKind = ResourceKind {
    label: "document link",
    create: "service/json/data/documentlink",
    read: None,
    key: resolve,
    id_field: "documentId",
    listing: Listing::ParentDocuments,
};

/// Where to look for a resource after a `Duplicate`.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    pub name: &'a str,
    pub alias: Option<&'a str>,
    pub parent: Option<&'a str>,
}

/// The id in `envelope`, either top-level or nested under `result`.
pub fn extract_id(envelope: &Envelope, field: &str) -> Option<String> {
    envelope
        .get_str(field)
        .or_else(|| envelope.result().and_then(|result| text_field(result, field)))
        .map(str::to_string)
}

/// The map inside a `json!` object literal.
pub(crate) fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Collapse repeated slashes and strip the leading and trailing one.
pub fn normalise_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl<T: Transport> MberClient<T> {
    /// Create a resource, or find the one that already exists.
    pub async fn resolve_or_create(
        &self,
        kind: &ResourceKind,
        data: Map<String, Value>,
        lookup: Lookup<'_>,
    ) -> Envelope {
        let mut response = self.post(kind.create, data).await;
        if response.is_success() {
            return match extract_id(&response, kind.id_field) {
                Some(id) => {
                    response.promote(kind.id_field, &id);
                    response
                }
                None => Envelope::failed(format!(
                    "Created {} {} but the response carried no {}",
                    kind.label, lookup.name, kind.id_field
                )),
            };
        }
        if !response.is_duplicate() {
            return response;
        }

        debug!(kind = kind.label, name = %lookup.name, "[RESOLVE] Duplicate reported, looking up existing resource");
        if let (Some(read), Some(alias)) = (kind.read, lookup.alias) {
            let mut found = self
                .get(read, &(kind.key)(alias), self.authorised(Map::new()))
                .await;
            if found.is_success() {
                if let Some(id) = extract_id(&found, kind.id_field) {
                    found.promote(kind.id_field, &id);
                    return found;
                }
            }
        }
        if let Some(id) = self.locate(kind, lookup.parent, lookup.name).await {
            response.promote(kind.id_field, &id);
            return response;
        }
        warn!(kind = kind.label, name = %lookup.name, "[RESOLVE] Duplicate reported but resource not found");
        Envelope::failed(format!(
            "{} {} was not created and could not be found: {}",
            kind.label,
            lookup.name,
            response.error_message()
        ))
    }

    /// Find the id of `name` by listing siblings, per `kind.listing`.
    pub(crate) async fn locate(
        &self,
        kind: &ResourceKind,
        parent: Option<&str>,
        name: &str,
    ) -> Option<String> {
        match kind.listing {
            Listing::Unlisted => None,
            Listing::ParentDirectories | Listing::ParentDocuments => {
                let children = if kind.listing == Listing::ParentDirectories {
                    "directories"
                } else {
                    "documents"
                };
                let listing = self.read_directory(parent?).await;
                let items = listed(listing.result(), children);
                find_by_name(&items, "name", None, kind.id_field, name)
            }
            Listing::AllProjects => {
                let listing = self
                    .get("service/json/build/project/", "", self.authorised(Map::new()))
                    .await;
                find_by_name(listing.results(), "alias", Some("name"), kind.id_field, name)
            }
        }
    }

    /// GET a directory by UUID, or by the aliased form of anything else.
    pub(crate) async fn read_directory(&self, folder: &str) -> Envelope {
        self.get(
            "service/json/data/directory/",
            &directory_key(folder),
            self.authorised(Map::new()),
        )
        .await
    }

    /// Authenticate against the session's application.
    ///
    /// The application is first tried in canonical form. When that fails and the
    /// raw identifier has the UUID shape, it is retried as an explicit alias.
    pub async fn login(&self, username: &str, password: &str) -> Envelope {
        let application = self.state.lock().application.clone();
        let response = self
            .login_as(username, password, &resolve(&application))
            .await;
        if response.is_success() || !is_uuid(&application) {
            return response;
        }
        info!(application = %application, "[LOGIN] Retrying login with application as alias");
        self.login_as(username, password, &make_alias(&application))
            .await
    }

    async fn login_as(&self, username: &str, password: &str, client_id: &str) -> Envelope {
        let data = object(json!({
            "username": username,
            "password": password,
            "grant_type": "password",
            "client_id": client_id,
            "transactionId": crate::client::generate_transaction_id(),
        }));
        let response = self.post("service/json/oauth/accesstoken", data).await;
        self.state.lock().set_or_clear_login(&response.payload);
        response
    }

    /// Resolve every segment of a slash-separated path below the application
    /// root, creating what is missing. Stops at the first failure.
    pub async fn make_path(&self, path: &str) -> Envelope {
        let path = normalise_path(path);
        let mut parent = self.state.lock().application_id.clone();
        if path.is_empty() {
            return Envelope::success_with(DIRECTORY.id_field, parent);
        }
        let mut alias = String::new();
        let mut response = Envelope::success();
        for folder in path.split('/') {
            alias.push_str(folder);
            alias.push('/');
            response = self.make_directory(folder, &parent, &alias).await;
            match extract_id(&response, DIRECTORY.id_field) {
                Some(id) if response.is_success() => parent = id,
                _ => {
                    if response.is_success() {
                        response = Envelope::failed(format!(
                            "Directory {alias} resolved without a directoryId"
                        ));
                    }
                    break;
                }
            }
        }
        response
    }

    async fn make_directory(&self, folder: &str, parent: &str, alias: &str) -> Envelope {
        // Directories created by older clients carry a sentinel inside their alias.
        let mut legacy = self.read_directory(&make_alias(alias)).await;
        if legacy.is_success() {
            if let Some(id) = extract_id(&legacy, DIRECTORY.id_field) {
                legacy.promote(DIRECTORY.id_field, &id);
                return legacy;
            }
        }
        info!(folder = %folder, alias = %alias, "[RESOLVE] Creating folder");
        let data = self.transactional(object(json!({
            "name": folder,
            "parent": parent,
            "alias": alias,
        })));
        self.resolve_or_create(
            &DIRECTORY,
            data,
            Lookup {
                name: folder,
                alias: Some(alias),
                parent: Some(parent),
            },
        )
        .await
    }

    /// Create the project `name` (aliased to itself) or find the existing one.
    pub async fn make_project(&self, name: &str, description: &str) -> Envelope {
        let mut data = object(json!({ "name": name, "alias": name }));
        if !description.is_empty() {
            data.insert("description".into(), Value::from(description));
        }
        let data = self.transactional(data);
        let response = self
            .resolve_or_create(
                &PROJECT,
                data,
                Lookup {
                    name,
                    alias: Some(name),
                    parent: None,
                },
            )
            .await;
        self.state.lock().set_or_clear_project(&response.payload);
        response
    }

    /// Create a build under the session's project with a fresh status set.
    pub async fn make_build(
        &self,
        name: &str,
        description: &str,
        alias: &str,
        statuses: &[BuildStatus],
    ) -> Envelope {
        let (status, project_id) = {
            let mut state = self.state.lock();
            state.reset_status();
            state.record(statuses);
            state.build_alias = alias.to_string();
            (state.status_json(), state.project_id.clone())
        };

        let mut data = object(json!({ "name": name }));
        if !alias.is_empty() {
            data.insert("alias".into(), Value::from(alias));
        }
        if !description.is_empty() {
            data.insert("description".into(), Value::from(description));
        }
        data.insert("status".into(), status);
        data.insert("projectId".into(), Value::from(project_id));
        let data = self.transactional(data);
        let response = self
            .resolve_or_create(
                &BUILD,
                data,
                Lookup {
                    name,
                    alias: (!alias.is_empty()).then_some(alias),
                    parent: None,
                },
            )
            .await;
        self.state.lock().set_or_clear_build(&response.payload);
        response
    }

    /// Add `statuses` to the build's set and push the update.
    pub async fn update_build(
        &self,
        name: &str,
        description: &str,
        statuses: &[BuildStatus],
    ) -> Envelope {
        self.state.lock().record(statuses);
        let mut data = object(json!({ "name": name }));
        if !description.is_empty() {
            data.insert("description".into(), Value::from(description));
        }
        self.push_build(data).await
    }

    /// Attach a directory to the session's build.
    pub async fn set_build_directory(&self, directory_id: &str) -> Envelope {
        self.push_build(object(json!({ "directoryIds": [directory_id] })))
            .await
    }

    async fn push_build(&self, mut data: Map<String, Value>) -> Envelope {
        let state = self.state();
        if !state.build_alias.is_empty() {
            data.insert("alias".into(), Value::from(state.build_alias.as_str()));
        }
        data.insert("buildId".into(), Value::from(state.build_id.as_str()));
        data.insert("status".into(), state.status_json());
        let data = self.transactional(data);
        self.put("service/json/build/build/", &state.build_id, data)
            .await
    }

    /// Link an existing file (by URI) into `directory`. With `overwrite`, a
    /// duplicate name updates the existing link and adds `tags` to it.
    pub async fn link(
        &self,
        uri: &str,
        directory: &str,
        name: &str,
        tags: &[String],
        overwrite: bool,
    ) -> Envelope {
        let mut data = self.transactional(object(json!({
            "directoryId": directory,
            "name": name,
            "uri": uri,
            "tags": tags,
        })));
        let response = self.post(DOCUMENT_LINK.create, data.clone()).await;
        if !(response.is_duplicate() && overwrite) {
            return response;
        }
        // Updates take `tagsToAdd` instead of `tags`.
        if let Some(tags) = data.remove("tags") {
            data.insert("tagsToAdd".into(), tags);
        }
        self.reconcile_duplicate(directory, name, "service/json/data/documentlink/", data)
            .await
    }

    /// Reissue a duplicate create as an update against the entry named `name`
    /// in `directory`.
    pub(crate) async fn reconcile_duplicate(
        &self,
        directory: &str,
        name: &str,
        update_service: &str,
        data: Map<String, Value>,
    ) -> Envelope {
        match self.locate(&DOCUMENT_LINK, Some(directory), name).await {
            Some(id) => {
                info!(file = %name, document = %id, "[RESOLVE] Overwriting existing document");
                self.put(update_service, &id, data).await
            }
            None => Envelope::failed(format!(
                "Duplicate reported but no matching entry found: {name} in directory {directory}"
            )),
        }
    }

    pub async fn read_document(&self, document: &str) -> Envelope {
        self.get(
            "service/json/data/document/",
            &resolve(document),
            self.authorised(Map::new()),
        )
        .await
    }

    pub async fn find_documents_with_tags(&self, tags: &[String]) -> Envelope {
        self.get(
            "service/json/data/",
            "document",
            self.authorised(object(json!({ "tags": tags }))),
        )
        .await
    }

    /// Publish test counts for the session's build. Only the
    /// `failCount`, `skipCount`, `passCount` and `totalCount` keys present in
    /// `counts` are sent.
    pub async fn publish_test_results(&self, counts: &Map<String, Value>) -> Envelope {
        let count_fields: Vec<Value> = ["failCount", "skipCount", "passCount", "totalCount"]
            .iter()
            .filter_map(|key| {
                counts
                    .get(*key)
                    .and_then(Value::as_i64)
                    .map(|count| json!({ "name": key, "count": count }))
            })
            .collect();
        let state = self.state();
        let build_id = state.build_id.as_str();
        let event = self.authorised(object(json!({
            "name": "tests",
            "data": build_id,
            "applicationId": state.application_id,
            "historicalIds": [build_id],
            "countFields": count_fields,
            "permanent": true,
        })));
        self.post("service/json/eventstream/appevent", event).await
    }
}

fn listed(result: Option<&Map<String, Value>>, key: &str) -> Vec<Value> {
    result
        .and_then(|r| r.get(key))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn find_by_name(
    items: &[Value],
    name_field: &str,
    fallback_field: Option<&str>,
    id_field: &str,
    name: &str,
) -> Option<String> {
    items.iter().filter_map(Value::as_object).find_map(|item| {
        let label = item
            .get(name_field)
            .or_else(|| fallback_field.and_then(|f| item.get(f)))
            .and_then(Value::as_str)?;
        if label != name {
            return None;
        }
        text_field(item, id_field).map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_path_collapses_and_strips_slashes() {
        assert_eq!(normalise_path("//a///b/c/"), "a/b/c");
        assert_eq!(normalise_path("/"), "");
        assert_eq!(normalise_path(""), "");
    }

    #[test]
    fn find_by_name_matches_exactly() {
        let items = vec![
            json!({"name": "Report.txt", "documentId": "upper"}),
            json!({"name": "report.txt", "documentId": "lower"}),
            json!({"name": "missing-id.txt"}),
        ];
        assert_eq!(
            find_by_name(&items, "name", None, "documentId", "report.txt"),
            Some("lower".to_string())
        );
        assert_eq!(find_by_name(&items, "name", None, "documentId", "missing-id.txt"), None);
    }

    #[test]
    fn projects_fall_back_to_name_when_unaliased() {
        let items = vec![
            json!({"name": "Legacy", "projectId": "p1"}),
            json!({"alias": "job", "name": "Job", "projectId": "p2"}),
        ];
        assert_eq!(
            find_by_name(&items, "alias", Some("name"), "projectId", "Legacy"),
            Some("p1".into())
        );
        assert_eq!(
            find_by_name(&items, "alias", Some("name"), "projectId", "job"),
            Some("p2".into())
        );
    }

    #[test]
    fn extract_id_reads_nested_result() {
        let envelope =
            Envelope::parse(r#"{"status":"Success","result":{"directoryId":"nested"}}"#);
        assert_eq!(extract_id(&envelope, "directoryId"), Some("nested".into()));
    }
}
