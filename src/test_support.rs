//! Fixtures for testing the engine and for applications testing their own
//! integrations: a table-backed element source, a recording history store,
//! a static permission service and a frame-capturing sink.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    connection::{AutoupdatePayload, AutoupdateSink},
    element::{FullData, UserId},
    error::CacheError,
    restrict,
    traits::{Cachable, HistoryEntry, HistoryStore, PermissionService},
};

/// Converts a `serde_json::json!` object literal into [`FullData`].
///
/// Panics on non-object values; fixtures are allowed to be loud.
pub fn full_data(value: Value) -> FullData {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture element must be a JSON object, got {other}"),
    }
}

/// An element source backed by an in-memory table. The table stays mutable
/// after the source was registered, so tests can play the role of the
/// database between bundles.
pub struct TableCachable {
    collection: String,
    config: bool,
    personalized: bool,
    no_delete: bool,
    restriction: Option<(String, std::sync::Arc<dyn PermissionService>)>,
    rows: Mutex<BTreeMap<u64, FullData>>,
}

impl TableCachable {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            config: false,
            personalized: false,
            no_delete: false,
            restriction: None,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(mut self) -> Self {
        self.config = true;
        self
    }

    pub fn personalized(mut self) -> Self {
        self.personalized = true;
        self
    }

    pub fn no_delete_on_restriction(mut self) -> Self {
        self.no_delete = true;
        self
    }

    /// Gates the collection behind one permission, using the all-or-nothing
    /// policy.
    pub fn restricted_by(
        mut self,
        permission: impl Into<String>,
        permissions: std::sync::Arc<dyn PermissionService>,
    ) -> Self {
        self.restriction = Some((permission.into(), permissions));
        self
    }

    pub fn with_rows<I>(self, rows: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        for row in rows {
            self.upsert(full_data(row));
        }
        self
    }

    pub fn upsert(&self, element: FullData) {
        let id = element
            .get("id")
            .and_then(Value::as_u64)
            .expect("fixture element needs a numeric id");
        self.rows.lock().expect("rows lock").insert(id, element);
    }

    pub fn delete(&self, id: u64) {
        self.rows.lock().expect("rows lock").remove(&id);
    }
}

#[async_trait]
impl Cachable for TableCachable {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn is_config(&self) -> bool {
        self.config
    }

    fn personalized(&self) -> bool {
        self.personalized
    }

    fn no_delete_on_restriction(&self) -> bool {
        self.no_delete
    }

    async fn elements(&self) -> Result<Vec<FullData>, CacheError> {
        Ok(self.rows.lock().expect("rows lock").values().cloned().collect())
    }

    async fn elements_by_ids(&self, ids: &[u64]) -> Result<Vec<FullData>, CacheError> {
        let rows = self.rows.lock().expect("rows lock");
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn restrict_elements(
        &self,
        user_id: Option<UserId>,
        elements: Vec<FullData>,
    ) -> Result<Vec<FullData>, CacheError> {
        match &self.restriction {
            None => Ok(elements),
            Some((permission, permissions)) => {
                restrict::by_permission(permissions.as_ref(), permission, user_id, elements).await
            }
        }
    }
}

/// Records every saved batch for later assertions.
#[derive(Debug, Default)]
pub struct RecordingHistory {
    entries: Mutex<Vec<HistoryEntry>>,
    fail: Mutex<bool>,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next saves fail, for testing that commits survive a broken
    /// history store.
    pub fn fail_saves(&self) {
        *self.fail.lock().expect("fail lock") = true;
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().expect("entries lock").clone()
    }
}

#[async_trait]
impl HistoryStore for RecordingHistory {
    async fn save(&self, entries: Vec<HistoryEntry>) -> Result<(), CacheError> {
        if *self.fail.lock().expect("fail lock") {
            return Err(CacheError::external(std::io::Error::other("history store down")));
        }
        self.entries.lock().expect("entries lock").extend(entries);
        Ok(())
    }
}

/// A permission service with a fixed grant table. The unrestricted internal
/// caller (`None`) holds every permission.
#[derive(Debug, Default)]
pub struct StaticPermissions {
    granted: HashMap<UserId, HashSet<String>>,
    groups: HashMap<UserId, Vec<u64>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: UserId, permission: impl Into<String>) -> Self {
        self.granted.entry(user_id).or_default().insert(permission.into());
        self
    }

    pub fn with_groups(mut self, user_id: UserId, groups: Vec<u64>) -> Self {
        self.groups.insert(user_id, groups);
        self
    }
}

#[async_trait]
impl PermissionService for StaticPermissions {
    async fn has_perm(
        &self,
        user_id: Option<UserId>,
        permission: &str,
    ) -> Result<bool, CacheError> {
        Ok(match user_id {
            None => true,
            Some(user_id) => self
                .granted
                .get(&user_id)
                .map_or(false, |permissions| permissions.contains(permission)),
        })
    }

    async fn user_groups(&self, user_id: Option<UserId>) -> Result<Vec<u64>, CacheError> {
        Ok(user_id
            .and_then(|user_id| self.groups.get(&user_id).cloned())
            .unwrap_or_default())
    }
}

/// Everything a sink can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Autoupdate {
        payload: AutoupdatePayload,
        in_response: Option<String>,
    },
    Error {
        code: u32,
        message: String,
        in_response: Option<String>,
    },
}

/// Captures outgoing frames instead of sending them anywhere.
#[derive(Debug, Default)]
pub struct CaptureSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// Returns the captured events and clears the buffer.
    pub fn take(&self) -> Vec<SinkEvent> {
        std::mem::take(&mut *self.events.lock().expect("events lock"))
    }
}

#[async_trait]
impl AutoupdateSink for CaptureSink {
    async fn send_autoupdate(&self, payload: AutoupdatePayload, in_response: Option<String>) {
        self.events.lock().expect("events lock").push(SinkEvent::Autoupdate {
            payload,
            in_response,
        });
    }

    async fn send_error(&self, code: u32, message: String, in_response: Option<String>) {
        self.events.lock().expect("events lock").push(SinkEvent::Error {
            code,
            message,
            in_response,
        });
    }
}
