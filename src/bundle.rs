use std::{
    collections::BTreeMap,
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error};

use crate::{
    cache::ElementCache,
    element::{element_id, full_data_id, FullData, UserId, NO_DELETE_ON_RESTRICTION_FIELD},
    error::CacheError,
    projector::{ProjectorResolver, ProjectorUpdate},
    traits::{HistoryEntry, HistoryStore},
};

const CHANNEL_CAPACITY: usize = 256;

/// The payload state of one element inside a bundle.
#[derive(Debug, Clone)]
pub enum ElementData {
    /// No inline data; the dispatcher loads the current state from the
    /// element source when the bundle is committed. An id the source does
    /// not know is treated as deleted.
    Unresolved,
    Deleted,
    Full(FullData),
}

/// One element mutation inside an [`AutoupdateBundle`].
#[derive(Debug, Clone)]
pub struct AutoupdateElement {
    pub collection: String,
    pub id: u64,
    pub data: ElementData,
    /// Free-form history information, e.g. "Motion updated".
    pub information: Vec<String>,
    /// The user who caused the change, for the history record.
    pub user_id: Option<UserId>,
    pub disable_history: bool,
    pub no_delete_on_restriction: bool,
}

impl AutoupdateElement {
    pub fn new(collection: impl Into<String>, id: u64) -> Self {
        Self {
            collection: collection.into(),
            id,
            data: ElementData::Unresolved,
            information: Vec::new(),
            user_id: None,
            disable_history: false,
            no_delete_on_restriction: false,
        }
    }

    /// Inline data: `Some` for the new state, `None` for a deletion.
    pub fn with_data(mut self, data: Option<FullData>) -> Self {
        self.data = match data {
            Some(full_data) => ElementData::Full(full_data),
            None => ElementData::Deleted,
        };
        self
    }

    pub fn with_information(mut self, information: Vec<String>) -> Self {
        self.information = information;
        self
    }

    pub fn with_user_id(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn skip_history(mut self) -> Self {
        self.disable_history = true;
        self
    }

    pub fn no_delete_on_restriction(mut self) -> Self {
        self.no_delete_on_restriction = true;
        self
    }

    fn element_id(&self) -> String {
        element_id(&self.collection, self.id)
    }
}

/// Broadcast to every consumer after a bundle was committed.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub change_id: u64,
}

/// Shared hub owning the cache, the history store, the optional projector
/// resolver and the broadcast channels. Mutations go through
/// [`bundle`](Self::bundle).
pub struct AutoupdateDispatcher {
    cache:        Arc<ElementCache>,
    history:      Arc<dyn HistoryStore>,
    projector:    Option<Arc<dyn ProjectorResolver>>,
    change_tx:    broadcast::Sender<ChangeNotification>,
    projector_tx: broadcast::Sender<ProjectorUpdate>,
}

impl AutoupdateDispatcher {
    pub fn new(cache: Arc<ElementCache>, history: Arc<dyn HistoryStore>) -> Self {
        let (change_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (projector_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            cache,
            history,
            projector: None,
            change_tx,
            projector_tx,
        }
    }

    pub fn with_projector(mut self, resolver: Arc<dyn ProjectorResolver>) -> Self {
        self.projector = Some(resolver);
        self
    }

    pub fn cache(&self) -> &Arc<ElementCache> {
        &self.cache
    }

    /// Starts an empty bundle. Collect every element a request mutated into
    /// one bundle, so all of them share a single change id and one
    /// notification.
    pub fn bundle(self: &Arc<Self>) -> AutoupdateBundle {
        AutoupdateBundle {
            dispatcher: Arc::clone(self),
            elements: BTreeMap::new(),
            history_disabled: false,
        }
    }

    /// New consumers subscribe here; every committed bundle produces one
    /// notification carrying its change id.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.change_tx.subscribe()
    }

    pub fn subscribe_projector(&self) -> broadcast::Receiver<ProjectorUpdate> {
        self.projector_tx.subscribe()
    }

    /// The change notifications as a stream, for transport layers built on
    /// stream combinators rather than a receiver loop.
    pub fn change_stream(&self) -> BroadcastStream<ChangeNotification> {
        BroadcastStream::new(self.change_tx.subscribe())
    }

    pub fn projector_stream(&self) -> BroadcastStream<ProjectorUpdate> {
        BroadcastStream::new(self.projector_tx.subscribe())
    }
}

impl std::fmt::Debug for AutoupdateDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoupdateDispatcher")
            .field("cache", &self.cache)
            .field("has_projector", &self.projector.is_some())
            .finish_non_exhaustive()
    }
}

/// A batch of element mutations that is committed as one atomic change.
///
/// Later additions of the same element win over earlier ones.
pub struct AutoupdateBundle {
    dispatcher:       Arc<AutoupdateDispatcher>,
    // collection -> id -> element
    elements:         BTreeMap<String, BTreeMap<u64, AutoupdateElement>>,
    history_disabled: bool,
}

impl AutoupdateBundle {
    pub fn add<I>(&mut self, elements: I)
    where
        I: IntoIterator<Item = AutoupdateElement>,
    {
        for element in elements {
            self.elements
                .entry(element.collection.clone())
                .or_default()
                .insert(element.id, element);
        }
    }

    /// Suppresses history for the whole bundle, e.g. for bulk imports.
    pub fn disable_history(&mut self) {
        self.history_disabled = true;
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.values().map(BTreeMap::len).sum()
    }

    /// Commits the bundle: resolves elements without inline data from their
    /// sources, writes history, applies everything to the cache under one
    /// new change id and notifies the subscribers. Returns the change id, or
    /// `None` for an empty bundle.
    ///
    /// A failing history store is logged and does not block the commit.
    pub async fn done(mut self) -> Result<Option<u64>, CacheError> {
        if self.is_empty() {
            return Ok(None);
        }

        self.resolve_unresolved().await?;
        self.write_history().await;

        let mut cache_elements: BTreeMap<String, Option<FullData>> = BTreeMap::new();
        for element in self.elements.values().flat_map(BTreeMap::values) {
            let data = match &element.data {
                ElementData::Full(full_data) => {
                    let mut full_data = full_data.clone();
                    if element.no_delete_on_restriction {
                        full_data.insert(
                            NO_DELETE_ON_RESTRICTION_FIELD.to_owned(),
                            Value::Bool(true),
                        );
                    }
                    Some(full_data)
                }
                ElementData::Deleted => None,
                // resolve_unresolved left none of these behind
                ElementData::Unresolved => None,
            };
            cache_elements.insert(element.element_id(), data);
        }

        let dispatcher = &self.dispatcher;
        let change_id = dispatcher.cache.apply_changes(cache_elements).await?;
        debug!(change_id, elements = self.len(), "autoupdate bundle committed");

        // Nobody listening is fine.
        let _ = dispatcher.change_tx.send(ChangeNotification { change_id });

        if let Some(resolver) = &dispatcher.projector {
            match resolver.projector_data(&dispatcher.cache).await {
                Ok(data) => {
                    let _ = dispatcher.projector_tx.send(ProjectorUpdate { change_id, data });
                }
                Err(error) => error!(%error, "projector data could not be rendered"),
            }
        }

        Ok(Some(change_id))
    }

    /// Loads current data for all elements added without inline data, one
    /// batched source query per collection. Ids the source does not return
    /// are deletions.
    async fn resolve_unresolved(&mut self) -> Result<(), CacheError> {
        let registry = Arc::clone(self.dispatcher.cache.registry());
        for (collection, elements) in &mut self.elements {
            let ids: Vec<u64> = elements
                .values()
                .filter(|element| matches!(element.data, ElementData::Unresolved))
                .map(|element| element.id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let cachable = registry.require(collection);
            let loaded = cachable.elements_by_ids(&ids).await?;
            for full_data in loaded {
                let id = full_data_id(collection, &full_data)?;
                if let Some(element) = elements.get_mut(&id) {
                    if matches!(element.data, ElementData::Unresolved) {
                        element.data = ElementData::Full(full_data);
                    }
                }
            }
            for element in elements.values_mut() {
                if matches!(element.data, ElementData::Unresolved) {
                    element.data = ElementData::Deleted;
                }
            }
        }
        Ok(())
    }

    async fn write_history(&self) {
        if self.history_disabled {
            return;
        }
        let entries: Vec<HistoryEntry> = self
            .elements
            .values()
            .flat_map(BTreeMap::values)
            .filter(|element| !element.disable_history)
            .map(|element| HistoryEntry {
                element_id:  element.element_id(),
                information: element.information.clone(),
                user_id:     element.user_id,
                full_data:   match &element.data {
                    ElementData::Full(full_data) => Some(full_data.clone()),
                    _ => None,
                },
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        if let Err(error) = self.dispatcher.history.save(entries).await {
            error!(%error, "history entries could not be saved; committing anyway");
        }
    }
}

impl std::fmt::Debug for AutoupdateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoupdateBundle")
            .field("elements", &self.len())
            .field("history_disabled", &self.history_disabled)
            .finish()
    }
}
