use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info, warn};

use crate::{
    element::{element_id, full_data_id, split_element_id, take_restriction_marker, FullData, UserId},
    error::CacheError,
    locking::{LockProvider, MemoryLockProvider},
    provider::{CacheProvider, MemoryCacheProvider},
    registry::CachableRegistry,
};

const BUILD_LOCK: &str = "build_cache";
const BUILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Retries an operation once after rebuilding the cache when the store
/// reports empty. A second empty means something keeps wiping the store
/// faster than it can be rebuilt.
macro_rules! ensured {
    ($self:ident, $call:expr) => {{
        match $call {
            Err(CacheError::CacheEmpty) => {
                warn!("cache store reported empty; rebuilding and retrying");
                $self.ensure_cache(true).await?;
                match $call {
                    Err(CacheError::CacheEmpty) => Err(CacheError::RebuildFailed),
                    retried => retried,
                }
            }
            first => first,
        }
    }};
}

/// The element cache: the authoritative, always-current copy of every
/// element the application serves, together with a change id history that
/// lets clients catch up with small diffs.
///
/// All workers of a deployment share one store; the cache object itself is
/// cheap state around the provider, the build lock and the collection
/// registry.
pub struct ElementCache {
    provider:   Arc<dyn CacheProvider>,
    locking:    Arc<dyn LockProvider>,
    registry:   Arc<CachableRegistry>,
    /// Highest change id this process has seen, kept across store flushes
    /// so a rebuild never re-issues an id already handed to clients.
    high_water: AtomicU64,
}

impl ElementCache {
    pub fn new(
        provider: Arc<dyn CacheProvider>,
        locking: Arc<dyn LockProvider>,
        registry: Arc<CachableRegistry>,
    ) -> Self {
        Self {
            provider,
            locking,
            registry,
            high_water: AtomicU64::new(0),
        }
    }

    /// A cache over process-local storage, for single-worker setups and
    /// tests.
    pub fn in_memory(registry: Arc<CachableRegistry>) -> Self {
        Self::new(
            Arc::new(MemoryCacheProvider::new()),
            Arc::new(MemoryLockProvider::new()),
            registry,
        )
    }

    pub fn registry(&self) -> &Arc<CachableRegistry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }

    fn note_change_id(&self, change_id: u64) {
        self.high_water.fetch_max(change_id, Ordering::Relaxed);
    }

    /// Makes sure the cache exists, building it when needed. With
    /// `force_rebuild` the data is re-read from the sources even when the
    /// store looks healthy.
    ///
    /// Only one process builds at a time; the others wait for the build lock
    /// to clear and then use the result.
    pub async fn ensure_cache(&self, force_rebuild: bool) -> Result<(), CacheError> {
        if force_rebuild || !self.provider.is_ready().await? {
            self.build_cache(force_rebuild).await?;
        }
        Ok(())
    }

    async fn build_cache(&self, force_rebuild: bool) -> Result<(), CacheError> {
        if self.locking.try_acquire(BUILD_LOCK).await? {
            let built = self.build_cache_locked(force_rebuild).await;
            self.locking.release(BUILD_LOCK).await?;
            built
        }
        else {
            info!("another process is building the cache; waiting for it");
            while self.locking.is_held(BUILD_LOCK).await? {
                tokio::time::sleep(BUILD_POLL_INTERVAL).await;
            }
            info!("cache was built by another process");
            Ok(())
        }
    }

    async fn build_cache_locked(&self, force_rebuild: bool) -> Result<(), CacheError> {
        // Double check: someone else may have finished a build between our
        // readiness probe and taking the lock.
        if !force_rebuild && self.provider.is_ready().await? {
            return Ok(());
        }

        // Wall clock alone is not enough: a rebuild within the same
        // millisecond as warm commits would seed a lowest change id below
        // ids already handed to clients. Clamp above everything the store
        // still knows and everything this process has seen.
        let stored = match self.provider.current_change_id().await {
            Ok(current) => current,
            Err(CacheError::CacheEmpty) => 0,
            Err(error) => return Err(error),
        };
        let floor = stored.max(self.high_water.load(Ordering::Relaxed));
        let default_change_id = wall_clock_change_id().max(floor + 1);
        self.note_change_id(default_change_id);
        info!(default_change_id, "building the element cache");

        // Config collections go in first, so element sources that read
        // settings during serialization find them in the cache already.
        let config_data = self.collect_full_data(true).await?;
        self.provider.reset_full_cache(config_data, default_change_id).await?;

        let data = self.collect_full_data(false).await?;
        self.provider.bulk_write(data).await?;
        self.provider.mark_ready().await?;
        info!("element cache is ready");
        Ok(())
    }

    async fn collect_full_data(
        &self,
        config_phase: bool,
    ) -> Result<BTreeMap<String, String>, CacheError> {
        let mut data = BTreeMap::new();
        for cachable in self.registry.iter() {
            if cachable.is_config() != config_phase {
                continue;
            }
            let collection = cachable.collection();
            let elements = cachable.elements().await?;
            debug!(collection, count = elements.len(), "loaded collection");
            for element in elements {
                let id = full_data_id(collection, &element)?;
                data.insert(element_id(collection, id), serde_json::to_string(&element)?);
            }
        }
        Ok(data)
    }

    /// All elements grouped by collection, restricted for the given viewer.
    /// `None` is the unrestricted internal view.
    pub async fn get_all_data(
        &self,
        user_id: Option<UserId>,
    ) -> Result<BTreeMap<String, Vec<FullData>>, CacheError> {
        let raw = ensured!(self, self.provider.get_all().await)?;
        self.format_all_data(raw, user_id).await
    }

    /// Like [`get_all_data`](Self::get_all_data), plus the change id the data
    /// is current as of, read atomically. This is what a full resync sends.
    pub async fn get_all_data_with_max_change_id(
        &self,
        user_id: Option<UserId>,
    ) -> Result<(u64, BTreeMap<String, Vec<FullData>>), CacheError> {
        let (max_change_id, raw) = ensured!(self, self.provider.get_all_with_max_change_id().await)?;
        self.note_change_id(max_change_id);
        Ok((max_change_id, self.format_all_data(raw, user_id).await?))
    }

    async fn format_all_data(
        &self,
        raw: BTreeMap<String, String>,
        user_id: Option<UserId>,
    ) -> Result<BTreeMap<String, Vec<FullData>>, CacheError> {
        let mut grouped: BTreeMap<String, Vec<FullData>> = BTreeMap::new();
        for (element_id, data) in raw {
            let (collection, _) = split_element_id(&element_id)?;
            let mut element: FullData = serde_json::from_str(&data)?;
            take_restriction_marker(&mut element);
            grouped.entry(collection.to_owned()).or_default().push(element);
        }
        let mut result = BTreeMap::new();
        for (collection, mut elements) in grouped {
            elements.sort_by_key(|element| full_data_id(&collection, element).unwrap_or(u64::MAX));
            let elements = self.restrict(&collection, elements, user_id).await?;
            if !elements.is_empty() {
                result.insert(collection, elements);
            }
        }
        Ok(result)
    }

    /// All elements of one collection, unrestricted, keyed by id.
    pub async fn get_collection_data(
        &self,
        collection: &str,
    ) -> Result<BTreeMap<u64, FullData>, CacheError> {
        let raw = ensured!(self, self.provider.get_collection(collection).await)?;
        let mut elements = BTreeMap::new();
        for (id, data) in raw {
            let mut element: FullData = serde_json::from_str(&data)?;
            take_restriction_marker(&mut element);
            elements.insert(id, element);
        }
        Ok(elements)
    }

    /// One element, restricted for the given viewer. `None` both when the
    /// element does not exist and when the viewer may not see it.
    pub async fn get_element(
        &self,
        collection: &str,
        id: u64,
        user_id: Option<UserId>,
    ) -> Result<Option<FullData>, CacheError> {
        let element_id = element_id(collection, id);
        let Some(data) = ensured!(self, self.provider.get_one(&element_id).await)?
        else {
            return Ok(None);
        };
        let mut element: FullData = serde_json::from_str(&data)?;
        take_restriction_marker(&mut element);
        let restricted = self.restrict(collection, vec![element], user_id).await?;
        Ok(restricted.into_iter().next())
    }

    /// Writes changed elements (`Some`) and deletions (`None`) atomically and
    /// returns the change id assigned to all of them.
    pub async fn apply_changes(
        &self,
        elements: BTreeMap<String, Option<FullData>>,
    ) -> Result<u64, CacheError> {
        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for (element_id, element) in elements {
            match element {
                Some(full_data) => changed.push((element_id, serde_json::to_string(&full_data)?)),
                None => deleted.push(element_id),
            }
        }
        let change_id = ensured!(
            self,
            self.provider.apply_changes(changed.clone(), deleted.clone()).await
        )?;
        self.note_change_id(change_id);
        Ok(change_id)
    }

    /// Everything that changed after `change_id`, restricted for the viewer:
    /// changed elements grouped by collection, plus the element ids to
    /// delete, plus the change id the response is current as of.
    ///
    /// `change_id == 0` asks for all data. A change id at or below the
    /// lowest retained one raises [`CacheError::ChangeIdTooLow`]; the caller
    /// falls back to a full resync then.
    #[allow(clippy::type_complexity)]
    pub async fn get_data_since(
        &self,
        user_id: Option<UserId>,
        change_id: u64,
    ) -> Result<(u64, BTreeMap<String, Vec<FullData>>, Vec<String>), CacheError> {
        if change_id == 0 {
            let (max_change_id, all_data) = self.get_all_data_with_max_change_id(user_id).await?;
            return Ok((max_change_id, all_data, Vec::new()));
        }

        let lowest = self.lowest_change_id().await?;
        if change_id <= lowest {
            return Err(CacheError::ChangeIdTooLow {
                requested: change_id,
                lowest,
            });
        }

        let since = ensured!(self, self.provider.get_data_since(change_id).await)?;
        self.note_change_id(since.max_change_id);
        let mut deleted = since.deleted;
        let mut changed: BTreeMap<String, Vec<FullData>> = BTreeMap::new();

        for (collection, raw_elements) in since.changed {
            let mut elements: Vec<FullData> = Vec::with_capacity(raw_elements.len());
            let mut unrestricted_ids = Vec::new();
            for raw in raw_elements {
                let mut element: FullData = serde_json::from_str(&raw)?;
                let marked = take_restriction_marker(&mut element);
                if user_id.is_some() && !marked {
                    unrestricted_ids.push(full_data_id(&collection, &element)?);
                }
                elements.push(element);
            }

            let elements = match user_id {
                None => elements,
                Some(_) => {
                    let cachable = self.registry.require(&collection);
                    let restricted = cachable.restrict_elements(user_id, elements).await?;
                    // Elements the viewer lost access to become deletions,
                    // unless the collection opted out of that.
                    if !cachable.personalized() && !cachable.no_delete_on_restriction() {
                        let visible: Vec<u64> = restricted
                            .iter()
                            .filter_map(|element| full_data_id(&collection, element).ok())
                            .collect();
                        for id in unrestricted_ids {
                            if !visible.contains(&id) {
                                deleted.push(element_id(&collection, id));
                            }
                        }
                    }
                    restricted
                }
            };
            if !elements.is_empty() {
                changed.insert(collection, elements);
            }
        }

        Ok((since.max_change_id, changed, deleted))
    }

    pub async fn current_change_id(&self) -> Result<u64, CacheError> {
        let change_id = ensured!(self, self.provider.current_change_id().await)?;
        self.note_change_id(change_id);
        Ok(change_id)
    }

    pub async fn lowest_change_id(&self) -> Result<u64, CacheError> {
        ensured!(self, self.provider.lowest_change_id().await)
    }

    /// Applies the collection's restriction policy for one viewer. `None`
    /// bypasses restriction entirely.
    pub async fn restrict(
        &self,
        collection: &str,
        elements: Vec<FullData>,
        user_id: Option<UserId>,
    ) -> Result<Vec<FullData>, CacheError> {
        match user_id {
            None => Ok(elements),
            Some(_) => {
                self.registry
                    .require(collection)
                    .restrict_elements(user_id, elements)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for ElementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementCache")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Wall-clock candidate for a fresh build's change id: milliseconds since
/// the Unix epoch. Makes change ids grow across process restarts; the build
/// path additionally clamps above any id the running deployment already
/// issued, so clients holding a pre-rebuild change id fall into the too-low
/// path and resync instead of silently missing data.
fn wall_clock_change_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
