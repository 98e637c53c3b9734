use std::{collections::BTreeMap, sync::Arc};

use crate::{error::CacheError, traits::Cachable};

/// The immutable set of all registered collections, built once at process
/// start. Iteration order is the collection name order, which keeps cache
/// builds deterministic.
pub struct CachableRegistry {
    cachables: BTreeMap<String, Arc<dyn Cachable>>,
}

impl CachableRegistry {
    pub fn new<I>(cachables: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = Arc<dyn Cachable>>,
    {
        let mut map: BTreeMap<String, Arc<dyn Cachable>> = BTreeMap::new();
        for cachable in cachables {
            let collection = cachable.collection().to_owned();
            if map.insert(collection.clone(), cachable).is_some() {
                return Err(CacheError::DuplicateCollection(collection));
            }
        }
        Ok(Self { cachables: map })
    }

    pub fn get(&self, collection: &str) -> Option<&Arc<dyn Cachable>> {
        self.cachables.get(collection)
    }

    /// Like [`get`](Self::get), but an unknown collection is a fatal wiring
    /// error: elements of unregistered collections can never enter the
    /// cache, so encountering one means the process is misconfigured.
    pub fn require(&self, collection: &str) -> &Arc<dyn Cachable> {
        match self.cachables.get(collection) {
            Some(cachable) => cachable,
            None => panic!("collection {collection:?} is not registered"),
        }
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.cachables.contains_key(collection)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Cachable>> {
        self.cachables.values()
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.cachables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cachables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cachables.is_empty()
    }
}

impl std::fmt::Debug for CachableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachableRegistry")
            .field("collections", &self.cachables.keys().collect::<Vec<_>>())
            .finish()
    }
}
