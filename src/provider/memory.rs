use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    element::split_element_id,
    error::CacheError,
    provider::{CacheProvider, DataSince},
};

#[derive(Debug, Default)]
struct MemoryState {
    full_data:    BTreeMap<String, String>,
    // change id -> element ids touched at that change id
    change_index: BTreeMap<u64, BTreeSet<String>>,
    lowest:       Option<u64>,
    ready:        bool,
}

impl MemoryState {
    fn guard_ready(&self) -> Result<(), CacheError> {
        if self.ready && self.lowest.is_some() {
            Ok(())
        }
        else {
            Err(CacheError::CacheEmpty)
        }
    }

    fn current(&self) -> u64 {
        let highest = self.change_index.keys().next_back().copied();
        highest.or(self.lowest).unwrap_or(0)
    }
}

/// A process-local [`CacheProvider`]. All compound operations run under one
/// mutex, which gives them the same atomicity the networked implementation
/// gets from server-side scripts.
///
/// The mutex is a plain [`std::sync::Mutex`]; it is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct MemoryCacheProvider {
    state: Mutex<MemoryState>,
}

impl MemoryCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // Lock poisoning would mean a panic inside one of the short critical
        // sections below; the state is still consistent then.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheProvider for MemoryCacheProvider {
    async fn clear(&self) -> Result<(), CacheError> {
        *self.lock() = MemoryState::default();
        Ok(())
    }

    async fn reset_full_cache(
        &self,
        data: BTreeMap<String, String>,
        default_change_id: u64,
    ) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.full_data = data;
        state.change_index.clear();
        state.lowest = Some(default_change_id);
        state.ready = false;
        Ok(())
    }

    async fn bulk_write(&self, data: BTreeMap<String, String>) -> Result<(), CacheError> {
        self.lock().full_data.extend(data);
        Ok(())
    }

    async fn mark_ready(&self) -> Result<(), CacheError> {
        self.lock().ready = true;
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, CacheError> {
        let state = self.lock();
        Ok(state.ready && state.lowest.is_some())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, String>, CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        Ok(state.full_data.clone())
    }

    async fn get_all_with_max_change_id(
        &self,
    ) -> Result<(u64, BTreeMap<String, String>), CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        Ok((state.current(), state.full_data.clone()))
    }

    async fn get_collection(&self, collection: &str) -> Result<BTreeMap<u64, String>, CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        let prefix = format!("{collection}:");
        let mut elements = BTreeMap::new();
        for (element_id, data) in state.full_data.range(prefix.clone()..) {
            if !element_id.starts_with(&prefix) {
                break;
            }
            let (_, id) = split_element_id(element_id)?;
            elements.insert(id, data.clone());
        }
        Ok(elements)
    }

    async fn get_one(&self, element_id: &str) -> Result<Option<String>, CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        Ok(state.full_data.get(element_id).cloned())
    }

    async fn apply_changes(
        &self,
        changed: Vec<(String, String)>,
        deleted: Vec<String>,
    ) -> Result<u64, CacheError> {
        let mut state = self.lock();
        state.guard_ready()?;
        let change_id = state.current() + 1;
        let mut touched = BTreeSet::new();
        for (element_id, data) in changed {
            touched.insert(element_id.clone());
            state.full_data.insert(element_id, data);
        }
        for element_id in deleted {
            state.full_data.remove(&element_id);
            touched.insert(element_id);
        }
        state.change_index.insert(change_id, touched);
        Ok(change_id)
    }

    async fn get_data_since(&self, change_id: u64) -> Result<DataSince, CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        let mut touched = BTreeSet::new();
        for ids in state.change_index.range(change_id..).map(|(_, ids)| ids) {
            touched.extend(ids.iter().cloned());
        }
        let mut result = DataSince {
            max_change_id: state.current(),
            ..DataSince::default()
        };
        for element_id in touched {
            match state.full_data.get(&element_id) {
                Some(data) => {
                    let (collection, _) = split_element_id(&element_id)?;
                    result
                        .changed
                        .entry(collection.to_owned())
                        .or_default()
                        .push(data.clone());
                }
                None => result.deleted.push(element_id),
            }
        }
        Ok(result)
    }

    async fn current_change_id(&self) -> Result<u64, CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        Ok(state.current())
    }

    async fn lowest_change_id(&self) -> Result<u64, CacheError> {
        let state = self.lock();
        state.guard_ready()?;
        state.lowest.ok_or(CacheError::CacheEmpty)
    }
}
