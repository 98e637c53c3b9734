use std::collections::BTreeMap;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};

use crate::{
    element::split_element_id,
    error::CacheError,
    provider::{CacheProvider, DataSince},
};

const FULL_DATA_KEY: &str = "full_data";
const CHANGE_ID_KEY: &str = "change_id";
const READY_KEY: &str = "ready";

/// Sentinel member of the change id index; its score is the change id of the
/// last full build.
const LOWEST_SENTINEL: &str = "_config:lowest_change_id";

/// Prepended to every script. Raising a custom error reply instead of
/// returning a sentinel keeps the empty-cache signal on the error path, where
/// the retry wrapper catches it.
const ENSURE_PREFIX: &str = r#"
if (redis.call('exists', KEYS[1]) == 0 or redis.call('exists', KEYS[3]) == 0) then
    return redis.error_reply("cache_empty")
end
"#;

const GET_ALL: &str = "return redis.call('hgetall', KEYS[1])";

const GET_ALL_WITH_MAX_CHANGE_ID: &str = r#"
local tmp = redis.call('zrevrangebyscore', KEYS[2], '+inf', '-inf', 'WITHSCORES', 'LIMIT', 0, 1)
if next(tmp) == nil then
    return redis.error_reply("cache_empty")
end
local all_data = redis.call('hgetall', KEYS[1])
table.insert(all_data, 'max_change_id')
table.insert(all_data, tmp[2])
return all_data
"#;

const GET_COLLECTION: &str = r#"
local cursor = 0
local collection = {}
repeat
    local result = redis.call('HSCAN', KEYS[1], cursor, 'MATCH', ARGV[1])
    cursor = tonumber(result[1])
    for _, v in pairs(result[2]) do
        table.insert(collection, v)
    end
until cursor == 0
return collection
"#;

const GET_ONE: &str = "return redis.call('hget', KEYS[1], ARGV[1])";

// ARGV[1]: number of changed entries (element_id/json pairs, flattened)
// ARGV[2]: number of deleted element ids
// ARGV[3..]: the changed entries followed by the deleted ids
//
// unpack() is limited in the number of arguments it accepts, hence the
// batches of 1000.
const APPLY_CHANGES: &str = r#"
local tmp = redis.call('zrevrangebyscore', KEYS[2], '+inf', '-inf', 'WITHSCORES', 'LIMIT', 0, 1)
if next(tmp) == nil then
    return redis.error_reply("cache_empty")
end
local change_id = tmp[2] + 1

local nc = tonumber(ARGV[1])
local nd = tonumber(ARGV[2])

local i, max, batch_counter
local change_id_data -- change_id, element_id, change_id, element_id, ...

local elements -- element_id, element, element_id, element, ...
if (nc > 0) then
    i = 3
    max = 3 + nc
    while (i < max) do
        change_id_data = {}
        elements = {}
        batch_counter = 1
        while (i < max and batch_counter <= 1000) do
            change_id_data[batch_counter] = change_id
            change_id_data[batch_counter + 1] = ARGV[i]
            elements[batch_counter] = ARGV[i]
            elements[batch_counter + 1] = ARGV[i + 1]
            batch_counter = batch_counter + 2
            i = i + 2
        end
        if (#change_id_data > 0) then
            redis.call('hmset', KEYS[1], unpack(elements))
            redis.call('zadd', KEYS[2], unpack(change_id_data))
        end
    end
end

local element_ids
local element_ids_counter
if (nd > 0) then
    i = 3 + nc
    max = 3 + nc + nd
    while (i < max) do
        change_id_data = {}
        element_ids = {}
        batch_counter = 1
        element_ids_counter = 1
        while (i < max and batch_counter <= 1000) do
            change_id_data[batch_counter] = change_id
            change_id_data[batch_counter + 1] = ARGV[i]
            element_ids[element_ids_counter] = ARGV[i]
            batch_counter = batch_counter + 2
            element_ids_counter = element_ids_counter + 1
            i = i + 1
        end
        if (#change_id_data > 0) then
            redis.call('hdel', KEYS[1], unpack(element_ids))
            redis.call('zadd', KEYS[2], unpack(change_id_data))
        end
    end
end
return change_id
"#;

// Returns a flat list: 'max_change_id', <max>, then element_id/json pairs.
// The json entry is nil for elements that were deleted in the window.
const GET_DATA_SINCE: &str = r#"
local tmp = redis.call('zrevrangebyscore', KEYS[2], '+inf', '-inf', 'WITHSCORES', 'LIMIT', 0, 1)
if next(tmp) == nil then
    return redis.error_reply("cache_empty")
end
local max_change_id = tmp[2]

local element_ids = redis.call('zrangebyscore', KEYS[2], ARGV[1], max_change_id)

local elements = {}
table.insert(elements, 'max_change_id')
table.insert(elements, max_change_id)
for _, element_id in pairs(element_ids) do
    table.insert(elements, element_id)
    table.insert(elements, redis.call('hget', KEYS[1], element_id))
end
return elements
"#;

const CURRENT_CHANGE_ID: &str = r#"
local tmp = redis.call('zrevrangebyscore', KEYS[2], '+inf', '-inf', 'WITHSCORES', 'LIMIT', 0, 1)
if next(tmp) == nil then
    return redis.error_reply("cache_empty")
end
return tmp[2]
"#;

const LOWEST_CHANGE_ID: &str = r#"
local score = redis.call('zscore', KEYS[2], ARGV[1])
if (score == false) then
    return redis.error_reply("cache_empty")
end
return score
"#;

fn script(body: &str) -> Script {
    Script::new(&format!("{ENSURE_PREFIX}{body}"))
}

/// A [`CacheProvider`] backed by redis, shared by all workers of a
/// deployment.
///
/// Elements live in the `full_data` hash; the `change_id` sorted set maps
/// element ids to the change id they were last touched at. All compound
/// operations run as server-side scripts, so they are atomic across
/// processes. Each script starts by probing the cache keys and raises
/// `cache_empty` when an external flush wiped them.
pub struct RedisCacheProvider {
    manager:                    ConnectionManager,
    get_all:                    Script,
    get_all_with_max_change_id: Script,
    get_collection:             Script,
    get_one:                    Script,
    apply_changes:              Script,
    get_data_since:             Script,
    current_change_id:          Script,
    lowest_change_id:           Script,
}

impl RedisCacheProvider {
    /// Connects to redis. The connection manager reconnects on its own, so
    /// one provider lives as long as the process.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::with_manager(manager))
    }

    pub fn with_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            get_all: script(GET_ALL),
            get_all_with_max_change_id: script(GET_ALL_WITH_MAX_CHANGE_ID),
            get_collection: script(GET_COLLECTION),
            get_one: script(GET_ONE),
            apply_changes: script(APPLY_CHANGES),
            get_data_since: script(GET_DATA_SINCE),
            current_change_id: script(CURRENT_CHANGE_ID),
            lowest_change_id: script(LOWEST_CHANGE_ID),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn pairs_to_map(flat: Vec<String>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let mut iter = flat.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        map.insert(key, value);
    }
    map
}

#[async_trait]
impl CacheProvider for RedisCacheProvider {
    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .del(FULL_DATA_KEY)
            .del(CHANGE_ID_KEY)
            .del(READY_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset_full_cache(
        &self,
        data: BTreeMap<String, String>,
        default_change_id: u64,
    ) -> Result<(), CacheError> {
        let items: Vec<(String, String)> = data.into_iter().collect();
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(CHANGE_ID_KEY)
            .del(FULL_DATA_KEY)
            .del(READY_KEY);
        if !items.is_empty() {
            pipe.hset_multiple(FULL_DATA_KEY, &items);
        }
        pipe.zadd(CHANGE_ID_KEY, LOWEST_SENTINEL, default_change_id);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn bulk_write(&self, data: BTreeMap<String, String>) -> Result<(), CacheError> {
        if data.is_empty() {
            return Ok(());
        }
        let items: Vec<(String, String)> = data.into_iter().collect();
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(FULL_DATA_KEY, &items).await?;
        Ok(())
    }

    async fn mark_ready(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: () = conn.set(READY_KEY, 1).await?;
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        Ok(conn.exists(READY_KEY).await?)
    }

    async fn get_all(&self) -> Result<BTreeMap<String, String>, CacheError> {
        let flat: Vec<String> = self
            .get_all
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(pairs_to_map(flat))
    }

    async fn get_all_with_max_change_id(
        &self,
    ) -> Result<(u64, BTreeMap<String, String>), CacheError> {
        let flat: Vec<String> = self
            .get_all_with_max_change_id
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .invoke_async(&mut self.conn())
            .await?;
        let mut map = pairs_to_map(flat);
        let max_change_id = map
            .remove("max_change_id")
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or(CacheError::CacheEmpty)?;
        Ok((max_change_id, map))
    }

    async fn get_collection(&self, collection: &str) -> Result<BTreeMap<u64, String>, CacheError> {
        let flat: Vec<String> = self
            .get_collection
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .arg(format!("{collection}:*"))
            .invoke_async(&mut self.conn())
            .await?;
        let mut elements = BTreeMap::new();
        let mut iter = flat.into_iter();
        while let (Some(element_id), Some(data)) = (iter.next(), iter.next()) {
            let (_, id) = split_element_id(&element_id)?;
            elements.insert(id, data);
        }
        Ok(elements)
    }

    async fn get_one(&self, element_id: &str) -> Result<Option<String>, CacheError> {
        let data: Option<String> = self
            .get_one
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .arg(element_id)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(data)
    }

    async fn apply_changes(
        &self,
        changed: Vec<(String, String)>,
        deleted: Vec<String>,
    ) -> Result<u64, CacheError> {
        let mut invocation = self.apply_changes.prepare_invoke();
        invocation
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .arg(changed.len() * 2)
            .arg(deleted.len());
        for (element_id, data) in &changed {
            invocation.arg(element_id).arg(data);
        }
        for element_id in &deleted {
            invocation.arg(element_id);
        }
        let change_id: u64 = invocation.invoke_async(&mut self.conn()).await?;
        Ok(change_id)
    }

    async fn get_data_since(&self, change_id: u64) -> Result<DataSince, CacheError> {
        let flat: Vec<Option<String>> = self
            .get_data_since
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .arg(change_id)
            .invoke_async(&mut self.conn())
            .await?;

        let mut result = DataSince::default();
        let mut iter = flat.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let Some(element_id) = key
            else {
                continue;
            };
            if element_id == "max_change_id" {
                result.max_change_id = value
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .ok_or(CacheError::CacheEmpty)?;
                continue;
            }
            if element_id.starts_with("_config") {
                // The lowest-change-id sentinel lives in the index too.
                continue;
            }
            match value {
                Some(data) => {
                    let (collection, _) = split_element_id(&element_id)?;
                    result
                        .changed
                        .entry(collection.to_owned())
                        .or_default()
                        .push(data);
                }
                None => result.deleted.push(element_id),
            }
        }
        Ok(result)
    }

    async fn current_change_id(&self) -> Result<u64, CacheError> {
        let change_id: u64 = self
            .current_change_id
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(change_id)
    }

    async fn lowest_change_id(&self) -> Result<u64, CacheError> {
        let change_id: u64 = self
            .lowest_change_id
            .key(FULL_DATA_KEY)
            .key(CHANGE_ID_KEY)
            .key(READY_KEY)
            .arg(LOWEST_SENTINEL)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(change_id)
    }
}
