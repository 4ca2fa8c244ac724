// src/pipeline/changes.rs

//! Change detection against previously published records.
//!
//! The remote store is mirrored locally as `{id: [last_modified, hash]}`. A run starts by
//! pulling only the records modified since the newest `last_modified` already known, and
//! a record whose content hash matches the mirror is not published again.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::{LocalStorage, RecordStore};

/// Fields assigned by the server; they never count as a change.
const VOLATILE_FIELDS: [&str; 2] = ["last_modified", "schema"];

/// Bytes of the SHA-256 digest kept in the cache.
const HASH_BYTES: usize = 16;

/// `[last_modified, content hash]` of one published record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry(pub u64, pub String);

impl CacheEntry {
    pub fn last_modified(&self) -> u64 {
        self.0
    }

    pub fn hash(&self) -> &str {
        &self.1
    }
}

/// Content hash of a record, ignoring server-assigned fields.
///
/// Keys are hashed in sorted order, so two equal documents hash the same whatever
/// their field order.
pub fn hash_record(record: &Value) -> String {
    let mut content = record.clone();
    if let Value::Object(map) = &mut content {
        for field in VOLATILE_FIELDS {
            map.remove(field);
        }
    }
    let digest = Sha256::digest(sorted(content).to_string().as_bytes());
    hex::encode(&digest[..HASH_BYTES])
}

/// Rebuild objects with their keys in order, at every depth.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Local mirror of what the remote store holds.
#[derive(Debug, Clone, Default)]
pub struct ChangeIndex {
    entries: HashMap<String, CacheEntry>,
}

impl ChangeIndex {
    pub fn new(entries: HashMap<String, CacheEntry>) -> Self {
        Self { entries }
    }

    /// Index a list of full remote records; records without an id are ignored.
    pub fn from_records(records: impl IntoIterator<Item = Value>) -> Self {
        let mut index = Self::default();
        index.merge(records);
        index
    }

    /// Fold remote records into the index, replacing older entries.
    pub fn merge(&mut self, records: impl IntoIterator<Item = Value>) -> usize {
        let mut merged = 0;
        for record in records {
            let Some(id) = record.get("id").and_then(Value::as_str) else {
                log::warn!("Ignoring remote record without id");
                continue;
            };
            let last_modified = record
                .get("last_modified")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.entries.insert(
                id.to_string(),
                CacheEntry(last_modified, hash_record(&record)),
            );
            merged += 1;
        }
        merged
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// Whether the store already holds exactly this content under `id`.
    pub fn is_unchanged(&self, id: &str, data: &Value) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.hash() == hash_record(data))
    }

    /// Newest `last_modified` seen, the `_since` cursor of the next fetch.
    pub fn max_last_modified(&self) -> Option<u64> {
        self.entries.values().map(CacheEntry::last_modified).max()
    }

    pub fn entries(&self) -> &HashMap<String, CacheEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache file names for one (server, bucket, collection) target.
fn cache_keys(store: &dyn RecordStore) -> (String, String) {
    let name = store.cache_name();
    (
        format!(".records-hashes-{name}.json"),
        format!(".records-{name}.json"),
    )
}

/// Load the local mirror, bring it up to date with the store, and persist it.
///
/// Without a mirror on disk, a legacy list-of-records cache is migrated (then deleted);
/// failing that, every remote record is fetched.
pub async fn fetch_existing(store: &dyn RecordStore, local: &LocalStorage) -> Result<ChangeIndex> {
    let (cache_key, legacy_key) = cache_keys(store);

    let mut migrated = false;
    let mut index = match local.read_json::<HashMap<String, CacheEntry>>(&cache_key).await? {
        Some(entries) => ChangeIndex::new(entries),
        None => match local.read_json::<Vec<Value>>(&legacy_key).await? {
            Some(records) => {
                log::info!("Migrating {} legacy cached records", records.len());
                migrated = true;
                ChangeIndex::from_records(records)
            }
            None => ChangeIndex::default(),
        },
    };

    let since = index.max_last_modified();
    let fresh = store.fetch_records(since).await?;
    let merged = index.merge(fresh);
    log::info!(
        "{} existing records, {} fetched since {:?}",
        index.len(),
        merged,
        since
    );

    local.write_json(&cache_key, index.entries()).await?;
    if migrated {
        local.remove(&legacy_key).await?;
    }
    Ok(index)
}
