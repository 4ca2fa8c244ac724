// src/services/memo.rs

//! Keyed memoization shared by concurrent fetchers.
//!
//! Each key owns a [`OnceCell`]; concurrent callers asking for the same key wait on the
//! first initializer instead of issuing a second fetch. A failed initialization leaves
//! the key empty so a later call can try again.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use crate::error::Result;

/// Concurrency-safe memo map.
pub struct MemoCache<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<OnceCell<V>>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cell(&self, key: K) -> Arc<OnceCell<V>> {
        Arc::clone(self.lock().entry(key).or_default())
    }

    /// Cached value, if the key has been populated.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().get(key).is_some_and(|cell| cell.initialized())
    }

    /// Store a value, replacing any previous one.
    pub fn put(&self, key: K, value: V) {
        self.lock()
            .insert(key, Arc::new(OnceCell::new_with(Some(value))));
    }

    /// Return the cached value or run `init` exactly once for this key.
    pub async fn get_or_try_init<F, Fut>(&self, key: K, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cell = self.cell(key);
        cell.get_or_try_init(init).await.cloned()
    }

    /// Populated entries.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.lock()
            .iter()
            .filter_map(|(k, cell)| cell.get().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let mut cells = self.lock();
        for (key, value) in entries {
            cells.insert(key, Arc::new(OnceCell::new_with(Some(value))));
        }
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
