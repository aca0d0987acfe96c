//! Keyed pools of per-connection records.
//!
//! One pool maps fid numbers to fid records, another maps tags to in-flight
//! requests. Insertion detects duplicate keys so that the dispatcher can
//! refuse a fid or tag that is already in use.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub(crate) struct Pool<K, V> {
    records: Mutex<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash + Copy, V> Pool<K, V> {
    pub fn new() -> Pool<K, V> {
        Pool {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a fresh record, or return None when the key is already in use.
    pub fn add(&self, key: K, record: Arc<V>) -> Option<Arc<V>> {
        match self.records.lock().unwrap().entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(e) => {
                e.insert(record.clone());
                Some(record)
            }
        }
    }

    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.records.lock().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Empty the pool, handing the surviving records to the caller so their
    /// destroy hooks can run.
    pub fn drain(&self) -> Vec<Arc<V>> {
        self.records.lock().unwrap().drain().map(|(_, v)| v).collect()
    }
}
