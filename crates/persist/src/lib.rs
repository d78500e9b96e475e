//! Fleet persistence (Milestone 2): the document store holding lifecycle
//! records and the key/value store holding context trees.
//!
//! Two backends: `MemStore` for tests and embedding, `SqliteStore` for the CLI.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod sqlite;

pub use sqlite::SqliteStore;

/// A stored document together with its row version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub doc: Value,
}

/// Collection/key/tag addressed JSON documents. Every successful write bumps
/// the row version, which lets callers run compare-and-swap updates.
pub trait DocStore: Send + Sync {
    /// Upsert `doc` under `(collection, key, tag)`.
    fn insert(&self, collection: &str, key: &str, tag: &str, doc: Value) -> Result<()>;
    fn find(&self, collection: &str, key: &str, tag: &str) -> Result<Vec<Value>>;
    /// Remove every tag stored under `key`. Removing a missing key is not an error.
    fn remove(&self, collection: &str, key: &str) -> Result<()>;
    fn find_versioned(&self, collection: &str, key: &str, tag: &str) -> Result<Option<Versioned>>;
    /// Write only if the current version equals `expected` (`None`: row must be
    /// absent). Returns false when another writer got there first.
    fn insert_if_version(&self, collection: &str, key: &str, tag: &str, doc: Value, expected: Option<u64>) -> Result<bool>;
}

/// Flat key/value space holding context trees. Keys are handle strings; the
/// tree structure lives entirely in key prefixes.
pub trait ContextDb: Send + Sync {
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Value>>;
    /// All keys starting with `prefix`, in lexical order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn delete_prefix(&self, prefix: &str) -> Result<()>;
    fn health_check(&self) -> Result<()> { Ok(()) }
}

type DocKey = (String, String, String);

/// In-memory implementation of both stores.
#[derive(Default)]
pub struct MemStore {
    docs: Mutex<BTreeMap<DocKey, Versioned>>,
    kv: Mutex<BTreeMap<String, Value>>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { lock(&self.kv).len() }
    pub fn is_empty(&self) -> bool { lock(&self.kv).is_empty() }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

fn doc_key(collection: &str, key: &str, tag: &str) -> DocKey { (collection.to_string(), key.to_string(), tag.to_string()) }

impl DocStore for MemStore {
    fn insert(&self, collection: &str, key: &str, tag: &str, doc: Value) -> Result<()> {
        let mut docs = lock(&self.docs);
        let k = doc_key(collection, key, tag);
        let version = docs.get(&k).map(|v| v.version + 1).unwrap_or(1);
        docs.insert(k, Versioned { version, doc });
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn find(&self, collection: &str, key: &str, tag: &str) -> Result<Vec<Value>> {
        Ok(lock(&self.docs).get(&doc_key(collection, key, tag)).map(|v| vec![v.doc.clone()]).unwrap_or_default())
    }

    fn remove(&self, collection: &str, key: &str) -> Result<()> {
        lock(&self.docs).retain(|(c, k, _), _| !(c == collection && k == key));
        Ok(())
    }

    fn find_versioned(&self, collection: &str, key: &str, tag: &str) -> Result<Option<Versioned>> {
        Ok(lock(&self.docs).get(&doc_key(collection, key, tag)).cloned())
    }

    fn insert_if_version(&self, collection: &str, key: &str, tag: &str, doc: Value, expected: Option<u64>) -> Result<bool> {
        let mut docs = lock(&self.docs);
        let k = doc_key(collection, key, tag);
        let current = docs.get(&k).map(|v| v.version);
        if current != expected {
            counter!("persist_cas_conflict_total", 1u64);
            return Ok(false);
        }
        docs.insert(k, Versioned { version: current.unwrap_or(0) + 1, doc });
        counter!("persist_put_total", 1u64);
        Ok(true)
    }
}

impl ContextDb for MemStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let started = std::time::Instant::now();
        lock(&self.kv).insert(key.to_string(), value.clone());
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> { Ok(lock(&self.kv).get(key).cloned()) }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let kv = lock(&self.kv);
        Ok(kv.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).map(|(k, _)| k.clone()).collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.kv).remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        lock(&self.kv).retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
