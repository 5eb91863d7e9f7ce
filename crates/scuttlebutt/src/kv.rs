//! Last-writer-wins key/value model

use crate::engine::Scuttlebutt;
use crate::model::Model;
use scuttlebutt_core::clock::sort_history;
use scuttlebutt_core::types::ensure_legal_key;
use scuttlebutt_core::{Update, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key/value payload, `[key, value]` on the wire. A null value is a delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry(pub String, pub Value);

/// Key/value store keeping the winning update per key.
///
/// The update with the larger timestamp wins; on a tie the later arrival
/// wins. Only winning updates are retained for history.
#[derive(Debug, Default)]
pub struct KvStore {
    store: BTreeMap<String, Update<Entry>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value; `None` for absent and reserved keys
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.store.get(key).map(|update| &update.payload.1)
    }

    /// Winning update for a key
    pub fn entry(&self, key: &str) -> Option<&Update<Entry>> {
        self.store.get(key)
    }

    /// Keys with a retained update, including deleted ones
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.store.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Snapshot as a JSON object, omitting deleted keys
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .store
            .iter()
            .filter(|(_, update)| !update.payload.1.is_null())
            .map(|(key, update)| (key.clone(), update.payload.1.clone()))
            .collect();
        Value::Object(map)
    }
}

impl Model for KvStore {
    type Payload = Entry;

    fn apply_update(&mut self, update: &Update<Entry>) -> bool {
        let key = &update.payload.0;
        if ensure_legal_key(key).is_err() {
            return false;
        }
        if let Some(current) = self.store.get(key) {
            if current.timestamp > update.timestamp {
                return false;
            }
        }
        self.store.insert(key.clone(), update.clone());
        true
    }

    fn history(&self, peer: &VectorClock) -> Vec<Update<Entry>> {
        let mut history: Vec<_> = self
            .store
            .values()
            .filter(|update| peer.is_behind(update))
            .cloned()
            .collect();
        sort_history(&mut history);
        history
    }
}

impl Scuttlebutt<KvStore> {
    /// Set a key. Returns whether the store changed.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> scuttlebutt_core::Result<bool> {
        let key = key.into();
        ensure_legal_key(&key)?;
        Ok(self.local_update(Entry(key, value.into())))
    }

    /// Delete a key by writing null
    pub fn delete(&self, key: impl Into<String>) -> scuttlebutt_core::Result<bool> {
        self.set(key, Value::Null)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read(|kv| kv.get(key).filter(|value| !value.is_null()).cloned())
    }

    pub fn keys(&self) -> Vec<String> {
        self.read(|kv| kv.keys().map(str::to_string).collect())
    }

    pub fn to_json(&self) -> Value {
        self.read(KvStore::to_json)
    }
}
