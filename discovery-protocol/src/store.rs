use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Mutable key/value holder shared between a registrant and its owner.
///
/// Cloning gives another handle on the same map.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Lit une clé et la convertit; `None` si absente ou du mauvais type
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        serde_json::from_value(value).ok()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.inner.write().insert(key.into(), value);
        Ok(())
    }

    /// Merges every entry of `values` into the store.
    pub fn update(&self, values: Map<String, Value>) {
        self.inner.write().extend(values);
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    pub fn to_dict(&self) -> Map<String, Value> {
        self.inner.read().clone()
    }

    pub fn from_dict(&self, values: Map<String, Value>) {
        *self.inner.write() = values;
    }
}
