//! Channel correlation table: channel key -> call-attempt id

use serde::Serialize;
use std::collections::BTreeMap;

/// At most one attempt id per channel key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChannelTable {
    by_key: BTreeMap<String, String>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// Attempt id bound to an optional key
    pub fn lookup(&self, key: Option<&str>) -> Option<&str> {
        key.and_then(|k| self.get(k))
    }

    pub fn contains(&self, key: Option<&str>) -> bool {
        self.lookup(key).is_some()
    }

    /// Bind a key, replacing whatever attempt held it
    pub fn bind(&mut self, key: Option<&str>, unique_id: &str) {
        if let Some(key) = key {
            self.by_key.insert(key.to_string(), unique_id.to_string());
        }
    }

    /// Drop every key held by the attempt
    pub fn release_attempt(&mut self, unique_id: &str) {
        self.by_key.retain(|_, uid| uid != unique_id);
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
    }
}
