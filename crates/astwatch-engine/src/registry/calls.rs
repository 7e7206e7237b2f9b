//! Call registry: call-attempt id -> owning logical call

use astwatch_core::models::LineRef;
use serde::Serialize;
use std::collections::BTreeMap;

/// What a call-attempt id belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    /// The logical call this attempt belongs to
    pub main: LineRef,
    /// Immediate destination this attempt targets
    pub exten: String,
    pub line: i32,
}

impl CallRecord {
    pub fn new(main: LineRef, exten: impl Into<String>, line: i32) -> Self {
        Self {
            main,
            exten: exten.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CallRegistry {
    records: BTreeMap<String, CallRecord>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unique_id: &str) -> Option<&CallRecord> {
        self.records.get(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.records.contains_key(unique_id)
    }

    /// Register or overwrite an attempt; empty ids are not recorded
    pub fn insert(&mut self, unique_id: &str, record: CallRecord) {
        if unique_id.is_empty() {
            return;
        }
        self.records.insert(unique_id.to_string(), record);
    }

    pub fn remove(&mut self, unique_id: &str) -> Option<CallRecord> {
        self.records.remove(unique_id)
    }

    /// Every attempt id belonging to the given logical call
    pub fn ids_for_main(&self, main: &LineRef) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, record)| record.main == *main)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
