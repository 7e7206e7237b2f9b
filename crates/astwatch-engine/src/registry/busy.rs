//! Busy-watch shortlist
//!
//! A channel that reports busy before any dial attempt is seen never shows up
//! in dial events, so new channels are remembered here until a state change,
//! a hangup or a dial event settles them.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusyCandidate {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BusyWatch {
    pending: BTreeMap<String, BusyCandidate>,
}

impl BusyWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching an attempt; an existing entry is kept as is
    pub fn watch(&mut self, unique_id: &str, from: &str, to: &str) -> bool {
        if self.pending.contains_key(unique_id) {
            return false;
        }
        self.pending.insert(
            unique_id.to_string(),
            BusyCandidate {
                from: from.to_string(),
                to: to.to_string(),
            },
        );
        true
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.pending.contains_key(unique_id)
    }

    /// Stop watching, returning the entry if there was one
    pub fn take(&mut self, unique_id: &str) -> Option<BusyCandidate> {
        self.pending.remove(unique_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_wins() {
        let mut busy = BusyWatch::new();
        assert!(busy.watch("1.1", "100", "200"));
        assert!(!busy.watch("1.1", "100", "999"));
        assert_eq!(busy.take("1.1").map(|c| c.to), Some("200".to_string()));
        assert!(busy.take("1.1").is_none());
        assert!(busy.is_empty());
    }
}
