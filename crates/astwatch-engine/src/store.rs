//! Extension state store
//!
//! The externally visible model: monitored extension -> line number -> line.
//! An extension is "tracked" exactly when it has an entry here.

use astwatch_core::models::{ExtenStatus, Line, LineRef, LineView, SCRATCH_LINE};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionStore {
    lines: BTreeMap<String, BTreeMap<i32, Line>>,
    monitored: BTreeSet<String>,
}

impl ExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the monitored set. Returns the extensions that were dropped.
    pub fn configure(&mut self, wanted: &BTreeSet<String>) -> Vec<String> {
        let added: Vec<String> = wanted.difference(&self.monitored).cloned().collect();
        let removed: Vec<String> = self.monitored.difference(wanted).cloned().collect();

        for exten in &added {
            self.monitored.insert(exten.clone());
            self.seed(exten);
        }
        for exten in &removed {
            self.monitored.remove(exten);
            self.lines.remove(exten);
        }
        removed
    }

    /// Forget every line and reseed the monitored extensions as idle
    pub fn reset(&mut self) {
        self.lines.clear();
        let monitored: Vec<String> = self.monitored.iter().cloned().collect();
        for exten in &monitored {
            self.seed(exten);
        }
    }

    fn seed(&mut self, exten: &str) {
        self.lines.entry(exten.to_string()).or_default();
        self.idle_line(exten, 0);
    }

    #[inline]
    pub fn is_tracked(&self, exten: &str) -> bool {
        self.lines.contains_key(exten)
    }

    pub fn line(&self, exten: &str, line: i32) -> Option<&Line> {
        self.lines.get(exten).and_then(|l| l.get(&line))
    }

    pub fn line_at(&self, at: &LineRef) -> Option<&Line> {
        self.line(&at.exten, at.line)
    }

    pub fn line_mut(&mut self, exten: &str, line: i32) -> Option<&mut Line> {
        self.lines.get_mut(exten).and_then(|l| l.get_mut(&line))
    }

    pub fn line_at_mut(&mut self, at: &LineRef) -> Option<&mut Line> {
        self.line_mut(&at.exten, at.line)
    }

    pub fn lines_of(&self, exten: &str) -> Option<&BTreeMap<i32, Line>> {
        self.lines.get(exten)
    }

    /// Blank a line and reset it to idle.
    ///
    /// A missing slot on a tracked extension is created first. Except for the
    /// scratch slot, idle slots above the highest busy one are then pruned;
    /// slot 0 always stays. Untracked extensions are left alone.
    pub fn idle_line(&mut self, exten: &str, line: i32) {
        let Some(lines) = self.lines.get_mut(exten) else {
            return;
        };
        lines.entry(line).or_default().clear();

        if line == SCRATCH_LINE {
            return;
        }

        let highest_busy = lines
            .iter()
            .filter(|(_, l)| !l.is_idle())
            .map(|(&n, _)| n)
            .max();
        lines.retain(|&n, l| n == 0 || !l.is_idle() || highest_busy.map_or(false, |m| n < m));
    }

    /// Store a populated line; ignored for untracked extensions
    pub fn set_line(&mut self, exten: &str, line: i32, value: Line) -> bool {
        match self.lines.get_mut(exten) {
            Some(lines) => {
                lines.insert(line, value);
                true
            }
            None => false,
        }
    }

    /// Drop a slot outright; used for the scratch slot
    pub fn remove_line(&mut self, exten: &str, line: i32) {
        if let Some(lines) = self.lines.get_mut(exten) {
            lines.remove(&line);
        }
    }

    /// First idle slot, else the next unused one
    pub fn free_line(&self, exten: &str) -> i32 {
        self.free_line_where(exten, |_| false)
    }

    /// First slot that is idle or matches `reusable`, else the next unused one
    pub fn free_line_where<F>(&self, exten: &str, reusable: F) -> i32
    where
        F: Fn(&Line) -> bool,
    {
        let mut slot = 0;
        if let Some(lines) = self.lines.get(exten) {
            while let Some(line) = lines.get(&slot) {
                if line.is_idle() || reusable(line) {
                    break;
                }
                slot += 1;
            }
        }
        slot
    }

    /// Every `(extension, line)` currently owned by the attempt
    pub fn lines_owned_by(&self, unique_id: &str) -> Vec<LineRef> {
        self.lines
            .iter()
            .flat_map(|(exten, lines)| {
                lines
                    .iter()
                    .filter(|(_, l)| l.owned_by(unique_id))
                    .map(move |(&n, _)| LineRef::new(exten.clone(), n))
            })
            .collect()
    }

    /// Line-0 status of every extension
    pub fn line0_statuses(&self) -> BTreeMap<String, ExtenStatus> {
        self.lines
            .iter()
            .filter_map(|(exten, lines)| lines.get(&0).map(|l| (exten.clone(), l.status)))
            .collect()
    }
}

impl Serialize for ExtensionStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.lines.len()))?;
        for (exten, lines) in &self.lines {
            let views: BTreeMap<i32, LineView<'_>> =
                lines.iter().map(|(&n, l)| (n, LineView::from(l))).collect();
            map.serialize_entry(exten, &views)?;
        }
        map.end()
    }
}
