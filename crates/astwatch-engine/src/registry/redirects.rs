//! Redirect ledger
//!
//! For every destination dialled on behalf of a monitored call, one row per
//! outstanding parallel attempt. Rows are keyed by destination number, then by
//! slot. All rows sharing a `main` belong to the same logical call, and a
//! destination bucket disappears as soon as its last row is removed.

use astwatch_core::models::{ExtenStatus, LineRef, RedirSummary};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirRow {
    /// Owning logical call
    pub main: LineRef,
    /// Attempt currently occupying the row
    pub unique_id: Option<String>,
    pub status: ExtenStatus,
}

impl RedirRow {
    pub fn new(main: LineRef, unique_id: Option<&str>, status: ExtenStatus) -> Self {
        Self {
            main,
            unique_id: unique_id.map(str::to_string),
            status,
        }
    }

    #[inline]
    pub fn held_by(&self, unique_id: &str) -> bool {
        self.unique_id.as_deref() == Some(unique_id)
    }
}

type Bucket = BTreeMap<i32, RedirRow>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RedirectLedger {
    by_dest: BTreeMap<String, Bucket>,
}

impl RedirectLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_dest(&self, dest: &str) -> bool {
        self.by_dest.contains_key(dest)
    }

    pub fn bucket(&self, dest: &str) -> Option<&Bucket> {
        self.by_dest.get(dest)
    }

    pub fn row(&self, dest: &str, line: i32) -> Option<&RedirRow> {
        self.by_dest.get(dest).and_then(|b| b.get(&line))
    }

    pub fn row_mut(&mut self, dest: &str, line: i32) -> Option<&mut RedirRow> {
        self.by_dest.get_mut(dest).and_then(|b| b.get_mut(&line))
    }

    pub fn insert(&mut self, dest: &str, line: i32, row: RedirRow) {
        self.by_dest
            .entry(dest.to_string())
            .or_default()
            .insert(line, row);
    }

    /// Remove one row, dropping the bucket if it empties
    pub fn remove(&mut self, dest: &str, line: i32) -> Option<RedirRow> {
        let bucket = self.by_dest.get_mut(dest)?;
        let row = bucket.remove(&line);
        if bucket.is_empty() {
            self.by_dest.remove(dest);
        }
        row
    }

    /// First slot whose row is idle, else the first unused slot
    pub fn free_slot(&self, dest: &str) -> i32 {
        self.slot_where(dest, |row| row.status.is_idle())
    }

    /// First slot whose row is idle or already held by the attempt, else the
    /// first unused slot
    pub fn free_slot_for(&self, dest: &str, unique_id: &str) -> i32 {
        self.slot_where(dest, |row| row.status.is_idle() || row.held_by(unique_id))
    }

    /// First unused slot
    pub fn next_slot(&self, dest: &str) -> i32 {
        self.slot_where(dest, |_| false)
    }

    fn slot_where<F>(&self, dest: &str, reusable: F) -> i32
    where
        F: Fn(&RedirRow) -> bool,
    {
        let mut slot = 0;
        if let Some(bucket) = self.by_dest.get(dest) {
            while let Some(row) = bucket.get(&slot) {
                if reusable(row) {
                    break;
                }
                slot += 1;
            }
        }
        slot
    }

    /// Slot of the first row for `dest` matching the predicate
    pub fn find_in<F>(&self, dest: &str, pred: F) -> Option<(i32, &RedirRow)>
    where
        F: Fn(&RedirRow) -> bool,
    {
        self.by_dest
            .get(dest)?
            .iter()
            .find(|(_, row)| pred(row))
            .map(|(&line, row)| (line, row))
    }

    /// Rows owned by a logical call
    pub fn count_for_main(&self, main: &LineRef) -> usize {
        self.rows()
            .filter(|(_, _, row)| row.main == *main)
            .count()
    }

    /// Rows owned by a logical call that hold an attempt and point somewhere
    /// other than the call's own extension
    pub fn count_foreign_for_main(&self, main: &LineRef) -> usize {
        self.rows()
            .filter(|(dest, _, row)| {
                row.main == *main && row.unique_id.is_some() && *dest != main.exten
            })
            .count()
    }

    /// Whether any row in `dest` is held by the attempt
    pub fn dest_holds(&self, dest: &str, unique_id: &str) -> bool {
        self.find_in(dest, |row| row.held_by(unique_id)).is_some()
    }

    /// Set the status of every row held by the attempt
    pub fn set_status_for_attempt(&mut self, unique_id: &str, status: ExtenStatus) {
        for bucket in self.by_dest.values_mut() {
            for row in bucket.values_mut() {
                if row.held_by(unique_id) {
                    row.status = status;
                }
            }
        }
    }

    /// Set the status of the rows in `dest` held by the attempt
    pub fn set_status_in_dest(&mut self, dest: &str, unique_id: &str, status: ExtenStatus) {
        if let Some(bucket) = self.by_dest.get_mut(dest) {
            for row in bucket.values_mut() {
                if row.held_by(unique_id) {
                    row.status = status;
                }
            }
        }
    }

    /// Remove every row owned by a logical call, returning them
    pub fn remove_for_main(&mut self, main: &LineRef) -> Vec<RedirRow> {
        let mut removed = Vec::new();
        for bucket in self.by_dest.values_mut() {
            let lines: Vec<i32> = bucket
                .iter()
                .filter(|(_, row)| row.main == *main)
                .map(|(&line, _)| line)
                .collect();
            for line in lines {
                if let Some(row) = bucket.remove(&line) {
                    removed.push(row);
                }
            }
        }
        self.by_dest.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    /// Whether any row anywhere is held by the attempt
    pub fn references_attempt(&self, unique_id: &str) -> bool {
        self.rows().any(|(_, _, row)| row.held_by(unique_id))
    }

    /// Status of every sibling destination of a logical call, skipping the
    /// numbers in `exclude`. A destination with several rows reports its
    /// highest slot.
    pub fn summaries_for(&self, main: &LineRef, exclude: &[&str]) -> BTreeMap<String, RedirSummary> {
        let mut out = BTreeMap::new();
        for (dest, line, row) in self.rows() {
            if exclude.contains(&dest) || row.main != *main {
                continue;
            }
            out.insert(
                dest.to_string(),
                RedirSummary {
                    line_num: line,
                    status: row.status,
                },
            );
        }
        out
    }

    /// Iterate `(destination, slot, row)`
    pub fn rows(&self) -> impl Iterator<Item = (&str, i32, &RedirRow)> {
        self.by_dest.iter().flat_map(|(dest, bucket)| {
            bucket
                .iter()
                .map(move |(&line, row)| (dest.as_str(), line, row))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.by_dest.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_dest.clear();
    }
}
