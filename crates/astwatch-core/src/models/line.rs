//! Per-extension line record
//!
//! An extension owns one or more numbered lines. Line `0` is the primary
//! slot, higher numbers hold concurrent calls, and [`SCRATCH_LINE`] is a
//! transient slot used only while reporting an immediate busy condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::status::ExtenStatus;

/// Line slot reserved for transient busy detection; never persists
pub const SCRATCH_LINE: i32 = -1;

/// Call direction relative to the extension owning the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// The direction as seen from the other party
    #[inline]
    pub fn reversed(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// Reference to one line of one extension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRef {
    pub exten: String,
    pub line: i32,
}

impl LineRef {
    pub fn new(exten: impl Into<String>, line: i32) -> Self {
        Self {
            exten: exten.into(),
            line,
        }
    }

    #[inline]
    pub fn is(&self, exten: &str, line: i32) -> bool {
        self.exten == exten && self.line == line
    }
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exten, self.line)
    }
}

/// State of one line of a monitored extension
///
/// Invariant: a line that is not idle always carries a `unique_id`; an idle
/// line has every transient field blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Line {
    pub from: String,

    pub to: String,

    pub direction: Option<Direction>,

    pub status: ExtenStatus,

    /// Ring start
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub call_time_from: Option<DateTime<Utc>>,

    /// Answer time; empty until answered
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub talk_time_from: Option<DateTime<Utc>>,

    pub answered_exten: Option<String>,

    /// The other monitored extension bridged into this call
    #[serde(skip)]
    pub second_side: Option<LineRef>,

    #[serde(rename = "CallerIDName")]
    pub caller_id_name: String,

    #[serde(rename = "UniqueID")]
    pub unique_id: Option<String>,
}

impl Line {
    /// A fresh idle line
    pub fn idle() -> Self {
        Self::default()
    }

    /// Blank every transient field and reset to idle
    pub fn clear(&mut self) {
        *self = Self::idle();
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.status.is_idle()
    }

    /// Whether this line currently belongs to the given call attempt
    #[inline]
    pub fn owned_by(&self, unique_id: &str) -> bool {
        self.unique_id.as_deref() == Some(unique_id)
    }

    /// Set the status; the text form is derived on serialization
    #[inline]
    pub fn set_status(&mut self, status: ExtenStatus) {
        self.status = status;
    }

    /// Start the talk clock unless it is already running
    pub fn start_talk(&mut self, now: DateTime<Utc>, answered: &str) -> bool {
        if self.talk_time_from.is_some() {
            return false;
        }
        self.talk_time_from = Some(now);
        self.answered_exten = Some(answered.to_string());
        true
    }

    pub fn second_side_exten(&self) -> Option<&str> {
        self.second_side.as_ref().map(|s| s.exten.as_str())
    }
}

/// Wire view of a line, with the derived text and the flattened second side
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineView<'a> {
    #[serde(flatten)]
    pub line: &'a Line,

    pub status_txt: String,

    pub second_side_exten: &'a str,

    pub second_side_line_num: i32,
}

impl<'a> From<&'a Line> for LineView<'a> {
    fn from(line: &'a Line) -> Self {
        Self {
            line,
            status_txt: line.status.render(),
            second_side_exten: line.second_side.as_ref().map_or("", |s| s.exten.as_str()),
            second_side_line_num: line.second_side.as_ref().map_or(0, |s| s.line),
        }
    }
}
