//! Notifications emitted by the state engine
//!
//! Every notification carries the full record of one line plus a handful of
//! optional annotations describing what just happened to it.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use super::dial::DialStatus;
use super::line::{Line, LineView};
use super::status::ExtenStatus;

/// Ad-hoc fields attached to a line notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Annotations {
    /// A forward destination was added to the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_redir: Option<String>,

    /// A forward destination started ringing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_redir: Option<String>,

    /// A forward destination went busy or started talking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talk_redir: Option<String>,

    /// A forward destination answered the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_redir: Option<String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_time_opt"
    )]
    pub call_time_to: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_call_status: Option<DialStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_call_status_txt: Option<String>,
}

impl Annotations {
    pub fn add_redir(exten: &str) -> Self {
        Self {
            add_redir: Some(exten.to_string()),
            ..Default::default()
        }
    }

    pub fn ring_redir(exten: &str) -> Self {
        Self {
            ring_redir: Some(exten.to_string()),
            ..Default::default()
        }
    }

    pub fn talk_redir(exten: &str) -> Self {
        Self {
            talk_redir: Some(exten.to_string()),
            ..Default::default()
        }
    }

    pub fn conn_redir(exten: &str) -> Self {
        Self {
            conn_redir: Some(exten.to_string()),
            ..Default::default()
        }
    }

    /// Call end at `now` with the given outcome
    pub fn ended(status: &DialStatus, now: DateTime<Utc>) -> Self {
        Self {
            call_time_to: Some(now),
            end_call_status: Some(status.clone()),
            end_call_status_txt: Some(status.phrase().to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn serialize_time_opt<S: Serializer>(
    value: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(t) => serializer.serialize_i64(t.timestamp()),
        None => serializer.serialize_none(),
    }
}

/// Status of one sibling redirect destination of a notified line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirSummary {
    pub line_num: i32,
    pub status: ExtenStatus,
}

impl Serialize for RedirSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("RedirSummary", 3)?;
        s.serialize_field("LineNum", &self.line_num)?;
        s.serialize_field("Status", &self.status)?;
        s.serialize_field("StatusTxt", &self.status.render())?;
        s.end()
    }
}

/// Snapshot of one line at the moment it changed
#[derive(Debug, Clone, PartialEq)]
pub struct LineNotification {
    pub exten: String,
    pub line_num: i32,
    pub line: Line,
    pub annotations: Annotations,
    /// Sibling redirect destinations, keyed by destination number
    pub redir: BTreeMap<String, RedirSummary>,
}

impl LineNotification {
    #[inline]
    pub fn status(&self) -> ExtenStatus {
        self.line.status
    }

    pub fn end_call_status(&self) -> Option<&DialStatus> {
        self.annotations.end_call_status.as_ref()
    }
}

impl Serialize for LineNotification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Wire<'a> {
            exten: &'a str,
            line_num: i32,
            #[serde(flatten)]
            line: LineView<'a>,
            #[serde(flatten)]
            annotations: &'a Annotations,
            #[serde(skip_serializing_if = "BTreeMap::is_empty")]
            redir: &'a BTreeMap<String, RedirSummary>,
        }

        Wire {
            exten: &self.exten,
            line_num: self.line_num,
            line: LineView::from(&self.line),
            annotations: &self.annotations,
            redir: &self.redir,
        }
        .serialize(serializer)
    }
}

/// Output of one engine step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Notification {
    /// A line changed in a way subscribers can see
    StateChange(LineNotification),
    /// A call finished; fired once per logical call
    Cdr(LineNotification),
}

impl Notification {
    pub fn record(&self) -> &LineNotification {
        match self {
            Notification::StateChange(n) | Notification::Cdr(n) => n,
        }
    }

    #[inline]
    pub fn is_cdr(&self) -> bool {
        matches!(self, Notification::Cdr(_))
    }
}
