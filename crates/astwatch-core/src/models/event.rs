//! Typed manager-interface events
//!
//! The wire delivers flat `Key: Value` blocks. Only the handful of event kinds
//! the state engine reacts to are decoded; everything else, including blocks
//! missing a field the engine needs, becomes [`AmiEvent::Ignored`].

use std::collections::HashMap;

use super::dial::DialStatus;

/// Channel created; opens a busy-watch candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub unique_id: String,
    pub caller_id_num: String,
    pub exten: String,
}

/// Channel hung up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hangup {
    pub unique_id: String,
}

/// Channel state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewState {
    pub unique_id: String,
    pub channel: String,
    /// Raw channel state index; unparsable values are `-1`
    pub channel_state: i64,
    pub caller_id_name: String,
    pub connected_line_num: Option<String>,
}

/// Explicit extension state push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionStatus {
    pub exten: String,
    pub status: i32,
    pub unique_id: Option<String>,
    pub connected_line_num: Option<String>,
}

/// Dial attempt started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialBegin {
    pub unique_id: String,
    pub dest_unique_id: String,
    pub channel: String,
    pub destination: String,
    pub dialstring: String,
    pub caller_id_num: String,
    pub caller_id_name: String,
}

/// Dial attempt finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialEnd {
    pub unique_id: String,
    pub channel: String,
    pub dial_status: DialStatus,
    pub connected_line_num: Option<String>,
}

/// One decoded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiEvent {
    NewChannel(NewChannel),
    Hangup(Hangup),
    NewState(NewState),
    ExtensionStatus(ExtensionStatus),
    DialBegin(DialBegin),
    DialEnd(DialEnd),
    /// Unknown kind or malformed block; carries the event name when present
    Ignored(String),
}

impl AmiEvent {
    /// Decode a flat header map
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let get = |key: &str| headers.get(key).map(|v| v.as_str());
        let name = get("Event").unwrap_or_default();

        Self::decode(name, &get).unwrap_or_else(|| AmiEvent::Ignored(name.to_string()))
    }

    fn decode<'a, F>(name: &str, get: &F) -> Option<Self>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let unique_id = || {
            get("Uniqueid")
                .or_else(|| get("UniqueID"))
                .map(str::to_string)
        };
        let text = |key: &str| get(key).unwrap_or_default().to_string();
        let opt = |key: &str| get(key).map(str::to_string);

        let event = match name {
            "Newchannel" => AmiEvent::NewChannel(NewChannel {
                unique_id: unique_id()?,
                caller_id_num: text("CallerIDNum"),
                exten: text("Exten"),
            }),
            "Hangup" => AmiEvent::Hangup(Hangup {
                unique_id: unique_id()?,
            }),
            "Newstate" => AmiEvent::NewState(NewState {
                unique_id: unique_id()?,
                channel: get("Channel")?.to_string(),
                channel_state: get("ChannelState")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(-1),
                caller_id_name: text("CallerIDName"),
                connected_line_num: opt("ConnectedLineNum"),
            }),
            "ExtensionStatus" => AmiEvent::ExtensionStatus(ExtensionStatus {
                exten: get("Exten")?.to_string(),
                status: get("Status")?.trim().parse().ok()?,
                unique_id: unique_id(),
                connected_line_num: opt("ConnectedLineNum"),
            }),
            "Dial" => match get("SubEvent")? {
                "Begin" => AmiEvent::DialBegin(DialBegin {
                    unique_id: unique_id()?,
                    dest_unique_id: text("DestUniqueID"),
                    channel: text("Channel"),
                    destination: get("Destination")?.to_string(),
                    dialstring: text("Dialstring"),
                    caller_id_num: text("CallerIDNum"),
                    caller_id_name: text("CallerIDName"),
                }),
                "End" => AmiEvent::DialEnd(DialEnd {
                    unique_id: unique_id()?,
                    channel: text("Channel"),
                    dial_status: DialStatus::parse(get("DialStatus").unwrap_or_default()),
                    connected_line_num: opt("ConnectedLineNum"),
                }),
                _ => return None,
            },
            _ => return None,
        };

        Some(event)
    }

    /// Wire name of the event kind
    pub fn name(&self) -> &str {
        match self {
            AmiEvent::NewChannel(_) => "Newchannel",
            AmiEvent::Hangup(_) => "Hangup",
            AmiEvent::NewState(_) => "Newstate",
            AmiEvent::ExtensionStatus(_) => "ExtensionStatus",
            AmiEvent::DialBegin(_) | AmiEvent::DialEnd(_) => "Dial",
            AmiEvent::Ignored(name) => name,
        }
    }

    /// The call-attempt id a dial event refers to
    pub fn dial_unique_id(&self) -> Option<&str> {
        match self {
            AmiEvent::DialBegin(e) => Some(&e.unique_id),
            AmiEvent::DialEnd(e) => Some(&e.unique_id),
            _ => None,
        }
    }
}
