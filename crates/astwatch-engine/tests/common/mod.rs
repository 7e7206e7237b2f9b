//! Manager-interface event simulator for engine tests
//!
//! Builds raw header blocks the way the PBX sends them and decodes them
//! through the same path the live client uses.

#![allow(dead_code)]

use astwatch_core::models::{AmiEvent, Notification};
use astwatch_core::DebugLevel;
use astwatch_engine::CallStateEngine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;

/// Event builder producing decoded events
pub struct AmiEventBuilder {
    headers: HashMap<String, String>,
}

impl AmiEventBuilder {
    pub fn new(event: &str) -> Self {
        Self {
            headers: HashMap::new(),
        }
        .header("Event", event)
    }

    /// Set a header value
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn unique_id(self, uid: &str) -> Self {
        self.header("Uniqueid", uid)
    }

    pub fn channel(self, channel: &str) -> Self {
        self.header("Channel", channel)
    }

    pub fn caller(self, number: &str) -> Self {
        self.header("CallerIDNum", number)
    }

    pub fn connected(self, number: &str) -> Self {
        self.header("ConnectedLineNum", number)
    }

    pub fn build(self) -> AmiEvent {
        AmiEvent::from_headers(&self.headers)
    }

    pub fn new_channel(uid: &str, from: &str, exten: &str) -> AmiEvent {
        Self::new("Newchannel")
            .unique_id(uid)
            .caller(from)
            .header("Exten", exten)
            .build()
    }

    pub fn hangup(uid: &str) -> AmiEvent {
        Self::new("Hangup").unique_id(uid).build()
    }

    pub fn new_state(uid: &str, channel: &str, state: i64) -> AmiEvent {
        Self::new("Newstate")
            .unique_id(uid)
            .channel(channel)
            .header("ChannelState", &state.to_string())
            .build()
    }

    pub fn extension_status(exten: &str, status: i32) -> AmiEvent {
        Self::new("ExtensionStatus")
            .header("Exten", exten)
            .header("Status", &status.to_string())
            .build()
    }

    pub fn dial_begin(
        uid: &str,
        dest_uid: &str,
        channel: &str,
        destination: &str,
        from: &str,
    ) -> AmiEvent {
        Self::new("Dial")
            .header("SubEvent", "Begin")
            .unique_id(uid)
            .header("DestUniqueID", dest_uid)
            .channel(channel)
            .header("Destination", destination)
            .caller(from)
            .build()
    }

    pub fn dial_end(uid: &str, channel: &str, status: &str) -> AmiEvent {
        Self::new("Dial")
            .header("SubEvent", "End")
            .unique_id(uid)
            .channel(channel)
            .header("DialStatus", status)
            .build()
    }
}

/// Engine plus a deterministic clock, one second per event
pub struct Harness {
    pub engine: CallStateEngine,
    clock: DateTime<Utc>,
}

impl Harness {
    pub fn new(extensions: &[&str]) -> Self {
        Self {
            engine: CallStateEngine::with_extensions(DebugLevel::None, extensions.iter().copied()),
            clock: Utc
                .with_ymd_and_hms(2024, 1, 15, 9, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock
    }

    pub fn feed(&mut self, event: AmiEvent) -> Vec<Notification> {
        self.clock = self.clock + Duration::seconds(1);
        self.engine.process(&event, self.clock)
    }
}

pub fn state_changes(out: &[Notification]) -> Vec<&Notification> {
    out.iter().filter(|n| !n.is_cdr()).collect()
}

pub fn cdrs(out: &[Notification]) -> Vec<&Notification> {
    out.iter().filter(|n| n.is_cdr()).collect()
}
