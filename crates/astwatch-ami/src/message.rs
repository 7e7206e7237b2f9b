//! AMI message blocks
//!
//! Every exchange on the manager interface is a block of `Key: Value` lines
//! closed by an empty line. Events carry an `Event` header, replies a
//! `Response` header.

use std::collections::HashMap;
use std::fmt;

use astwatch_core::models::AmiEvent;

use crate::constants::{LINE_END, RESPONSE_SUCCESS};

/// One parsed block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiMessage {
    headers: HashMap<String, String>,
}

impl AmiMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the lines of one block; lines without a colon are skipped
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.as_ref().split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    headers.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        Self { headers }
    }

    /// Parse a raw block as read from the socket
    pub fn parse(raw: &str) -> Self {
        Self::from_lines(raw.lines().take_while(|l| !l.trim().is_empty()))
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn is_event(&self) -> bool {
        self.event_name().is_some()
    }

    pub fn response(&self) -> Option<&str> {
        self.get("Response")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    pub fn is_success(&self) -> bool {
        self.response()
            .map_or(false, |r| r.eq_ignore_ascii_case(RESPONSE_SUCCESS))
    }

    /// Decode into a typed event
    pub fn to_event(&self) -> AmiEvent {
        AmiEvent::from_headers(&self.headers)
    }
}

/// Serialize an action block
pub fn encode_action(action: &str, fields: &[(&str, &str)]) -> String {
    let mut out = format!("Action: {}{}", action, LINE_END);
    for (key, value) in fields {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str(LINE_END);
    }
    out.push_str(LINE_END);
    out
}

impl fmt::Display for AmiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.headers.keys().collect();
        keys.sort();
        for key in keys {
            write!(f, "{}: {}{}", key, self.headers[key], LINE_END)?;
        }
        write!(f, "{}", LINE_END)
    }
}
