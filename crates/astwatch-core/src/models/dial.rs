//! Dial outcome taxonomy

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Outcome reported by a dial-attempt-end event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DialStatus {
    Answer,
    Busy,
    NoAnswer,
    Cancel,
    Congestion,
    ChanUnavail,
    DontCall,
    Torture,
    InvalidArgs,
    Voicemail,
    /// Synthetic outcome for a redirect leg closed without a dial status
    RedirEnd,
    /// Anything outside the known taxonomy, kept verbatim
    Other(String),
}

impl DialStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "ANSWER" => DialStatus::Answer,
            "BUSY" => DialStatus::Busy,
            "NOANSWER" => DialStatus::NoAnswer,
            "CANCEL" => DialStatus::Cancel,
            "CONGESTION" => DialStatus::Congestion,
            "CHANUNAVAIL" => DialStatus::ChanUnavail,
            "DONTCALL" => DialStatus::DontCall,
            "TORTURE" => DialStatus::Torture,
            "INVALIDARGS" => DialStatus::InvalidArgs,
            "VOICEMAIL" => DialStatus::Voicemail,
            "REDIREND" => DialStatus::RedirEnd,
            other => DialStatus::Other(other.to_string()),
        }
    }

    /// Wire code
    pub fn as_str(&self) -> &str {
        match self {
            DialStatus::Answer => "ANSWER",
            DialStatus::Busy => "BUSY",
            DialStatus::NoAnswer => "NOANSWER",
            DialStatus::Cancel => "CANCEL",
            DialStatus::Congestion => "CONGESTION",
            DialStatus::ChanUnavail => "CHANUNAVAIL",
            DialStatus::DontCall => "DONTCALL",
            DialStatus::Torture => "TORTURE",
            DialStatus::InvalidArgs => "INVALIDARGS",
            DialStatus::Voicemail => "VOICEMAIL",
            DialStatus::RedirEnd => "REDIREND",
            DialStatus::Other(s) => s,
        }
    }

    /// Human phrase; unknown outcomes have none
    pub fn phrase(&self) -> &'static str {
        match self {
            DialStatus::Answer => "Call answered",
            DialStatus::Busy => "Number busy",
            DialStatus::NoAnswer => "No answer",
            DialStatus::Cancel => "Call cancelled",
            DialStatus::Congestion => "Channel congested",
            DialStatus::ChanUnavail => "Channel unavailable",
            DialStatus::DontCall => "Call rejected",
            DialStatus::Torture => "Voice menu",
            DialStatus::InvalidArgs => "Invalid number",
            DialStatus::Voicemail => "Voicemail",
            DialStatus::RedirEnd => "Redirect finished",
            DialStatus::Other(_) => "",
        }
    }

    #[inline]
    pub fn is_answer(&self) -> bool {
        matches!(self, DialStatus::Answer)
    }
}

impl fmt::Display for DialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DialStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DialStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(DialStatus::parse(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known() {
        assert_eq!(DialStatus::parse("ANSWER"), DialStatus::Answer);
        assert_eq!(DialStatus::parse("CHANUNAVAIL"), DialStatus::ChanUnavail);
        assert_eq!(DialStatus::parse("REDIREND").phrase(), "Redirect finished");
    }

    #[test]
    fn test_unknown_passthrough() {
        let status = DialStatus::parse("SOMETHINGNEW");
        assert_eq!(status, DialStatus::Other("SOMETHINGNEW".to_string()));
        assert_eq!(status.as_str(), "SOMETHINGNEW");
        assert_eq!(status.phrase(), "");
        assert!(!status.is_answer());
    }

    #[test]
    fn test_serde_as_code() {
        let json = serde_json::to_string(&DialStatus::NoAnswer).unwrap();
        assert_eq!(json, "\"NOANSWER\"");
        let back: DialStatus = serde_json::from_str("\"BUSY\"").unwrap();
        assert_eq!(back, DialStatus::Busy);
    }
}
