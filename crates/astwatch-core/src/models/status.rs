//! Extension status bitmask
//!
//! Bits 0..=4 carry the base status (idle, in use, busy, unavailable,
//! ringing, on hold). Bits 5..=7 are redirect qualifiers, each paired with one
//! base value, layered on top when the state was reached through a
//! forwarded or parallel destination.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Combined extension status as reported to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtenStatus(i32);

/// Base status values map one-to-one onto the channel state indexes 0..=10.
const CHANNEL_STATE_TABLE: [i32; 11] = [0, 0, 4, 8, 8, 8, 1, 2, 8, 0, -1];

impl ExtenStatus {
    /// Extension unknown to the PBX
    pub const NAN: ExtenStatus = ExtenStatus(-1);
    pub const IDLE: ExtenStatus = ExtenStatus(0);
    pub const IN_USE: ExtenStatus = ExtenStatus(1);
    pub const BUSY: ExtenStatus = ExtenStatus(2);
    pub const UNAVAILABLE: ExtenStatus = ExtenStatus(4);
    pub const RINGING: ExtenStatus = ExtenStatus(8);
    pub const ON_HOLD: ExtenStatus = ExtenStatus(16);
    pub const IN_USE_REDIR: ExtenStatus = ExtenStatus(32);
    pub const RINGING_REDIR: ExtenStatus = ExtenStatus(64);
    pub const BUSY_REDIR: ExtenStatus = ExtenStatus(128);

    /// Isolates the base status bits
    pub const MASK_STD: i32 = 31;

    /// Isolates the redirect qualifier bits
    pub const MASK_REDIR: i32 = 255 ^ Self::MASK_STD;

    #[inline]
    pub const fn from_bits(bits: i32) -> Self {
        ExtenStatus(bits)
    }

    #[inline]
    pub const fn bits(self) -> i32 {
        self.0
    }

    /// Decode a channel state index; anything outside the table is not-found
    pub fn from_channel_state(state: i64) -> Self {
        usize::try_from(state)
            .ok()
            .and_then(|idx| CHANNEL_STATE_TABLE.get(idx))
            .map(|&bits| ExtenStatus(bits))
            .unwrap_or(Self::NAN)
    }

    #[inline]
    pub fn is_nan(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_idle(self) -> bool {
        self.0 == 0
    }

    /// The base part (bits 0..=4); not-found stays not-found
    #[inline]
    pub fn base(self) -> ExtenStatus {
        if self.is_nan() {
            self
        } else {
            ExtenStatus(self.0 & Self::MASK_STD)
        }
    }

    /// The redirect qualifier bits alone
    #[inline]
    pub fn qualifiers(self) -> i32 {
        if self.is_nan() {
            0
        } else {
            self.0 & Self::MASK_REDIR
        }
    }

    /// True when the base part equals `base`
    #[inline]
    pub fn has_base(self, base: ExtenStatus) -> bool {
        self.base() == base
    }

    /// The redirect bit paired with a base value, if it has one
    pub fn paired_redirect(base: ExtenStatus) -> Option<ExtenStatus> {
        match base {
            Self::IN_USE => Some(Self::IN_USE_REDIR),
            Self::BUSY => Some(Self::BUSY_REDIR),
            Self::RINGING => Some(Self::RINGING_REDIR),
            _ => None,
        }
    }

    /// Merge a freshly observed base status into this combined status.
    ///
    /// Idle resets everything. Otherwise the new base replaces the old one and
    /// the qualifier bits already present are carried over, so a status that
    /// holds a base together with its paired redirect bit keeps both when the
    /// same base is confirmed again.
    pub fn compose(self, new_base: ExtenStatus) -> ExtenStatus {
        if new_base.is_idle() || new_base.is_nan() {
            return new_base;
        }

        if let Some(pair) = Self::paired_redirect(new_base) {
            if self.has_base(new_base) && self.0 & pair.0 != 0 {
                return self;
            }
        }

        ExtenStatus(new_base.base().0 | self.qualifiers())
    }

    /// Tag a bare in-use, busy or ringing status with its redirect bit.
    ///
    /// Any other value, including one that already carries qualifiers, is
    /// returned unchanged.
    pub fn with_redirect_qualifier(self) -> ExtenStatus {
        match Self::paired_redirect(self) {
            Some(pair) => ExtenStatus(self.0 | pair.0),
            None => self,
        }
    }

    /// Human-readable status text
    pub fn render(self) -> String {
        if self.is_nan() {
            return phrase(Self::NAN.0).to_string();
        }
        if self.is_idle() {
            return phrase(Self::IDLE.0).to_string();
        }

        // Qualifier bits take precedence over the base bits they decorate
        let bits = if self.qualifiers() != 0 {
            self.qualifiers()
        } else {
            self.0
        };

        (0..8)
            .map(|shift| 1 << shift)
            .filter(|bit| bits & bit != 0)
            .map(phrase)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn phrase(bit: i32) -> &'static str {
    match bit {
        -1 => "Unknown",
        0 => "Idle",
        1 => "In use",
        2 => "Busy",
        4 => "Unavailable",
        8 => "Ringing",
        16 => "On hold",
        32 => "In use (redirect)",
        64 => "Ringing (redirect)",
        128 => "Busy (redirect)",
        _ => "",
    }
}

impl Default for ExtenStatus {
    fn default() -> Self {
        Self::IDLE
    }
}

impl fmt::Display for ExtenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<i32> for ExtenStatus {
    fn from(bits: i32) -> Self {
        ExtenStatus(bits)
    }
}
