//! Domain models for asterisk-watch
//!
//! This module contains the types shared between the state engine and the
//! manager-interface client.

pub mod dial;
pub mod event;
pub mod line;
pub mod notification;
pub mod status;

pub use dial::DialStatus;
pub use event::{AmiEvent, DialBegin, DialEnd, ExtensionStatus, Hangup, NewChannel, NewState};
pub use line::{Direction, Line, LineRef, LineView, SCRATCH_LINE};
pub use notification::{Annotations, LineNotification, Notification, RedirSummary};
pub use status::ExtenStatus;
