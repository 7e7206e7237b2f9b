//! Correlation registries
//!
//! Each table is a plain owned container; the engine is the only writer.

pub mod busy;
pub mod calls;
pub mod channels;
pub mod redirects;

pub use busy::{BusyCandidate, BusyWatch};
pub use calls::{CallRecord, CallRegistry};
pub use channels::ChannelTable;
pub use redirects::{RedirRow, RedirectLedger};
