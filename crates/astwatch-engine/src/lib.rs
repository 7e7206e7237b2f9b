//! asterisk-watch state engine
//!
//! Reconstructs per-extension call state from the manager-interface event
//! stream:
//!
//! - `identity`: channel name parsing (extension, channel key)
//! - `registry`: call registry, channel table, redirect ledger, busy watch
//! - `store`: the monitored extension table seen by subscribers
//! - `engine`: the event-at-a-time processor tying them together

pub mod engine;
pub mod identity;
pub mod registry;
pub mod store;

pub use engine::CallStateEngine;
pub use store::ExtensionStore;
