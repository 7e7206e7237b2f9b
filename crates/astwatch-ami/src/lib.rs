//! Asterisk manager interface (AMI) integration for asterisk-watch
//!
//! This crate owns everything that touches the socket: block framing, the
//! authenticated session with its keepalive, the callback sinks exposed to
//! the embedding application and the reconnecting watch loop that feeds the
//! state engine.
//!
//! # Architecture
//!
//! ```text
//! Asterisk manager interface
//!         |
//!         v
//!  AmiConnection (TCP, login, hint query, ping)
//!         |
//!         v
//!    AmiMessage -> AmiEvent
//!         |
//!         v
//!  CallStateEngine (astwatch-engine)
//!         |
//!         v
//!  Callbacks (state, CDR, tick, snapshot)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use astwatch_ami::{Callbacks, Watcher};
//! use astwatch_core::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let callbacks = Callbacks::new().on_state_change(|n| {
//!         println!("{}/{}: {}", n.exten, n.line_num, n.status().render());
//!         Ok(())
//!     });
//!
//!     let (watcher, _handle) = Watcher::new(config, callbacks);
//!     watcher.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod message;
pub mod sinks;

pub use client::{Watcher, WatcherHandle};
pub use connection::{AmiConnection, ReadOutcome};
pub use message::AmiMessage;
pub use sinks::{Callbacks, Snapshot, SnapshotMode};

/// AMI protocol constants
pub mod constants {
    /// Prefix of the banner line sent on connect
    pub const BANNER_PREFIX: &str = "Asterisk Call Manager";

    /// Login action
    pub const ACTION_LOGIN: &str = "Login";

    /// Keepalive action
    pub const ACTION_PING: &str = "Ping";

    /// Hint state query for one extension
    pub const ACTION_EXTENSION_STATE: &str = "ExtensionState";

    /// Successful response value
    pub const RESPONSE_SUCCESS: &str = "Success";

    /// Line terminator on the wire
    pub const LINE_END: &str = "\r\n";

    /// Longest accepted header line
    pub const MAX_LINE_LENGTH: usize = 64 * 1024;
}

/// Manager events consumed by the engine
pub mod events {
    /// Channel created
    pub const NEWCHANNEL: &str = "Newchannel";

    /// Channel hung up
    pub const HANGUP: &str = "Hangup";

    /// Channel state transition
    pub const NEWSTATE: &str = "Newstate";

    /// Hint state push
    pub const EXTENSION_STATUS: &str = "ExtensionStatus";

    /// Dial attempt, with `SubEvent: Begin` or `SubEvent: End`
    pub const DIAL: &str = "Dial";

    /// All events the engine reacts to
    pub const WATCHED_EVENTS: &[&str] = &[NEWCHANNEL, HANGUP, NEWSTATE, EXTENSION_STATUS, DIAL];
}
