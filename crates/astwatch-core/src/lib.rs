//! asterisk-watch core library
//!
//! Foundational types shared by the engine and the manager-interface client:
//!
//! - Extension status bitmask and its codec (`models::status`)
//! - Per-extension line records and outgoing notifications
//! - Typed manager-interface events
//! - Unified error handling
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;

pub use config::{AppConfig, DebugLevel};
pub use error::WatchError;
pub use models::{AmiEvent, DialStatus, ExtenStatus, Line, LineRef, Notification};

/// Result type alias using WatchError
pub type WatchResult<T> = Result<T, WatchError>;
