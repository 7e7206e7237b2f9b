//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables, `.env` files and config files.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub ami: AmiConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Manager interface connection settings
#[derive(Debug, Deserialize, Clone)]
pub struct AmiConfig {
    /// PBX host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Manager interface port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Manager user name
    #[serde(default)]
    pub username: String,

    /// Manager secret
    #[serde(default)]
    pub secret: String,

    /// Event classes requested at login
    #[serde(default = "default_events")]
    pub events: String,

    /// Read timeout before a keepalive ping is sent, in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5038
}

fn default_events() -> String {
    "call".to_string()
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_reconnect_delay() -> u64 {
    1
}

/// What to watch and how loudly to report it
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WatchConfig {
    /// Monitored extensions; accepts a list or a comma-separated string
    #[serde(default, deserialize_with = "deserialize_extensions")]
    pub extensions: BTreeSet<String>,

    #[serde(default)]
    pub debug_level: DebugLevel,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

/// Engine diagnostic verbosity
///
/// Levels are cumulative: `Debug` includes everything `Info` logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    /// Nothing beyond warnings
    #[default]
    None,
    /// Notifications and CDRs
    Info,
    /// Plus registry dumps after every state-changing step
    Debug,
    /// Plus per-branch markers
    Trace,
}

impl DebugLevel {
    /// Whether messages at `level` should be emitted under this setting
    #[inline]
    pub fn allows(self, level: DebugLevel) -> bool {
        level != DebugLevel::None && level <= self
    }

    /// Default tracing filter directive for this level
    pub fn filter_directive(self) -> &'static str {
        match self {
            DebugLevel::None => "warn",
            DebugLevel::Info => "info",
            DebugLevel::Debug => "debug",
            DebugLevel::Trace => "trace",
        }
    }
}

impl FromStr for DebugLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(DebugLevel::None),
            "info" | "1" => Ok(DebugLevel::Info),
            "debug" | "2" => Ok(DebugLevel::Debug),
            "trace" | "3" => Ok(DebugLevel::Trace),
            other => Err(format!("unknown debug level '{}'", other)),
        }
    }
}

impl<'de> Deserialize<'de> for DebugLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        TextOrNumber::deserialize(deserializer)?
            .into_string()
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DebugLevel::None => "none",
            DebugLevel::Info => "info",
            DebugLevel::Debug => "debug",
            DebugLevel::Trace => "trace",
        };
        write!(f, "{}", name)
    }
}

// Environment parsing turns a lone "100" into an integer, so numbers are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Number(u64),
    Text(String),
}

impl TextOrNumber {
    fn into_string(self) -> String {
        match self {
            TextOrNumber::Number(n) => n.to_string(),
            TextOrNumber::Text(s) => s,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExtensionList {
    List(Vec<TextOrNumber>),
    Single(TextOrNumber),
}

fn deserialize_extensions<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = match ExtensionList::deserialize(deserializer)? {
        ExtensionList::List(items) => items.into_iter().map(TextOrNumber::into_string).collect(),
        ExtensionList::Single(item) => item
            .into_string()
            .split(',')
            .map(str::to_string)
            .collect(),
    };

    Ok(raw
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect())
}

impl AppConfig {
    /// Load configuration from `.env`, environment and optional config files
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env file is fine
        dotenvy::dotenv().ok();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("ami.host", "127.0.0.1")?
            .set_default("ami.port", 5038)?
            .set_default("ami.username", "")?
            .set_default("ami.secret", "")?
            .set_default("ami.events", "call")?
            .set_default("ami.read_timeout_ms", 1000)?
            .set_default("ami.connect_timeout_ms", 3000)?
            .set_default("ami.reconnect_delay_secs", 1)?
            .set_default("watch.debug_level", "none")?
            .set_default("watch.json_logs", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with ASTWATCH_ prefix
            .add_source(
                Environment::with_prefix("ASTWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        tracing::debug!(
            run_mode = %run_mode,
            extensions = app.watch.extensions.len(),
            "Configuration loaded"
        );
        Ok(app)
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("ASTWATCH").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Manager interface address as `host:port`
    pub fn ami_addr(&self) -> String {
        format!("{}:{}", self.ami.host, self.ami.port)
    }
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            secret: String::new(),
            events: default_events(),
            read_timeout_ms: default_read_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(src: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(src, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_ami_config() {
        let config = AmiConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5038);
        assert_eq!(config.events, "call");
        assert_eq!(config.read_timeout_ms, 1000);
    }

    #[test]
    fn test_extensions_as_list() {
        let config = from_toml(
            r#"
            [ami]
            username = "watch"
            [watch]
            extensions = ["100", "200", " 300 "]
            "#,
        );
        let expected: BTreeSet<String> =
            ["100", "200", "300"].iter().map(|s| s.to_string()).collect();
        assert_eq!(config.watch.extensions, expected);
        assert_eq!(config.ami.port, 5038);
    }

    #[test]
    fn test_extensions_as_csv() {
        let config = from_toml(
            r#"
            [ami]
            host = "pbx.local"
            [watch]
            extensions = "100,200,,300"
            debug_level = "trace"
            "#,
        );
        assert_eq!(config.watch.extensions.len(), 3);
        assert_eq!(config.watch.debug_level, DebugLevel::Trace);
        assert_eq!(config.ami_addr(), "pbx.local:5038");
    }

    #[test]
    fn test_debug_level_ordering() {
        assert!(DebugLevel::Debug.allows(DebugLevel::Info));
        assert!(DebugLevel::Trace.allows(DebugLevel::Debug));
        assert!(!DebugLevel::Info.allows(DebugLevel::Debug));
        assert!(!DebugLevel::None.allows(DebugLevel::Info));
        assert!(!DebugLevel::Trace.allows(DebugLevel::None));
    }

    #[test]
    fn test_debug_level_parse() {
        assert_eq!("2".parse::<DebugLevel>().unwrap(), DebugLevel::Debug);
        assert_eq!("INFO".parse::<DebugLevel>().unwrap(), DebugLevel::Info);
        assert!("loud".parse::<DebugLevel>().is_err());
    }
}
