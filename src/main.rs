// src/main.rs
use anyhow::Context;
use astwatch_ami::{Callbacks, Watcher};
use astwatch_core::{AppConfig, DebugLevel};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing(level: DebugLevel, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.filter_directive();
        EnvFilter::new(format!(
            "asterisk_watch={},astwatch_ami={},astwatch_engine={},astwatch_core={}",
            level, level, level, level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(config.watch.debug_level, config.watch.json_logs);

    info!(
        "Starting asterisk-watch v{} against {}",
        env!("CARGO_PKG_VERSION"),
        config.ami_addr()
    );
    if config.watch.extensions.is_empty() {
        warn!("No extensions configured; set ASTWATCH_WATCH__EXTENSIONS");
    }

    // Notifications and CDRs go to stdout as JSON lines
    let callbacks = Callbacks::new()
        .on_state_change(|n| {
            let record = serde_json::to_value(n)?;
            println!("{}", serde_json::json!({ "kind": "state_change", "record": record }));
            Ok(())
        })
        .on_cdr(|n| {
            let record = serde_json::to_value(n)?;
            println!("{}", serde_json::json!({ "kind": "cdr", "record": record }));
            Ok(())
        });

    let (watcher, handle) = Watcher::new(config, callbacks);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("📴 Shutdown requested");
            handle.shutdown();
        }
    });

    watcher.run().await?;
    Ok(())
}
