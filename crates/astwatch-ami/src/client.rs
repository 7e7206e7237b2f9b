//! Reconnecting watch loop
//!
//! One `Watcher` owns the engine and the sinks. It runs sessions back to back:
//! connect, reset the engine, seed each monitored extension from a hint-state
//! query, feed it events until the connection drops, wait the fixed backoff
//! and start over.

use std::collections::BTreeSet;
use std::time::Duration;

use astwatch_core::{AppConfig, WatchResult};
use astwatch_engine::CallStateEngine;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::connection::{AmiConnection, ReadOutcome};
use crate::message::AmiMessage;
use crate::sinks::Callbacks;

/// `ActionID` prefix of the per-extension hint-state queries
const EXTENSION_STATE_ID_PREFIX: &str = "exten-state";

#[derive(Debug)]
enum Control {
    SetExtensions(BTreeSet<String>),
    Shutdown,
}

/// Why a session ended without a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    /// A monitored extension was removed; state is rebuilt from scratch
    Reconfigured,
}

/// Control side of a running watcher
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl WatcherHandle {
    /// Replace the monitored set. Additions take effect at once, removals
    /// force a reconnect. Returns false when the watcher is gone.
    pub fn set_extensions(&self, extensions: BTreeSet<String>) -> bool {
        self.tx.send(Control::SetExtensions(extensions)).is_ok()
    }

    /// Stop the watcher after the current step
    pub fn shutdown(&self) -> bool {
        self.tx.send(Control::Shutdown).is_ok()
    }
}

pub struct Watcher {
    config: AppConfig,
    engine: CallStateEngine,
    callbacks: Callbacks,
    control: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
}

impl Watcher {
    pub fn new(config: AppConfig, callbacks: Callbacks) -> (Self, WatcherHandle) {
        let (tx, control) = mpsc::unbounded_channel();
        let mut engine = CallStateEngine::new(config.watch.debug_level);
        engine.configure_monitored(&config.watch.extensions);

        let watcher = Self {
            config,
            engine,
            callbacks,
            control,
            control_open: true,
        };
        (watcher, WatcherHandle { tx })
    }

    pub fn engine(&self) -> &CallStateEngine {
        &self.engine
    }

    /// Watch until shut down. Transport failures never end the loop.
    pub async fn run(mut self) -> WatchResult<()> {
        let server_id = self.config.ami_addr();
        let delay = Duration::from_secs(self.config.ami.reconnect_delay_secs);
        info!(
            "📞 Watching {} extensions on {}",
            self.config.watch.extensions.len(),
            server_id
        );

        loop {
            match self.connect_and_watch().await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Watcher stopped: {}", server_id);
                    return Ok(());
                }
                Ok(SessionEnd::Reconfigured) => {
                    info!("🔧 Monitored extensions removed, resetting session: {}", server_id);
                }
                Err(e) => {
                    error!(
                        error_code = e.error_code(),
                        "AMI session error for {}: {}", server_id, e
                    );
                }
            }

            warn!("Reconnecting to {} in {} seconds...", server_id, delay.as_secs());
            if self.pause(delay).await {
                info!("Watcher stopped: {}", server_id);
                return Ok(());
            }
        }
    }

    async fn connect_and_watch(&mut self) -> WatchResult<SessionEnd> {
        let conn = AmiConnection::connect(&self.config.ami).await?;
        self.watch(conn).await
    }

    /// Run one session over an authenticated connection
    async fn watch<S>(&mut self, mut conn: AmiConnection<S>) -> WatchResult<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.engine.reset();
        self.seed_extension_states(&mut conn).await?;
        let read_timeout = Duration::from_millis(self.config.ami.read_timeout_ms);

        loop {
            tokio::select! {
                biased;

                control = self.control.recv(), if self.control_open => {
                    if let Some(end) = self.apply_control(control) {
                        return Ok(end);
                    }
                }
                outcome = conn.next_message(read_timeout) => {
                    match outcome? {
                        ReadOutcome::Message(msg) => self.handle_message(&msg),
                        ReadOutcome::Timeout => {
                            debug!("No AMI traffic from {}, sending ping", conn.peer());
                            conn.ping().await?;
                        }
                    }
                    self.callbacks.tick();
                }
            }
        }
    }

    /// Line 0 of every monitored extension starts from the PBX's own view
    async fn seed_extension_states<S>(&mut self, conn: &mut AmiConnection<S>) -> WatchResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let wait = Duration::from_millis(self.config.ami.connect_timeout_ms);
        let extensions: Vec<String> = self.config.watch.extensions.iter().cloned().collect();

        for exten in &extensions {
            let action_id = format!("{}-{}", EXTENSION_STATE_ID_PREFIX, exten);
            let status = conn.extension_state(exten, &action_id, wait).await?;
            let notifications = self.engine.apply_extension_state(exten, status, Utc::now());
            if !notifications.is_empty() {
                self.callbacks.dispatch(&notifications, self.engine.store());
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: &AmiMessage) {
        if !msg.is_event() {
            debug!("AMI response: {:?}", msg.response());
            return;
        }

        let event = msg.to_event();
        let notifications = self.engine.process(&event, Utc::now());
        if !notifications.is_empty() {
            self.callbacks.dispatch(&notifications, self.engine.store());
        }
    }

    fn apply_control(&mut self, control: Option<Control>) -> Option<SessionEnd> {
        match control {
            Some(Control::SetExtensions(extensions)) => {
                info!("🔧 Monitoring {} extensions", extensions.len());
                let removed = self.engine.configure_monitored(&extensions);
                self.config.watch.extensions = extensions;
                removed.then_some(SessionEnd::Reconfigured)
            }
            Some(Control::Shutdown) => Some(SessionEnd::Shutdown),
            None => {
                // Every handle dropped; keep watching with the current set
                self.control_open = false;
                None
            }
        }
    }

    /// Backoff between sessions. Returns true when a shutdown arrived.
    async fn pause(&mut self, delay: Duration) -> bool {
        let backoff = sleep(delay);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                biased;

                control = self.control.recv(), if self.control_open => {
                    if self.apply_control(control) == Some(SessionEnd::Shutdown) {
                        return true;
                    }
                }
                _ = &mut backoff => return false,
            }
        }
    }
}
