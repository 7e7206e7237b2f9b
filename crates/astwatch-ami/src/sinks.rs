//! Callback sinks exposed to the embedding application
//!
//! Each sink is optional. Sinks run after the engine has fully applied an
//! event, so a failing sink is logged and otherwise ignored.

use std::collections::BTreeMap;
use std::fmt;

use astwatch_core::models::{ExtenStatus, LineNotification, Notification};
use astwatch_core::WatchError;
use astwatch_engine::ExtensionStore;
use tracing::warn;

type LineSink = Box<dyn FnMut(&LineNotification) -> anyhow::Result<()> + Send>;
type TickSink = Box<dyn FnMut() -> anyhow::Result<()> + Send>;
type SnapshotSink = Box<dyn FnMut(&LineNotification, Snapshot<'_>) -> anyhow::Result<()> + Send>;

/// Shape of the table handed to the snapshot sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Every line of every extension
    #[default]
    Full,
    /// Line-0 status per extension
    Line0,
}

/// Extension table as seen by the snapshot sink
#[derive(Debug)]
pub enum Snapshot<'a> {
    Full(&'a ExtensionStore),
    Line0(BTreeMap<String, ExtenStatus>),
}

impl<'a> Snapshot<'a> {
    fn take(mode: SnapshotMode, store: &'a ExtensionStore) -> Self {
        match mode {
            SnapshotMode::Full => Snapshot::Full(store),
            SnapshotMode::Line0 => Snapshot::Line0(store.line0_statuses()),
        }
    }
}

#[derive(Default)]
pub struct Callbacks {
    state_change: Option<LineSink>,
    cdr: Option<LineSink>,
    tick: Option<TickSink>,
    snapshot: Option<(SnapshotMode, SnapshotSink)>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per line change
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: FnMut(&LineNotification) -> anyhow::Result<()> + Send + 'static,
    {
        self.state_change = Some(Box::new(f));
        self
    }

    /// Called once per finished call
    pub fn on_cdr<F>(mut self, f: F) -> Self
    where
        F: FnMut(&LineNotification) -> anyhow::Result<()> + Send + 'static,
    {
        self.cdr = Some(Box::new(f));
        self
    }

    /// Called once per loop iteration, whether or not an event arrived
    pub fn on_tick<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.tick = Some(Box::new(f));
        self
    }

    /// Called after every line change with the changed line and the table
    pub fn on_snapshot<F>(mut self, mode: SnapshotMode, f: F) -> Self
    where
        F: FnMut(&LineNotification, Snapshot<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.snapshot = Some((mode, Box::new(f)));
        self
    }

    /// Deliver the output of one engine step
    pub fn dispatch(&mut self, notifications: &[Notification], store: &ExtensionStore) {
        for notification in notifications {
            match notification {
                Notification::StateChange(record) => {
                    if let Some(sink) = self.state_change.as_mut() {
                        report("state_change", sink(record));
                    }
                    if let Some((mode, sink)) = self.snapshot.as_mut() {
                        report("snapshot", sink(record, Snapshot::take(*mode, store)));
                    }
                }
                Notification::Cdr(record) => {
                    if let Some(sink) = self.cdr.as_mut() {
                        report("cdr", sink(record));
                    }
                }
            }
        }
    }

    pub fn tick(&mut self) {
        if let Some(sink) = self.tick.as_mut() {
            report("tick", sink());
        }
    }
}

fn report(sink: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        let err = WatchError::Sink(format!("{}: {:#}", sink, e));
        warn!(error_code = err.error_code(), "{}", err);
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("state_change", &self.state_change.is_some())
            .field("cdr", &self.cdr.is_some())
            .field("tick", &self.tick.is_some())
            .field("snapshot", &self.snapshot.as_ref().map(|(mode, _)| *mode))
            .finish()
    }
}
