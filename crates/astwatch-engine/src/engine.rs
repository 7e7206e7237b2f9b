//! Call state engine
//!
//! Consumes one decoded manager event at a time and keeps the extension
//! store, call registry, channel table, redirect ledger and busy watch in
//! step. Every step returns the notifications it produced; nothing in here
//! performs I/O, so a step can be driven straight from a test.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use astwatch_core::models::{
    AmiEvent, Annotations, DialBegin, DialEnd, DialStatus, Direction, ExtenStatus,
    ExtensionStatus, Hangup, Line, LineNotification, LineRef, NewChannel, NewState,
    Notification, SCRATCH_LINE,
};
use astwatch_core::DebugLevel;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use crate::identity::{extract_channel_key, extract_extension, extract_peer, is_numeric};
use crate::registry::{
    BusyCandidate, BusyWatch, CallRecord, CallRegistry, ChannelTable, RedirRow, RedirectLedger,
};
use crate::store::ExtensionStore;

/// Owns every registry and applies events to them
#[derive(Debug, Clone)]
pub struct CallStateEngine {
    debug_level: DebugLevel,
    store: ExtensionStore,
    calls: CallRegistry,
    channels: ChannelTable,
    redirects: RedirectLedger,
    busy: BusyWatch,
    outbox: Vec<Notification>,
    now: DateTime<Utc>,
}

/// What a dial-begin event resolved to before any registry is touched
struct DialTarget {
    to: String,
    from: String,
    chan_exten: Option<String>,
    chan_key: Option<String>,
    dest_key: Option<String>,
    anchor: Option<String>,
    direction: Direction,
    second_side: Option<String>,
    main: Option<LineRef>,
    line_num: i32,
}

/// How a call end reaches the second side of the main line
#[derive(Debug, Clone, Copy)]
enum SideEnd {
    /// Always notified; re-idled only when already idle
    Notify,
    /// Notified and idled when its redirect row still exists
    WithRow,
    /// Notified and idled when still busy
    WhenBusy,
}

impl Default for CallStateEngine {
    fn default() -> Self {
        Self::new(DebugLevel::None)
    }
}

impl CallStateEngine {
    pub fn new(debug_level: DebugLevel) -> Self {
        Self {
            debug_level,
            store: ExtensionStore::new(),
            calls: CallRegistry::new(),
            channels: ChannelTable::new(),
            redirects: RedirectLedger::new(),
            busy: BusyWatch::new(),
            outbox: Vec::new(),
            now: Utc::now(),
        }
    }

    /// Engine with an initial monitored set already seeded
    pub fn with_extensions<I, S>(debug_level: DebugLevel, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut engine = Self::new(debug_level);
        let wanted: BTreeSet<String> = extensions.into_iter().map(Into::into).collect();
        engine.configure_monitored(&wanted);
        engine
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.debug_level = level;
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.debug_level
    }

    /// Reconcile the monitored extensions.
    ///
    /// Additions are seeded idle straight away. Returns `true` when an
    /// extension was dropped, in which case the session must be restarted.
    pub fn configure_monitored(&mut self, wanted: &BTreeSet<String>) -> bool {
        let removed = self.store.configure(wanted);
        if !removed.is_empty() {
            info!("🔧 Extensions removed from watch: {}", removed.join(","));
        }
        !removed.is_empty()
    }

    /// Forget every call; monitored extensions are reseeded as idle line 0
    pub fn reset(&mut self) {
        self.calls.clear();
        self.channels.clear();
        self.redirects.clear();
        self.busy.clear();
        self.outbox.clear();
        self.store.reset();
    }

    /// Seed line 0 of a monitored extension from a hint-state query reply
    pub fn apply_extension_state(
        &mut self,
        exten: &str,
        status: ExtenStatus,
        now: DateTime<Utc>,
    ) -> Vec<Notification> {
        self.now = now;
        match self.store.line_mut(exten, 0) {
            Some(line) => line.set_status(status),
            None => return Vec::new(),
        }
        self.notify(exten, 0, Annotations::default());
        mem::take(&mut self.outbox)
    }

    pub fn store(&self) -> &ExtensionStore {
        &self.store
    }

    pub fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn redirects(&self) -> &RedirectLedger {
        &self.redirects
    }

    pub fn busy(&self) -> &BusyWatch {
        &self.busy
    }

    /// Apply one event and return the notifications it produced, in order
    pub fn process(&mut self, event: &AmiEvent, now: DateTime<Utc>) -> Vec<Notification> {
        self.now = now;

        match event {
            AmiEvent::NewChannel(ev) => self.on_new_channel(ev),
            AmiEvent::Hangup(ev) => self.on_hangup(ev),
            AmiEvent::NewState(ev) => self.on_new_state(ev),
            AmiEvent::ExtensionStatus(ev) => self.on_extension_status(ev),
            AmiEvent::DialBegin(ev) => {
                self.busy.take(&ev.unique_id);
                self.on_dial_begin(ev);
            }
            AmiEvent::DialEnd(ev) => {
                self.busy.take(&ev.unique_id);
                self.on_dial_end(ev);
            }
            AmiEvent::Ignored(name) => self.mark(|| format!("ignored event {}", name)),
        }

        if !self.outbox.is_empty() && self.debug_level.allows(DebugLevel::Debug) {
            self.dump_state(event.name());
        }

        mem::take(&mut self.outbox)
    }

    // ---------------------------------------------------------------------
    // Busy watch
    // ---------------------------------------------------------------------

    fn on_new_channel(&mut self, ev: &NewChannel) {
        if ev.unique_id.is_empty() || ev.caller_id_num.is_empty() || ev.exten.is_empty() {
            return;
        }
        if self.busy.watch(&ev.unique_id, &ev.caller_id_num, &ev.exten) {
            self.mark(|| format!("busy watch {} {} -> {}", ev.unique_id, ev.caller_id_num, ev.exten));
        }
    }

    fn on_hangup(&mut self, ev: &Hangup) {
        if self.busy.take(&ev.unique_id).is_some() {
            self.mark(|| format!("busy watch dropped {}", ev.unique_id));
        }
    }

    /// Report a busy that no dial attempt will ever describe, through the
    /// scratch slot of each tracked side
    fn report_busy(&mut self, ev: &NewState, candidate: BusyCandidate) {
        let from_tracked = self.store.is_tracked(&candidate.from);
        let to_tracked = self.store.is_tracked(&candidate.to);
        let ended = Annotations::ended(&DialStatus::Busy, self.now);

        info!("📵 Busy: {} -> {} ({})", candidate.from, candidate.to, ev.unique_id);

        if from_tracked {
            let line = Line {
                from: candidate.from.clone(),
                to: candidate.to.clone(),
                direction: Some(Direction::Out),
                status: ExtenStatus::BUSY,
                call_time_from: Some(self.now),
                second_side: to_tracked.then(|| LineRef::new(candidate.to.clone(), 0)),
                caller_id_name: ev.caller_id_name.clone(),
                unique_id: Some(ev.unique_id.clone()),
                ..Line::idle()
            };
            self.store.set_line(&candidate.from, SCRATCH_LINE, line);
            self.notify(&candidate.from, SCRATCH_LINE, ended.clone());
            self.save_cdr(&candidate.from, SCRATCH_LINE, ended.clone());
            self.store.remove_line(&candidate.from, SCRATCH_LINE);
        }

        if to_tracked {
            let line = Line {
                from: candidate.from.clone(),
                to: candidate.to.clone(),
                direction: Some(Direction::In),
                status: ExtenStatus::BUSY,
                call_time_from: Some(self.now),
                second_side: from_tracked.then(|| LineRef::new(candidate.from.clone(), 0)),
                caller_id_name: ev.caller_id_name.clone(),
                unique_id: Some(ev.unique_id.clone()),
                ..Line::idle()
            };
            self.store.set_line(&candidate.to, SCRATCH_LINE, line);
            self.notify(&candidate.to, SCRATCH_LINE, ended.clone());
            if !from_tracked {
                self.save_cdr(&candidate.to, SCRATCH_LINE, ended);
            }
            self.store.remove_line(&candidate.to, SCRATCH_LINE);
        }
    }

    // ---------------------------------------------------------------------
    // State changes
    // ---------------------------------------------------------------------

    fn on_new_state(&mut self, ev: &NewState) {
        let status = ExtenStatus::from_channel_state(ev.channel_state);

        if status == ExtenStatus::BUSY {
            if let Some(candidate) = self.busy.take(&ev.unique_id) {
                self.report_busy(ev, candidate);
                return;
            }
        }

        if !self.calls.contains(&ev.unique_id) {
            self.mark(|| format!("newstate for unknown attempt {}", ev.unique_id));
            return;
        }

        let Some(key) = extract_channel_key(&ev.channel) else {
            return;
        };
        let Some(attempt) = self.channels.get(&key).map(str::to_string) else {
            self.mark(|| format!("newstate for uncorrelated channel {}", ev.channel));
            return;
        };
        let Some(record) = self.calls.get(&attempt).cloned() else {
            return;
        };

        // The channel may belong to the called party of the recorded attempt
        let (exten, line) = match extract_extension(&ev.channel) {
            Some(exten) if exten != record.exten => {
                let side_line = self
                    .store
                    .line(&record.exten, record.line)
                    .and_then(|l| l.second_side.as_ref())
                    .filter(|ss| ss.exten == exten)
                    .map(|ss| ss.line);
                match side_line {
                    Some(l) => (exten, l),
                    None if self.redirects.row(&exten, record.line).is_some() => {
                        (exten, record.line)
                    }
                    None => (record.exten.clone(), record.line),
                }
            }
            _ => (record.exten.clone(), record.line),
        };

        self.apply_state(
            &exten,
            line,
            status,
            ev.connected_line_num.as_deref(),
            Some(&attempt),
            Some(&attempt),
        );
    }

    fn on_extension_status(&mut self, ev: &ExtensionStatus) {
        let single = match self.redirects.bucket(&ev.exten) {
            Some(bucket) if bucket.len() == 1 => bucket
                .iter()
                .next()
                .map(|(&line, row)| (line, row.unique_id.clone(), row.main.exten != ev.exten)),
            Some(bucket) => {
                debug!(
                    "ExtensionStatus for {} dropped: {} redirect rows",
                    ev.exten,
                    bucket.len()
                );
                None
            }
            None => None,
        };
        let Some((line, row_attempt, foreign)) = single else {
            return;
        };

        let status = ExtenStatus::from_bits(ev.status);
        // An unmonitored destination of someone else's call only tracks the row
        if foreign && !self.store.is_tracked(&ev.exten) {
            if let Some(row) = self.redirects.row_mut(&ev.exten, line) {
                row.status = status;
            }
            self.mark(|| format!("row status {} for unmonitored {}/{}", status, ev.exten, line));
            return;
        }

        let correlation = ev.unique_id.clone().or(row_attempt);
        self.apply_state(
            &ev.exten,
            line,
            status,
            ev.connected_line_num.as_deref(),
            None,
            correlation.as_deref(),
        );
    }

    /// Shared tail of both state-change events, once the target row is known.
    ///
    /// `attempt` is the channel-correlated attempt used for duplicate
    /// propagation; `correlation` is the id compared against the bound
    /// destination when deciding on redirect qualifiers.
    fn apply_state(
        &mut self,
        exten: &str,
        line: i32,
        status: ExtenStatus,
        connected: Option<&str>,
        attempt: Option<&str>,
        correlation: Option<&str>,
    ) {
        let Some(row) = self.redirects.row(exten, line).cloned() else {
            self.mark(|| format!("no redirect row {}/{}", exten, line));
            return;
        };
        let main = row.main.clone();
        let answered = self.answered_party(connected, exten, &main);
        let main_line = self.store.line_at(&main).cloned();
        let target_exists = self.store.line(exten, line).is_some();

        if let Some(ml) = &main_line {
            if target_exists && ml.status.has_base(status) && ml.to == exten {
                if let Some(row) = self.redirects.row_mut(exten, line) {
                    row.status = status;
                }
                if let Some(attempt) = attempt {
                    self.redirects.set_status_for_attempt(attempt, status);
                }
                self.mark(|| format!("duplicate state {} for {}/{}", status, exten, line));
                return;
            }

            if target_exists
                && exten == main.exten
                && ml.to == exten
                && !ml.is_idle()
                && !status.is_idle()
                && !ml.status.has_base(status)
            {
                self.update_main_line(&main, ml, exten, line, status, &answered, correlation);
                return;
            }
        }

        if row.status.has_base(status) {
            return;
        }

        let mut composed = row.status.compose(status);
        if let Some(row) = self.redirects.row_mut(exten, line) {
            row.status = composed;
        }
        let count = self.redirects.count_for_main(&main);
        let main_attempt = main_line.as_ref().and_then(|l| l.unique_id.clone());

        if count > 1 && composed.is_idle() {
            if row.unique_id.is_some() && row.unique_id == main_attempt {
                self.mark(|| format!("bound destination {} went idle, waiting for dial end", exten));
                return;
            }
            self.remove_redirect_row(None, exten, line, None);
            return;
        }

        let Some(ml) = main_line else {
            return;
        };

        if count > 1 && composed.has_base(ExtenStatus::RINGING) {
            composed = ExtenStatus::from_bits(composed.bits() | ExtenStatus::RINGING_REDIR.bits());
            if let Some(row) = self.redirects.row_mut(exten, line) {
                row.status = composed;
            }

            if self.store.is_tracked(exten) && !main.is(exten, line) {
                let (direction, second_side) = match ml.second_side {
                    Some(_) => (ml.direction.map(Direction::reversed), Some(main.clone())),
                    None => (ml.direction, None),
                };
                let leg = Line {
                    from: ml.from.clone(),
                    to: ml.to.clone(),
                    direction,
                    status: composed,
                    call_time_from: ml.call_time_from,
                    second_side,
                    caller_id_name: ml.caller_id_name.clone(),
                    unique_id: ml.unique_id.clone(),
                    ..Line::idle()
                };
                self.store.idle_line(exten, line);
                self.store.set_line(exten, line, leg);
                self.notify(exten, line, Annotations::default());
            }

            if let Some(m) = self.store.line_at_mut(&main) {
                m.set_status(composed);
            }
            self.notify(&main.exten, main.line, Annotations::ring_redir(exten));
            return;
        }

        let talking = composed.has_base(ExtenStatus::BUSY) || composed.has_base(ExtenStatus::IN_USE);
        if !((count > 1 && talking) || (count == 1 && !composed.is_idle())) {
            self.mark(|| format!("state {} on {}/{} needs no update", composed, exten, line));
            return;
        }

        if count > 1 {
            let bound = correlation.map_or(false, |id| self.redirects.dest_holds(&ml.to, id));
            if !bound {
                composed = composed.with_redirect_qualifier();
            }
        } else if self
            .redirects
            .row(exten, line)
            .map_or(false, |r| r.unique_id.is_some())
        {
            composed = composed.with_redirect_qualifier();
        }

        let annotations = if count > 1 && exten != main.exten {
            Annotations::talk_redir(exten)
        } else {
            Annotations::default()
        };
        let now = self.now;
        let leg_line = exten != main.exten;

        let (talk_time, answered_exten, main_status) = match self.store.line_at_mut(&main) {
            Some(m) => {
                if composed.has_base(ExtenStatus::IN_USE) {
                    m.start_talk(now, &answered);
                }
                (m.talk_time_from, m.answered_exten.clone(), m.status)
            }
            None => return,
        };
        if leg_line {
            if let Some(l) = self.store.line_mut(exten, line) {
                l.talk_time_from = talk_time;
                l.answered_exten = answered_exten;
            }
        }

        if main_status != composed {
            if let Some(m) = self.store.line_at_mut(&main) {
                m.set_status(composed);
            }
            if let Some(id) = &ml.unique_id {
                self.redirects.set_status_in_dest(&ml.from, id, composed);
            }
            let leg_present = leg_line && self.store.line(exten, line).is_some();
            if leg_present {
                if let Some(l) = self.store.line_mut(exten, line) {
                    l.set_status(composed);
                }
            }
            self.notify(&main.exten, main.line, annotations.clone());
            if leg_present {
                self.notify(exten, line, Annotations::default());
            }
        }

        if let Some(ss) = &ml.second_side {
            let changed = match self.store.line_at_mut(ss) {
                Some(l) => {
                    if composed.has_base(ExtenStatus::IN_USE) {
                        l.start_talk(now, &answered);
                    }
                    if l.status != composed {
                        l.set_status(composed);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if changed {
                self.notify(&ss.exten, ss.line, annotations);
            }
        }
    }

    /// The event concerns the main line itself
    #[allow(clippy::too_many_arguments)]
    fn update_main_line(
        &mut self,
        main: &LineRef,
        main_line: &Line,
        exten: &str,
        line: i32,
        status: ExtenStatus,
        answered: &str,
        correlation: Option<&str>,
    ) {
        let now = self.now;
        let composed = main_line.status.compose(status);

        if let Some(row) = self.redirects.row_mut(exten, line) {
            row.status = composed;
        }
        if let Some(row) = self.redirects.row_mut(&main.exten, main.line) {
            row.status = composed;
        }
        if let Some(m) = self.store.line_at_mut(main) {
            if composed.has_base(ExtenStatus::IN_USE) {
                m.start_talk(now, answered);
            }
            m.set_status(composed);
        }
        if let Some(l) = self.store.line_mut(exten, line) {
            l.set_status(composed);
        }

        if let Some(ss) = &main_line.second_side {
            let changed = match self.store.line_at_mut(ss) {
                Some(l) if !l.status.has_base(status) => {
                    let ss_status = l.status.compose(status);
                    if ss_status.has_base(ExtenStatus::IN_USE) {
                        l.start_talk(now, answered);
                    }
                    l.set_status(ss_status);
                    true
                }
                _ => false,
            };
            if changed {
                self.notify(&ss.exten, ss.line, Annotations::default());
            }
        }

        if let Some(id) = correlation {
            self.redirects.set_status_for_attempt(id, status);
        }
        self.notify(&main.exten, main.line, Annotations::default());
    }

    /// Who picked up: the connected party when known, else the target
    /// extension. When that turns out to be the caller, the callee is used.
    fn answered_party(&self, connected: Option<&str>, exten: &str, main: &LineRef) -> String {
        let party = connected
            .and_then(extract_extension)
            .unwrap_or_else(|| exten.to_string());
        match self.store.line_at(main) {
            Some(ml) if ml.from == party => ml.to.clone(),
            _ => party,
        }
    }

    // ---------------------------------------------------------------------
    // Dial begin
    // ---------------------------------------------------------------------

    fn on_dial_begin(&mut self, ev: &DialBegin) {
        let Some(target) = self.resolve_dial(ev) else {
            self.mark(|| format!("dial begin {} unresolved: {}", ev.unique_id, ev.destination));
            return;
        };
        let uid = ev.unique_id.as_str();

        if let Some(anchor) = target.anchor.as_deref() {
            if self.store.is_tracked(anchor)
                && !self.calls.contains(uid)
                && !self.channels.contains(target.chan_key.as_deref())
                && !self.anchor_has_caller(anchor, &target.from)
            {
                self.register_call(ev, anchor, &target);
                return;
            }
        }

        if self.calls.contains(uid) {
            self.register_hop(ev, &target);
            return;
        }

        if let Some(bound) = self.channels.lookup(target.chan_key.as_deref()) {
            let Some(record) = self.calls.get(bound).cloned() else {
                return;
            };
            // The destination key stays with the original attempt
            let main = target.main.clone().unwrap_or(record.main);
            self.calls
                .insert(uid, CallRecord::new(main, target.to.clone(), target.line_num));
            self.mark(|| format!("channel reuse by {}", uid));
            return;
        }

        if let Some(anchor) = target.anchor.as_deref() {
            if self.redirects.has_dest(anchor) {
                self.fill_destination(ev, anchor, &target);
                return;
            }
        }

        self.mark(|| format!("dial begin {} not attributable", uid));
    }

    fn resolve_dial(&self, ev: &DialBegin) -> Option<DialTarget> {
        let to_raw = extract_peer(&ev.destination)?;
        let alt_to = ev
            .dialstring
            .get(to_raw.len() + 1..)
            .unwrap_or_default()
            .to_string();
        let from = ev.caller_id_num.clone();
        let chan_exten = extract_extension(&ev.channel);

        let to = if is_numeric(&to_raw) {
            to_raw
        } else if is_numeric(&alt_to) {
            alt_to.clone()
        } else {
            chan_exten.clone()?
        };

        let from_tracked = !from.is_empty() && self.store.is_tracked(&from);
        let to_tracked = self.store.is_tracked(&to);

        let (mut anchor, mut direction) = match chan_exten.as_deref() {
            Some(e) if self.store.is_tracked(e) => {
                let direction = if e == to { Direction::In } else { Direction::Out };
                (Some(e.to_string()), direction)
            }
            _ if from_tracked => (Some(from.clone()), Direction::Out),
            _ if to_tracked => (Some(to.clone()), Direction::In),
            _ if !alt_to.is_empty() && self.store.is_tracked(&alt_to) => {
                (Some(alt_to.clone()), Direction::In)
            }
            _ => (None, Direction::Out),
        };
        if from_tracked && to_tracked {
            direction = Direction::Out;
        }

        let mut second_side = if to_tracked && direction == Direction::Out {
            Some(to.clone())
        } else if from_tracked && direction == Direction::In {
            Some(from.clone())
        } else {
            None
        };

        let chan_key = extract_channel_key(&ev.channel);
        let dest_key = extract_channel_key(&ev.destination);
        let bound = self.channels.lookup(chan_key.as_deref());

        let mut main = None;
        let mut line_num = 0;

        if anchor.is_none() {
            if let Some((slot, row)) = self.attempt_row(&to, &ev.unique_id, bound) {
                anchor = Some(to.clone());
                line_num = slot;
                main = Some(row.main.clone());
            }
        }
        if anchor.is_some() && anchor == second_side {
            second_side = None;
        }
        if main.is_none() {
            if let Some(a) = anchor.as_deref() {
                if let Some((slot, row)) = self.attempt_row(a, &ev.unique_id, bound) {
                    line_num = slot;
                    main = Some(row.main.clone());
                }
            }
        }

        Some(DialTarget {
            to,
            from,
            chan_exten,
            chan_key,
            dest_key,
            anchor,
            direction,
            second_side,
            main,
            line_num,
        })
    }

    /// Row in `dest` held by the attempt or by whoever owns its channel
    fn attempt_row(
        &self,
        dest: &str,
        unique_id: &str,
        bound: Option<&str>,
    ) -> Option<(i32, &RedirRow)> {
        self.redirects.find_in(dest, |row| {
            row.held_by(unique_id) || bound.map_or(false, |b| row.held_by(b))
        })
    }

    fn anchor_has_caller(&self, anchor: &str, from: &str) -> bool {
        self.store
            .lines_of(anchor)
            .map_or(false, |lines| lines.values().any(|l| !l.is_idle() && l.from == from))
    }

    /// First sight of a call on a tracked anchor
    fn register_call(&mut self, ev: &DialBegin, anchor: &str, target: &DialTarget) {
        let uid = ev.unique_id.as_str();
        let line = self.store.free_line(anchor);
        let main = LineRef::new(anchor, line);

        self.calls
            .insert(uid, CallRecord::new(main.clone(), anchor, line));
        self.calls
            .insert(&ev.dest_unique_id, CallRecord::new(main.clone(), anchor, line));
        self.channels.bind(target.chan_key.as_deref(), uid);
        self.channels.bind(target.dest_key.as_deref(), uid);

        self.redirects.insert(
            anchor,
            line,
            RedirRow::new(main.clone(), Some(uid), ExtenStatus::RINGING),
        );

        let mut legs: Vec<&str> = Vec::new();
        if target.to != anchor {
            legs.push(&target.to);
        }
        if !target.from.is_empty() && target.from != anchor {
            legs.push(&target.from);
        }
        if let Some(e) = target.chan_exten.as_deref() {
            if e != target.from && e != anchor {
                legs.push(e);
            }
        }
        for dest in legs {
            let slot = self.redirects.free_slot(dest);
            self.redirects.insert(
                dest,
                slot,
                RedirRow::new(main.clone(), Some(uid), ExtenStatus::RINGING),
            );
        }

        let mut anchor_line = Line {
            from: target.from.clone(),
            to: target.to.clone(),
            direction: Some(target.direction),
            status: ExtenStatus::RINGING,
            call_time_from: Some(self.now),
            caller_id_name: ev.caller_id_name.clone(),
            unique_id: Some(uid.to_string()),
            ..Line::idle()
        };

        info!(
            "📞 Call {} -> {} on {} ({})",
            target.from, target.to, main, uid
        );

        if let Some(ss) = target.second_side.as_deref() {
            let ss_line = self.redirects.free_slot_for(ss, uid);
            self.redirects.insert(
                ss,
                ss_line,
                RedirRow::new(main.clone(), Some(uid), ExtenStatus::RINGING),
            );
            anchor_line.second_side = Some(LineRef::new(ss, ss_line));

            let mirrored = Line {
                direction: Some(target.direction.reversed()),
                second_side: Some(main.clone()),
                ..anchor_line.clone()
            };
            self.store.idle_line(ss, ss_line);
            self.store.set_line(ss, ss_line, mirrored);
            self.store.set_line(anchor, line, anchor_line);
            self.notify(ss, ss_line, Annotations::default());
        } else {
            self.store.set_line(anchor, line, anchor_line);
        }

        self.notify(anchor, line, Annotations::default());
    }

    /// Known attempt dialling somewhere new: a forward or parallel leg
    fn register_hop(&mut self, ev: &DialBegin, target: &DialTarget) {
        let uid = ev.unique_id.as_str();
        let dest_uid = ev.dest_unique_id.as_str();
        self.channels.bind(target.dest_key.as_deref(), dest_uid);

        let main = target
            .main
            .clone()
            .or_else(|| self.calls.get(uid).map(|r| r.main.clone()));
        let Some(main) = main else {
            return;
        };

        let existing = self
            .redirects
            .find_in(&target.to, |row| row.main == main)
            .map(|(slot, _)| slot);
        if let Some(slot) = existing {
            self.calls
                .insert(dest_uid, CallRecord::new(main, target.to.clone(), slot));
            return;
        }

        let slot = self.redirects.next_slot(&target.to);
        self.calls
            .insert(dest_uid, CallRecord::new(main.clone(), target.to.clone(), slot));
        self.redirects.insert(
            &target.to,
            slot,
            RedirRow::new(main.clone(), Some(dest_uid), ExtenStatus::IDLE),
        );

        info!("↪️ Redirect {} added to {}", target.to, main);
        self.notify(&main.exten, main.line, Annotations::add_redir(&target.to));
    }

    /// Attach an attempt to a pre-registered row on the anchor
    fn fill_destination(&mut self, ev: &DialBegin, anchor: &str, target: &DialTarget) {
        let uid = ev.unique_id.as_str();

        let duplicate = self.store.lines_of(anchor).and_then(|lines| {
            lines.iter().find_map(|(&l, line)| {
                if line.from != target.from || line.to != target.to {
                    return None;
                }
                self.redirects
                    .row(anchor, l)
                    .filter(|row| row.status == ExtenStatus::RINGING)
                    .map(|row| (l, row.main.clone()))
            })
        });
        if let Some((l, main)) = duplicate {
            self.channels.bind(target.dest_key.as_deref(), uid);
            self.calls.insert(uid, CallRecord::new(main, anchor, l));
            self.mark(|| format!("duplicate dial {} on {}/{}", uid, anchor, l));
            return;
        }

        let free = self.redirects.bucket(anchor).and_then(|bucket| {
            bucket
                .iter()
                .find(|(_, row)| {
                    row.unique_id.is_none()
                        || (row.main.exten == anchor
                            && (row.status == ExtenStatus::RINGING || row.status.is_idle()))
                })
                .map(|(&slot, row)| (slot, row.main.clone()))
        });
        let Some((slot, main)) = free else {
            debug!("Dial {} -> {} skipped: no free row on {}", uid, target.to, anchor);
            return;
        };

        self.calls
            .insert(uid, CallRecord::new(main.clone(), anchor, slot));
        let main_line = self.store.line_at(&main).cloned();
        let main_status = main_line.as_ref().map(|l| l.status).unwrap_or_default();
        if let Some(row) = self.redirects.row_mut(anchor, slot) {
            row.unique_id = Some(uid.to_string());
            row.status = main_status;
        }

        if let (Some(ss), Some(ml)) = (target.second_side.as_deref(), main_line) {
            if !self.store.is_tracked(ss) {
                return;
            }
            let ss_line = self.store.free_line(ss);
            let mirrored = Line {
                from: ml.from.clone(),
                to: ml.to.clone(),
                direction: ml.direction.map(Direction::reversed),
                status: main_status,
                call_time_from: ml.call_time_from,
                second_side: Some(main.clone()),
                caller_id_name: ml.caller_id_name.clone(),
                unique_id: ml.unique_id.clone(),
                ..Line::idle()
            };
            self.store.set_line(ss, ss_line, mirrored);
            self.notify(ss, ss_line, Annotations::default());
        }
    }

    // ---------------------------------------------------------------------
    // Dial end
    // ---------------------------------------------------------------------

    fn on_dial_end(&mut self, ev: &DialEnd) {
        let uid = ev.unique_id.as_str();
        let Some(record) = self.calls.get(uid).cloned() else {
            self.mark(|| format!("dial end for unknown attempt {}", uid));
            return;
        };
        let main = record.main.clone();
        let outcome = &ev.dial_status;
        let fan_out = self.redirects.count_foreign_for_main(&main);
        let main_line = self.store.line_at(&main).cloned();
        let is_main_attempt = main_line.as_ref().map_or(false, |l| l.owned_by(uid));
        let untracked = !is_numeric(&record.exten);

        info!("📴 Dial end {} on {}: {}", uid, main, outcome);

        if !outcome.is_answer() {
            if !self.redirects.has_dest(&record.exten) && !is_main_attempt {
                self.remove_redirect_row(Some(uid), &record.exten, record.line, Some(outcome));
                return;
            }

            let main_row = self.redirects.row(&main.exten, main.line).cloned();
            let main_row_held = main_row.as_ref().map_or(false, |r| r.held_by(uid));

            if main_row_held || untracked {
                let main_row_in_use = main_row
                    .as_ref()
                    .map_or(false, |r| r.status == ExtenStatus::IN_USE);
                if untracked && fan_out > 0 && !main_row_in_use {
                    self.remove_redirect_row(Some(uid), &record.exten, record.line, Some(outcome));
                    return;
                }
                let main_busy = main_line.as_ref().map_or(false, |l| !l.is_idle());
                if is_main_attempt || main_busy {
                    self.notify_ended(&main, main_line.as_ref(), outcome, SideEnd::Notify);
                }
                self.save_cdr(&main.exten, main.line, Annotations::ended(outcome, self.now));
                self.teardown_call(uid, outcome);
                return;
            }

            if is_main_attempt {
                self.notify_ended(&main, main_line.as_ref(), outcome, SideEnd::WithRow);
                self.save_cdr(&main.exten, main.line, Annotations::ended(outcome, self.now));
                self.teardown_call(uid, outcome);
                return;
            }

            self.remove_redirect_row(Some(uid), &record.exten, record.line, Some(outcome));
            return;
        }

        if fan_out >= 1 && !is_main_attempt {
            if let Some(ml) = main_line.as_ref().filter(|l| !l.status.has_base(ExtenStatus::IN_USE)) {
                self.connect_leg(ev, &record, &main, ml);
            }
            self.remove_redirect_row(Some(uid), &record.exten, record.line, Some(outcome));
            return;
        }

        self.notify_ended(&main, main_line.as_ref(), outcome, SideEnd::WhenBusy);
        self.save_cdr(&main.exten, main.line, Annotations::ended(outcome, self.now));
        self.teardown_call(uid, outcome);
    }

    /// A competing leg answered: the main line and its second side go in use
    fn connect_leg(&mut self, ev: &DialEnd, record: &CallRecord, main: &LineRef, main_line: &Line) {
        let uid = ev.unique_id.as_str();
        let now = self.now;
        let bound = self
            .redirects
            .row(&main.exten, main.line)
            .map_or(false, |r| r.held_by(uid) || main_line.to == record.exten);
        let status = if bound {
            ExtenStatus::IN_USE
        } else {
            ExtenStatus::IN_USE.with_redirect_qualifier()
        };
        let annotations = if bound {
            Annotations::default()
        } else {
            Annotations::conn_redir(&record.exten)
        };
        let answered = self.answered_party(ev.connected_line_num.as_deref(), &record.exten, main);

        if let Some(m) = self.store.line_at_mut(main) {
            m.start_talk(now, &answered);
            m.set_status(status);
        }
        self.notify(&main.exten, main.line, annotations.clone());

        if let Some(ss) = &main_line.second_side {
            let present = match self.store.line_at_mut(ss) {
                Some(l) => {
                    l.start_talk(now, &answered);
                    l.set_status(status);
                    true
                }
                None => false,
            };
            if present {
                self.notify(&ss.exten, ss.line, annotations);
            }
        }
    }

    /// Call-end notification for the main line and, depending on `side`,
    /// its second side
    fn notify_ended(
        &mut self,
        main: &LineRef,
        main_line: Option<&Line>,
        outcome: &DialStatus,
        side: SideEnd,
    ) {
        let ended = Annotations::ended(outcome, self.now);
        self.notify(&main.exten, main.line, ended.clone());

        let Some(ss) = main_line.and_then(|l| l.second_side.clone()) else {
            return;
        };
        let Some(side_idle) = self.store.line_at(&ss).map(Line::is_idle) else {
            return;
        };

        match side {
            SideEnd::Notify => {
                self.notify(&ss.exten, ss.line, ended);
                if side_idle {
                    self.store.idle_line(&ss.exten, ss.line);
                }
            }
            SideEnd::WithRow => {
                if self.redirects.row(&ss.exten, ss.line).is_some() {
                    self.notify(&ss.exten, ss.line, ended);
                    self.store.idle_line(&ss.exten, ss.line);
                }
            }
            SideEnd::WhenBusy => {
                if !side_idle {
                    self.notify(&ss.exten, ss.line, ended);
                    self.store.idle_line(&ss.exten, ss.line);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Cleanup
    // ---------------------------------------------------------------------

    fn release_attempt(&mut self, unique_id: &str) {
        self.channels.release_attempt(unique_id);
        self.calls.remove(unique_id);
    }

    /// Drop one redirect row and whatever the attempt holding it still owns.
    ///
    /// Without an attempt id the owner is taken from the row itself.
    fn remove_redirect_row(
        &mut self,
        unique_id: Option<&str>,
        exten: &str,
        line: i32,
        outcome: Option<&DialStatus>,
    ) {
        let (main, attempt) = match unique_id {
            None => match self.redirects.row(exten, line) {
                Some(row) => (row.main.clone(), row.unique_id.clone()),
                None => return,
            },
            Some(id) => {
                let main = self
                    .calls
                    .get(id)
                    .map(|r| r.main.clone())
                    .or_else(|| self.redirects.row(exten, line).map(|r| r.main.clone()));
                match main {
                    Some(main) => (main, Some(id.to_string())),
                    None => {
                        self.release_attempt(id);
                        return;
                    }
                }
            }
        };

        if let Some(id) = attempt.as_deref() {
            self.release_attempt(id);
            let owns_line = main.exten != exten
                && self
                    .store
                    .lines_of(exten)
                    .map_or(false, |lines| lines.values().any(|l| l.owned_by(id)));
            if owns_line {
                self.store.idle_line(exten, line);
            }
        }

        let Some((slot, _)) = self
            .redirects
            .find_in(exten, |row| row.main == main && row.unique_id == attempt)
        else {
            return;
        };

        let main_side = self
            .store
            .line_at(&main)
            .and_then(|l| l.second_side.clone());
        let leg_busy = self
            .store
            .line(exten, slot)
            .map_or(false, |l| !l.is_idle());
        let is_main = main.is(exten, slot);
        let is_side = main_side.as_ref().map_or(false, |ss| ss.is(exten, slot));

        if leg_busy && !is_main && !is_side {
            let outcome = outcome.cloned().unwrap_or(DialStatus::RedirEnd);
            self.notify(exten, slot, Annotations::ended(&outcome, self.now));
            self.store.idle_line(exten, slot);
        }

        self.redirects.remove(exten, slot);
        self.mark(|| format!("redirect row {}/{} removed", exten, slot));
    }

    /// End a whole logical call. Calling it again for the same attempt is a
    /// no-op.
    pub(crate) fn teardown_call(&mut self, unique_id: &str, outcome: &DialStatus) {
        let Some(record) = self.calls.get(unique_id).cloned() else {
            return;
        };
        let main = record.main;
        let main_side = self
            .store
            .line_at(&main)
            .and_then(|l| l.second_side.clone());

        let ended = Annotations::ended(outcome, self.now);
        for at in self.store.lines_owned_by(unique_id) {
            if at == main || main_side.as_ref() == Some(&at) {
                continue;
            }
            self.notify(&at.exten, at.line, ended.clone());
        }

        self.release_attempt(unique_id);
        for row in self.redirects.remove_for_main(&main) {
            if let Some(other) = row.unique_id.as_deref() {
                if other != unique_id {
                    self.release_attempt(other);
                }
            }
        }
        for id in self.calls.ids_for_main(&main) {
            if !self.redirects.references_attempt(&id) {
                self.release_attempt(&id);
            }
        }

        self.store.idle_line(&main.exten, main.line);
        for at in self.store.lines_owned_by(unique_id) {
            self.store.idle_line(&at.exten, at.line);
        }

        info!("✅ Call on {} finished: {}", main, outcome);
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    fn notify(&mut self, exten: &str, line_num: i32, annotations: Annotations) {
        let current = self.store.line(exten, line_num).cloned();
        let redir = match &current {
            None => self
                .redirects
                .summaries_for(&LineRef::new(exten, line_num), &[exten]),
            Some(l) if l.direction == Some(Direction::Out) => self.redirects.summaries_for(
                &LineRef::new(exten, line_num),
                &[exten, l.to.as_str(), l.from.as_str()],
            ),
            Some(_) => BTreeMap::new(),
        };

        let record = LineNotification {
            exten: exten.to_string(),
            line_num,
            line: current.unwrap_or_default(),
            annotations,
            redir,
        };

        if self.debug_level.allows(DebugLevel::Info) {
            info!(
                "🔔 {}/{} {} ({})",
                exten,
                line_num,
                record.status().render(),
                record.status()
            );
        }
        self.outbox.push(Notification::StateChange(record));
    }

    fn save_cdr(&mut self, exten: &str, line_num: i32, annotations: Annotations) {
        let Some(line) = self.store.line(exten, line_num).cloned() else {
            return;
        };
        let record = LineNotification {
            exten: exten.to_string(),
            line_num,
            line,
            annotations,
            redir: BTreeMap::new(),
        };

        if self.debug_level.allows(DebugLevel::Info) {
            info!(
                "💾 CDR {}/{} {} -> {} {}",
                exten,
                line_num,
                record.line.from,
                record.line.to,
                record.end_call_status().map(DialStatus::as_str).unwrap_or_default()
            );
        }
        self.outbox.push(Notification::Cdr(record));
    }

    fn mark<F>(&self, message: F)
    where
        F: FnOnce() -> String,
    {
        if self.debug_level.allows(DebugLevel::Trace) {
            trace!("{}", message());
        }
    }

    fn dump_state(&self, event: &str) {
        debug!(
            event,
            lines = %serde_json::to_string(&self.store).unwrap_or_default(),
            calls = %serde_json::to_string(&self.calls).unwrap_or_default(),
            channels = %serde_json::to_string(&self.channels).unwrap_or_default(),
            redirects = %serde_json::to_string(&self.redirects).unwrap_or_default(),
            busy = self.busy.len(),
            "Registries after step"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CallStateEngine {
        CallStateEngine::with_extensions(DebugLevel::None, ["100", "200"])
    }

    fn dial(uid: &str, dest_uid: &str, channel: &str, destination: &str, from: &str) -> AmiEvent {
        AmiEvent::DialBegin(DialBegin {
            unique_id: uid.to_string(),
            dest_unique_id: dest_uid.to_string(),
            channel: channel.to_string(),
            destination: destination.to_string(),
            dialstring: String::new(),
            caller_id_num: from.to_string(),
            caller_id_name: String::new(),
        })
    }

    #[test]
    fn test_dial_between_tracked_extensions_mirrors_second_side() {
        let mut engine = engine();
        let out = engine.process(
            &dial("u1", "u2", "SIP/100-00000001", "SIP/200-00000002", "100"),
            Utc::now(),
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].record().exten, "200");
        assert_eq!(out[1].record().exten, "100");

        let main = engine.store().line("100", 0).unwrap();
        assert_eq!(main.direction, Some(Direction::Out));
        assert_eq!(main.second_side, Some(LineRef::new("200", 0)));
        let side = engine.store().line("200", 0).unwrap();
        assert_eq!(side.direction, Some(Direction::In));
        assert_eq!(side.second_side, Some(LineRef::new("100", 0)));

        assert_eq!(engine.channels().get("00000001"), Some("u1"));
        assert_eq!(engine.channels().get("00000002"), Some("u1"));
        assert!(engine.calls().contains("u2"));
    }

    #[test]
    fn test_unresolvable_destination_is_ignored() {
        let mut engine = engine();
        let before = engine.clone();
        let out = engine.process(&dial("u1", "u2", "SIP/100-1", "garbage", "100"), Utc::now());
        assert!(out.is_empty());
        assert_eq!(engine.store(), before.store());
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_teardown_is_a_fixed_point() {
        let mut engine = CallStateEngine::with_extensions(DebugLevel::None, ["100", "101"]);
        let now = Utc::now();
        engine.process(&dial("a1", "a2", "SIP/100-0000000a", "SIP/555-0000000b", "100"), now);
        engine.process(&dial("b1", "b2", "SIP/101-0000000c", "SIP/556-0000000d", "101"), now);

        engine.teardown_call("a1", &DialStatus::Cancel);
        let after_first = engine.clone();
        engine.teardown_call("a1", &DialStatus::Cancel);

        assert_eq!(engine.store(), after_first.store());
        assert_eq!(engine.calls(), after_first.calls());
        assert_eq!(engine.redirects(), after_first.redirects());
        assert!(engine.store().line("100", 0).unwrap().is_idle());
        assert!(engine.calls().contains("b1"));
        assert!(engine.redirects().has_dest("556"));
        assert!(!engine.store().line("101", 0).unwrap().is_idle());
    }

    #[test]
    fn test_hangup_clears_busy_watch() {
        let mut engine = engine();
        engine.process(
            &AmiEvent::NewChannel(NewChannel {
                unique_id: "u9".into(),
                caller_id_num: "100".into(),
                exten: "200".into(),
            }),
            Utc::now(),
        );
        assert!(engine.busy().contains("u9"));
        engine.process(&AmiEvent::Hangup(Hangup { unique_id: "u9".into() }), Utc::now());
        assert!(engine.busy().is_empty());
    }

    #[test]
    fn test_extension_state_seeds_line_zero() {
        let mut engine = engine();
        let out = engine.apply_extension_state("100", ExtenStatus::ON_HOLD, Utc::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record().exten, "100");
        assert_eq!(out[0].record().status(), ExtenStatus::ON_HOLD);
        assert_eq!(engine.store().line("100", 0).unwrap().status, ExtenStatus::ON_HOLD);

        assert!(engine
            .apply_extension_state("555", ExtenStatus::IN_USE, Utc::now())
            .is_empty());
        assert!(engine.store().line("555", 0).is_none());
    }

    #[test]
    fn test_untracked_attempt_end_leaves_live_call() {
        let mut engine = CallStateEngine::with_extensions(DebugLevel::None, ["100"]);
        let now = Utc::now();
        engine.process(&dial("u1", "u2", "SIP/100-00000001", "SIP/555-00000002", "100"), now);

        // An attempt whose destination never resolved to a number
        let main = LineRef::new("100", 0);
        engine.calls.insert("u7", CallRecord::new(main.clone(), "trunk", 0));
        engine
            .redirects
            .insert("trunk", 0, RedirRow::new(main, Some("u7"), ExtenStatus::RINGING));

        let out = engine.process(
            &AmiEvent::DialEnd(DialEnd {
                unique_id: "u7".into(),
                channel: "SIP/trunk-00000007".into(),
                dial_status: DialStatus::Cancel,
                connected_line_num: None,
            }),
            now,
        );

        assert!(out.is_empty());
        assert!(!engine.calls().contains("u7"));
        assert!(!engine.redirects().has_dest("trunk"));
        assert!(engine.calls().contains("u1"));
        assert!(engine.redirects().has_dest("555"));
        assert_eq!(engine.store().line("100", 0).unwrap().status, ExtenStatus::RINGING);
    }

    #[test]
    fn test_channel_reuse_leaves_destination_unbound() {
        let mut engine = CallStateEngine::with_extensions(DebugLevel::None, ["100"]);
        let now = Utc::now();
        engine.process(&dial("u1", "u2", "SIP/100-00000001", "SIP/555-00000002", "100"), now);

        let out = engine.process(&dial("u5", "u6", "SIP/100-00000001", "SIP/557-00000005", "100"), now);
        assert!(out.is_empty());
        assert_eq!(engine.calls().get("u5").map(|r| r.main.clone()), Some(LineRef::new("100", 0)));
        assert_eq!(engine.channels().get("00000005"), None);
        assert!(!engine.redirects().has_dest("557"));
    }

    #[test]
    fn test_configure_reports_removal() {
        let mut engine = engine();
        let mut wanted: BTreeSet<String> = ["100", "200", "300"].iter().map(|s| s.to_string()).collect();
        assert!(!engine.configure_monitored(&wanted));
        assert!(engine.store().is_tracked("300"));
        wanted.remove("100");
        assert!(engine.configure_monitored(&wanted));
        assert!(!engine.store().is_tracked("100"));
    }
}
