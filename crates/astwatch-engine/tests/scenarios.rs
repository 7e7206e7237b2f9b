// tests/scenarios.rs
//! End-to-end engine scenarios driven by simulated manager events

mod common;

use astwatch_core::models::{DialStatus, Direction, ExtenStatus};
use common::{cdrs, state_changes, AmiEventBuilder as Ev, Harness};

#[test]
fn test_outbound_call_to_untracked_number() {
    let mut h = Harness::new(&["100"]);

    let out = h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/555-00000002",
        "100",
    ));
    assert_eq!(out.len(), 1);
    let line = h.engine.store().line("100", 0).unwrap();
    assert_eq!(line.status, ExtenStatus::RINGING);
    assert_eq!(line.from, "100");
    assert_eq!(line.to, "555");
    assert_eq!(line.direction, Some(Direction::Out));
    assert_eq!(line.call_time_from, Some(h.now()));

    let out = h.feed(Ev::new_state("u1", "SIP/100-00000001", 6));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].record().status(), ExtenStatus::IN_USE);
    let line = h.engine.store().line("100", 0).unwrap();
    assert_eq!(line.talk_time_from, Some(h.now()));
    assert_eq!(line.answered_exten.as_deref(), Some("555"));

    let out = h.feed(Ev::dial_end("u1", "SIP/100-00000001", "ANSWER"));
    let changes = state_changes(&out);
    let records = cdrs(&out);
    assert_eq!(changes.len(), 1);
    assert_eq!(records.len(), 1);
    assert_eq!(
        changes[0].record().end_call_status(),
        Some(&DialStatus::Answer)
    );
    assert_eq!(records[0].record().exten, "100");
    assert_eq!(records[0].record().line.to, "555");

    assert!(h.engine.store().line("100", 0).unwrap().is_idle());
    assert!(h.engine.calls().is_empty());
    assert!(h.engine.channels().is_empty());
    assert!(h.engine.redirects().is_empty());
}

#[test]
fn test_follow_me_leg_answers_first() {
    let mut h = Harness::new(&["100", "200", "300"]);

    let out = h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/200-00000002",
        "100",
    ));
    assert_eq!(out.len(), 2);
    assert_eq!(
        h.engine.store().line("200", 0).unwrap().direction,
        Some(Direction::In)
    );

    // Parallel leg to 300 under the same call
    let out = h.feed(Ev::dial_begin(
        "u1",
        "u3",
        "SIP/100-00000001",
        "SIP/300-00000003",
        "100",
    ));
    assert_eq!(out.len(), 1);
    let main = out[0].record();
    assert_eq!(main.exten, "100");
    assert_eq!(main.annotations.add_redir.as_deref(), Some("300"));
    assert!(main.redir.contains_key("300"));
    assert!(h.engine.redirects().has_dest("200"));
    assert!(h.engine.redirects().has_dest("300"));

    let out = h.feed(Ev::new_state("u3", "SIP/300-00000003", 5));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].record().exten, "300");
    assert_eq!(out[1].record().exten, "100");
    assert_eq!(out[1].record().annotations.ring_redir.as_deref(), Some("300"));
    let ringing = ExtenStatus::from_bits(
        ExtenStatus::RINGING.bits() | ExtenStatus::RINGING_REDIR.bits(),
    );
    assert_eq!(h.engine.store().line("100", 0).unwrap().status, ringing);
    assert_eq!(h.engine.store().line("300", 0).unwrap().status, ringing);

    let out = h.feed(Ev::dial_end("u3", "SIP/100-00000001", "ANSWER"));
    let in_use_redir = ExtenStatus::from_bits(
        ExtenStatus::IN_USE.bits() | ExtenStatus::IN_USE_REDIR.bits(),
    );
    assert_eq!(out.len(), 3);
    assert!(cdrs(&out).is_empty());

    assert_eq!(out[0].record().exten, "100");
    assert_eq!(out[0].record().status(), in_use_redir);
    assert_eq!(out[0].record().annotations.conn_redir.as_deref(), Some("300"));
    assert_eq!(out[1].record().exten, "200");
    assert_eq!(out[1].record().status(), in_use_redir);
    assert_eq!(out[2].record().exten, "300");
    assert_eq!(out[2].record().end_call_status(), Some(&DialStatus::Answer));

    let main = h.engine.store().line("100", 0).unwrap();
    assert_eq!(main.answered_exten.as_deref(), Some("300"));
    assert!(main.talk_time_from.is_some());
    assert_eq!(h.engine.store().line("200", 0).unwrap().status, in_use_redir);
    assert!(h.engine.store().line("300", 0).unwrap().is_idle());
    assert!(!h.engine.redirects().has_dest("300"));
    assert!(!h.engine.calls().contains("u3"));
}

#[test]
fn test_ambiguous_extension_status_is_dropped() {
    let mut h = Harness::new(&["100", "101"]);
    h.feed(Ev::dial_begin(
        "a1",
        "a2",
        "SIP/100-0000000a",
        "SIP/400-0000000b",
        "100",
    ));
    h.feed(Ev::dial_begin(
        "b1",
        "b2",
        "SIP/101-0000000c",
        "SIP/400-0000000d",
        "101",
    ));
    assert_eq!(h.engine.redirects().bucket("400").map(|b| b.len()), Some(2));

    let before = h.engine.clone();
    let out = h.feed(Ev::extension_status("400", 1));

    assert!(out.is_empty());
    assert_eq!(h.engine.store(), before.store());
    assert_eq!(h.engine.redirects(), before.redirects());
    assert_eq!(h.engine.calls(), before.calls());
    assert_eq!(h.engine.channels(), before.channels());
}

#[test]
fn test_extension_status_for_unmonitored_destination_only_tracks_row() {
    let mut h = Harness::new(&["100"]);
    h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/555-00000002",
        "100",
    ));

    let out = h.feed(Ev::extension_status("555", 1));
    assert!(out.is_empty());
    assert_eq!(
        h.engine.redirects().row("555", 0).map(|r| r.status),
        Some(ExtenStatus::IN_USE)
    );
    let main = h.engine.store().line("100", 0).unwrap();
    assert_eq!(main.status, ExtenStatus::RINGING);
    assert!(main.talk_time_from.is_none());
}

#[test]
fn test_extension_status_for_monitored_destination_updates_both_sides() {
    let mut h = Harness::new(&["100", "200"]);
    h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/200-00000002",
        "100",
    ));

    let out = h.feed(Ev::extension_status("200", 1));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].record().exten, "100");
    assert_eq!(out[0].record().status(), ExtenStatus::IN_USE);
    assert_eq!(out[1].record().exten, "200");
    assert_eq!(out[1].record().status(), ExtenStatus::IN_USE);
}

#[test]
fn test_called_party_answers_on_destination_channel() {
    let mut h = Harness::new(&["100"]);
    h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/555-00000002",
        "100",
    ));

    let out = h.feed(Ev::new_state("u2", "SIP/555-00000002", 6));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].record().exten, "100");
    assert_eq!(out[0].record().status(), ExtenStatus::IN_USE);
    let main = h.engine.store().line("100", 0).unwrap();
    assert_eq!(main.talk_time_from, Some(h.now()));
    assert_eq!(main.answered_exten.as_deref(), Some("555"));

    let out = h.feed(Ev::dial_end("u1", "SIP/100-00000001", "ANSWER"));
    assert_eq!(state_changes(&out).len(), 1);
    assert_eq!(cdrs(&out).len(), 1);
    assert!(cdrs(&out)[0].record().line.talk_time_from.is_some());
    assert!(h.engine.calls().is_empty());
    assert!(h.engine.channels().is_empty());
    assert!(h.engine.redirects().is_empty());
}

#[test]
fn test_second_side_channel_answers() {
    let mut h = Harness::new(&["100", "200"]);
    h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/200-00000002",
        "100",
    ));

    let out = h.feed(Ev::new_state("u2", "SIP/200-00000002", 6));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].record().exten, "100");
    assert_eq!(out[1].record().exten, "200");
    for exten in ["100", "200"] {
        let line = h.engine.store().line(exten, 0).unwrap();
        assert_eq!(line.status, ExtenStatus::IN_USE);
        assert_eq!(line.talk_time_from, Some(h.now()));
        assert_eq!(line.answered_exten.as_deref(), Some("200"));
    }
}

/// Call from 100 to 555 with a parallel leg to 556 under the same call
fn fan_out() -> Harness {
    let mut h = Harness::new(&["100"]);
    h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/555-00000002",
        "100",
    ));
    let out = h.feed(Ev::dial_begin(
        "u1",
        "u3",
        "SIP/100-00000001",
        "SIP/556-00000003",
        "100",
    ));
    assert_eq!(out[0].record().annotations.add_redir.as_deref(), Some("556"));
    h
}

#[test]
fn test_fan_out_leg_going_idle_is_dropped_silently() {
    let mut h = fan_out();
    h.feed(Ev::new_state("u3", "SIP/556-00000003", 5));
    let ringing = ExtenStatus::from_bits(
        ExtenStatus::RINGING.bits() | ExtenStatus::RINGING_REDIR.bits(),
    );
    assert_eq!(h.engine.store().line("100", 0).unwrap().status, ringing);

    let out = h.feed(Ev::new_state("u3", "SIP/556-00000003", 0));
    assert!(out.is_empty());
    assert!(!h.engine.redirects().has_dest("556"));
    assert!(!h.engine.calls().contains("u3"));
    assert_eq!(h.engine.channels().get("00000003"), None);
    assert_eq!(h.engine.store().line("100", 0).unwrap().status, ringing);
    assert!(h.engine.redirects().has_dest("555"));
}

#[test]
fn test_bound_destination_idle_waits_for_dial_end() {
    let mut h = fan_out();

    let out = h.feed(Ev::new_state("u2", "SIP/555-00000002", 0));
    assert!(out.is_empty());
    assert_eq!(
        h.engine.redirects().row("555", 0).map(|r| r.status),
        Some(ExtenStatus::IDLE)
    );
    assert_eq!(
        h.engine.store().line("100", 0).unwrap().status,
        ExtenStatus::RINGING
    );
    assert!(h.engine.calls().contains("u1"));
}

#[test]
fn test_fan_out_leg_busy_is_qualified() {
    let mut h = fan_out();

    let out = h.feed(Ev::new_state("u3", "SIP/556-00000003", 7));
    assert_eq!(out.len(), 1);
    let main = out[0].record();
    assert_eq!(main.exten, "100");
    assert_eq!(main.status(), ExtenStatus::BUSY.with_redirect_qualifier());
    assert_eq!(main.annotations.talk_redir.as_deref(), Some("556"));
    assert!(h
        .engine
        .store()
        .line("100", 0)
        .unwrap()
        .talk_time_from
        .is_none());
}

#[test]
fn test_main_attempt_end_closes_call_with_live_leg() {
    let mut h = fan_out();

    let out = h.feed(Ev::dial_end("u1", "SIP/100-00000001", "NOANSWER"));
    let changes = state_changes(&out);
    assert_eq!(changes.len(), 1);
    assert_eq!(cdrs(&out).len(), 1);
    assert_eq!(
        changes[0].record().end_call_status(),
        Some(&DialStatus::NoAnswer)
    );

    assert!(h.engine.store().line("100", 0).unwrap().is_idle());
    assert!(h.engine.calls().is_empty());
    assert!(h.engine.channels().is_empty());
    assert!(h.engine.redirects().is_empty());
}

#[test]
fn test_fan_out_leg_end_removes_only_its_row() {
    let mut h = fan_out();

    let out = h.feed(Ev::dial_end("u3", "SIP/100-00000001", "NOANSWER"));
    assert!(out.is_empty());
    assert!(!h.engine.redirects().has_dest("556"));
    assert!(!h.engine.calls().contains("u3"));
    assert!(h.engine.redirects().has_dest("555"));
    assert_eq!(
        h.engine.store().line("100", 0).unwrap().status,
        ExtenStatus::RINGING
    );
}

#[test]
fn test_busy_before_dial_uses_scratch_line() {
    let mut h = Harness::new(&["100"]);

    assert!(h.feed(Ev::new_channel("u9", "100", "200")).is_empty());
    let out = h.feed(Ev::new_state("u9", "SIP/100-00000009", 7));

    let changes = state_changes(&out);
    let records = cdrs(&out);
    assert_eq!(changes.len(), 1);
    assert_eq!(records.len(), 1);
    assert_eq!(changes[0].record().status(), ExtenStatus::BUSY);
    assert_eq!(
        changes[0].record().end_call_status(),
        Some(&DialStatus::Busy)
    );
    assert_eq!(records[0].record().line.to, "200");

    assert!(h.engine.busy().is_empty());
    assert!(h.engine.store().line("100", -1).is_none());
    assert!(h.engine.store().line("100", 0).unwrap().is_idle());
}

#[test]
fn test_reset_forgets_active_call() {
    let mut h = Harness::new(&["100"]);
    h.feed(Ev::dial_begin(
        "u1",
        "u2",
        "SIP/100-00000001",
        "SIP/555-00000002",
        "100",
    ));
    h.feed(Ev::new_state("u1", "SIP/100-00000001", 6));

    // Connection lost: the watcher resets the engine before the next session
    h.engine.reset();
    assert!(h.engine.calls().is_empty());
    assert!(h.engine.channels().is_empty());
    assert!(h.engine.redirects().is_empty());
    assert!(h.engine.store().line("100", 0).unwrap().is_idle());

    assert!(h
        .feed(Ev::dial_end("u1", "SIP/100-00000001", "ANSWER"))
        .is_empty());
    assert!(h
        .feed(Ev::new_state("u1", "SIP/100-00000001", 0))
        .is_empty());
}

/// Known ambiguity: a busy-watch entry and a real dial flow for the same
/// attempt id race, and whichever event arrives first decides. This pins the
/// current order-dependent precedence (the dial wins and the busy watch entry
/// is dropped); it is not a verified statement of the correct outcome.
#[test]
fn test_dial_before_busy_state_drops_busy_watch() {
    let mut h = Harness::new(&["100"]);

    h.feed(Ev::new_channel("u9", "100", "200"));
    assert!(h.engine.busy().contains("u9"));

    h.feed(Ev::dial_begin(
        "u9",
        "u10",
        "SIP/100-00000009",
        "SIP/200-0000000a",
        "100",
    ));
    assert!(h.engine.busy().is_empty());

    let out = h.feed(Ev::new_state("u9", "SIP/100-00000009", 7));
    assert!(cdrs(&out).is_empty());
    assert!(out
        .iter()
        .all(|n| n.record().end_call_status() != Some(&DialStatus::Busy)));
    assert!(h.engine.store().line("100", -1).is_none());
}

#[test]
fn test_unknown_events_are_ignored() {
    let mut h = Harness::new(&["100"]);
    let before = h.engine.clone();

    assert!(h.feed(Ev::new("PeerStatus").header("Peer", "SIP/100").build()).is_empty());
    assert!(h.feed(Ev::new("Dial").header("SubEvent", "Begin").build()).is_empty());
    assert!(h.feed(Ev::dial_end("nobody", "SIP/100-00000001", "CANCEL")).is_empty());

    assert_eq!(h.engine.store(), before.store());
}
