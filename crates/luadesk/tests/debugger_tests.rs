//! Integration tests for debug snapshots produced while a script runs.

use std::sync::{Arc, mpsc};

use luadesk::{
    BridgeContext, CallerKind, DebugSnapshot, HostEvent, HostEventKind, InteractiveChannel, InterpreterSession,
    RunMode, SNAPSHOT_UNAVAILABLE, STACKTRACE_DELIMITER, SessionConfig, WatchEntry, render_table,
};
use mlua::Lua;
use pretty_assertions::assert_eq;

fn debug_config() -> SessionConfig {
    SessionConfig::new().debugging(true).snapshot_interval_ms(0)
}

fn open_with(config: SessionConfig) -> (InterpreterSession, mpsc::Receiver<HostEvent>) {
    let (tx, rx) = mpsc::channel();
    let channel = Arc::new(InteractiveChannel::new(config.poll_quantum()));
    let bridge = Arc::new(BridgeContext::new("debug", CallerKind::Editor, Arc::new(tx), channel, &config));
    let session = InterpreterSession::open(config, bridge).unwrap();
    (session, rx)
}

fn snapshots(session: &mut InterpreterSession, rx: &mpsc::Receiver<HostEvent>, source: &str) -> Vec<String> {
    session.run_script_string(source.as_bytes(), RunMode::Execute).unwrap();
    rx.try_iter()
        .filter_map(|event| match event.kind {
            HostEventKind::Snapshot(text) => Some(text),
            _ => None,
        })
        .collect()
}

fn find_watch<'a>(snapshot: &'a DebugSnapshot, name: &str) -> Option<&'a WatchEntry> {
    snapshot.watches.iter().find(|watch| watch.name == name)
}

#[test]
fn snapshots_list_active_locals() {
    let (mut session, rx) = open_with(debug_config());
    let texts = snapshots(&mut session, &rx, "local alpha = 7\nlocal beta = 'text'\nlocal gamma = alpha + 1");
    assert!(!texts.is_empty());

    let last = DebugSnapshot::parse(texts.last().unwrap()).unwrap();
    assert_eq!(find_watch(&last, "alpha").map(|w| w.value.as_str()), Some("7"));
    let beta = find_watch(&last, "beta").unwrap();
    assert_eq!(beta.value, "text");
    assert_eq!(beta.type_tag, "string");
    assert!(find_watch(&last, "gamma").is_none(), "gamma is not active yet");
}

#[test]
fn every_snapshot_has_one_delimiter_and_a_stack() {
    let (mut session, rx) = open_with(debug_config());
    let texts = snapshots(
        &mut session,
        &rx,
        "local function inner(n)\n  local doubled = n * 2\n  return doubled\nend\nlocal r = inner(4)\nprint(r)",
    );
    assert!(!texts.is_empty());
    for text in &texts {
        assert_eq!(text.matches(STACKTRACE_DELIMITER).count(), 1, "{text}");
        let (_, stack) = text.split_once(STACKTRACE_DELIMITER).unwrap();
        assert!(!stack.is_empty(), "{text}");
    }
}

#[test]
fn frames_name_functions_and_the_main_chunk() {
    let (mut session, rx) = open_with(debug_config());
    let texts = snapshots(
        &mut session,
        &rx,
        "local function inner(n)\n  local doubled = n * 2\n  return doubled\nend\nlocal r = inner(4)",
    );
    let inside = texts
        .iter()
        .map(|text| DebugSnapshot::parse(text).unwrap())
        .find(|snapshot| find_watch(snapshot, "doubled").is_some())
        .expect("a snapshot taken inside inner");

    assert_eq!(find_watch(&inside, "doubled").map(|w| w.value.as_str()), Some("8"));
    assert_eq!(find_watch(&inside, "n").map(|w| w.value.as_str()), Some("4"));
    let top = &inside.frames[0];
    assert_eq!(top.depth, 0);
    assert_eq!(top.name, "inner");
    assert_eq!(top.kind, "Lua");
    assert_eq!(top.line, 3);
    assert!(inside.frames.iter().any(|frame| frame.name == "main chunk" && frame.kind == "main"));
}

#[test]
fn globals_from_before_the_run_are_hidden() {
    let (mut session, rx) = open_with(debug_config());
    session.set_debugging(false);
    session.run_script_string(b"existing = 1", RunMode::Execute).unwrap();
    session.set_debugging(true);

    let texts = snapshots(&mut session, &rx, "existing = 2\ncreated = 3\nlocal z = 0");
    let last = DebugSnapshot::parse(texts.last().unwrap()).unwrap();
    assert_eq!(find_watch(&last, "created").map(|w| w.value.as_str()), Some("3"));
    for text in &texts {
        let snapshot = DebugSnapshot::parse(text).unwrap();
        assert!(find_watch(&snapshot, "existing").is_none(), "{text}");
    }
}

#[test]
fn table_values_are_capped_at_ten_elements() {
    let (mut session, rx) = open_with(debug_config());
    let texts = snapshots(
        &mut session,
        &rx,
        "local t = {}\nfor i = 1, 15 do t[i] = i end\nlocal done = true",
    );
    let last = DebugSnapshot::parse(texts.last().unwrap()).unwrap();
    let t = find_watch(&last, "t").unwrap();
    assert_eq!(t.value, "{ 1, 2, 3, 4, 5, 6, 7, 8, 9, 10 ... }");
    assert_eq!(t.type_tag, "table");
}

#[test]
fn rendering_fifteen_elements_shows_ten() {
    let lua = Lua::new();
    let table = lua.load("local t = {} for i = 1, 15 do t[i] = i * 2 end return t").eval().unwrap();
    let text = render_table(&table);
    assert!(text.ends_with(" ... }"), "{text}");
    let body = text.trim_start_matches("{ ").trim_end_matches(" ... }");
    assert_eq!(body.split(", ").count(), 10);
}

#[test]
fn long_strings_are_cut_to_the_configured_width() {
    let (mut session, rx) = open_with(debug_config().max_string_width(5));
    let texts = snapshots(&mut session, &rx, "local s = 'abcdefghij'\nlocal after = 1");
    let last = DebugSnapshot::parse(texts.last().unwrap()).unwrap();
    assert_eq!(find_watch(&last, "s").map(|w| w.value.as_str()), Some("abcde"));
}

#[test]
fn watch_entries_are_capped() {
    let (mut session, rx) = open_with(debug_config().max_watch_entries(2));
    let texts = snapshots(&mut session, &rx, "local a, b, c, d = 1, 2, 3, 4\ng1 = 1\ng2 = 2\nlocal last = 0");
    for text in &texts {
        assert!(DebugSnapshot::parse(text).unwrap().watches.len() <= 2, "{text}");
    }
}

#[test]
fn oversized_snapshot_is_reported_unavailable() {
    let (mut session, rx) = open_with(debug_config().snapshot_capacity(16));
    let texts = snapshots(&mut session, &rx, "local a = 1\nlocal b = 2");
    assert!(!texts.is_empty());
    assert!(texts.iter().all(|text| text == SNAPSHOT_UNAVAILABLE));
    assert_eq!(session.latest_snapshot().as_deref(), Some(SNAPSHOT_UNAVAILABLE));
}

#[test]
fn latest_snapshot_is_kept_after_the_run() {
    let (mut session, rx) = open_with(debug_config());
    let texts = snapshots(&mut session, &rx, "local a = 1\nlocal b = 2");
    assert_eq!(session.latest_snapshot().as_ref(), texts.last());
}

#[test]
fn no_snapshots_without_debugging() {
    let (mut session, rx) = open_with(SessionConfig::new().snapshot_interval_ms(0));
    assert!(!session.is_debugging());
    let texts = snapshots(&mut session, &rx, "local a = 1\nlocal b = 2");
    assert!(texts.is_empty());
    assert_eq!(session.latest_snapshot(), None);
}

#[test]
fn snapshots_work_without_standard_libraries() {
    let (mut session, rx) = open_with(debug_config().standard_libraries(false));
    let texts = snapshots(&mut session, &rx, "local a = 5\nlocal b = 6");
    let last = DebugSnapshot::parse(texts.last().unwrap()).unwrap();
    assert_eq!(find_watch(&last, "a").map(|w| w.value.as_str()), Some("5"));
}
