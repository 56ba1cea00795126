//! Integration tests for `InterpreterSession` used directly on the test thread.
//!
//! Covers persistence of globals, error classification and location, the
//! read-only builtin tables, script files, compilation, and closing.

use std::{
    fs,
    sync::{Arc, mpsc},
};

use luadesk::{
    BridgeContext, CallerKind, EngineError, ErrorKind, FileMode, HostEvent, HostEventKind, InteractiveChannel,
    InterpreterSession, RunMode, RuntimeCause, SessionConfig, read_script,
};
use pretty_assertions::assert_eq;

fn open_with(config: SessionConfig) -> (InterpreterSession, mpsc::Receiver<HostEvent>) {
    let (tx, rx) = mpsc::channel();
    let channel = Arc::new(InteractiveChannel::new(config.poll_quantum()));
    let bridge = Arc::new(BridgeContext::new("test", CallerKind::Editor, Arc::new(tx), channel, &config));
    let session = InterpreterSession::open(config, bridge).unwrap();
    (session, rx)
}

fn open() -> (InterpreterSession, mpsc::Receiver<HostEvent>) {
    open_with(SessionConfig::new())
}

fn run(session: &mut InterpreterSession, source: &str) -> Result<(), EngineError> {
    session.run_script_string(source.as_bytes(), RunMode::Execute)
}

fn printed(rx: &mpsc::Receiver<HostEvent>) -> String {
    rx.try_iter()
        .filter_map(|event| match event.kind {
            HostEventKind::Print(text) => Some(text),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Runs and persistence
// ============================================================================

#[test]
fn globals_persist_between_runs() {
    let (mut session, rx) = open();
    run(&mut session, "counter = 41").unwrap();
    run(&mut session, "counter = counter + 1\nprint(counter)").unwrap();
    assert_eq!(printed(&rx), "42\n");
    assert!(session.global_names().unwrap().contains(&"counter".to_owned()));
}

#[test]
fn successful_run_clears_previous_error() {
    let (mut session, _rx) = open();
    run(&mut session, "error('first')").unwrap_err();
    assert!(!session.is_ok());
    run(&mut session, "local x = 1").unwrap();
    assert!(session.is_ok());
    assert_eq!(session.last_error(), "");
    assert_eq!(session.err_line(), None);
    assert_eq!(session.last_error_kind(), None);
}

#[test]
fn session_without_standard_libraries_still_prints() {
    let (mut session, rx) = open_with(SessionConfig::new().standard_libraries(false));
    run(&mut session, "print('bare')").unwrap();
    assert_eq!(printed(&rx), "bare\n");
}

#[test]
fn bridge_functions_are_listed() {
    let (session, _rx) = open();
    let names = session.bridge_functions();
    for expected in ["print", "io.write", "io.read", "cls", "gui.ask", "gui.alert", "time.sleep", "socket.receive"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn syntax_error_is_located_and_nothing_runs() {
    let (mut session, rx) = open();
    let err = run(&mut session, "print('before')\nx = = 1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GuestSyntaxError);
    assert_eq!(err.line(), Some(1));
    assert!(err.to_string().contains("unexpected symbol"), "{err}");
    assert_eq!(printed(&rx), "");
    assert_eq!(session.err_line(), Some(1));
    assert_eq!(session.last_error_kind(), Some(ErrorKind::GuestSyntaxError));
}

#[test]
fn runtime_error_is_located_and_cleaned() {
    let (mut session, _rx) = open();
    let err = run(&mut session, "local t = nil\n\nreturn t.x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GuestRuntimeError);
    assert_eq!(err.cause(), Some(RuntimeCause::Guest));
    assert_eq!(err.line(), Some(2));
    let message = session.last_error();
    assert!(message.starts_with("attempt to index a nil value"), "{message}");
    assert!(!message.contains("stack traceback"), "{message}");
}

#[test]
fn output_before_a_runtime_error_is_kept() {
    let (mut session, rx) = open();
    run(&mut session, "print('partial')\nerror('boom')").unwrap_err();
    assert_eq!(printed(&rx), "partial\n");
    assert_eq!(session.last_error(), "boom");
    assert_eq!(session.err_line(), Some(1));
}

#[test]
fn wide_error_matches_narrow_error() {
    let (mut session, _rx) = open();
    run(&mut session, "error('grüße')").unwrap_err();
    let wide = String::from_utf16(session.last_error_wide()).unwrap();
    assert_eq!(wide, session.last_error());
}

#[test]
fn err_line_can_be_overridden() {
    let (mut session, _rx) = open();
    run(&mut session, "error('x')").unwrap_err();
    session.set_err_line(Some(9));
    assert_eq!(session.err_line(), Some(9));
}

#[test]
fn line_number_understands_classic_prefix() {
    let located = InterpreterSession::line_number("editor:5: oops\nstack traceback:\n\t[C]: in ?");
    assert_eq!(located.line, Some(4));
    assert_eq!(located.message, "oops");
}

#[test]
fn memory_limit_turns_into_runtime_error() {
    let (mut session, _rx) = open_with(SessionConfig::new().memory_limit(4 * 1024 * 1024));
    let err = run(&mut session, "local s = string.rep('x', 16 * 1024 * 1024)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GuestRuntimeError);
    assert!(err.to_string().contains("memory"), "{err}");
}

// ============================================================================
// Read-only builtin tables
// ============================================================================

#[test]
fn writing_a_builtin_field_is_a_capability_violation() {
    let (mut session, _rx) = open();
    let err = run(&mut session, "local ok = 1\nstring.upper = nil").unwrap_err();
    assert_eq!(err.cause(), Some(RuntimeCause::CapabilityViolation));
    assert_eq!(err.line(), Some(1));
    assert_eq!(err.to_string(), luadesk::CAPABILITY_VIOLATION);
}

#[test]
fn replacing_a_builtin_module_is_a_capability_violation() {
    let (mut session, _rx) = open();
    let err = run(&mut session, "gui = {}").unwrap_err();
    assert_eq!(err.cause(), Some(RuntimeCause::CapabilityViolation));
}

#[test]
fn rawset_cannot_bypass_the_lock() {
    let (mut session, rx) = open();
    let err = run(&mut session, "rawset(math, 'pi', 3)").unwrap_err();
    assert_eq!(err.cause(), Some(RuntimeCause::CapabilityViolation));
    let err = run(&mut session, "\nrawset(_G, 'string', {})").unwrap_err();
    assert_eq!(err.cause(), Some(RuntimeCause::CapabilityViolation));
    assert_eq!(err.line(), Some(1));

    run(&mut session, "print(math.pi > 3.14, string.upper('a'))").unwrap();
    assert_eq!(printed(&rx), "true   A\n");
}

#[test]
fn guest_debug_library_is_read_only() {
    let (mut session, rx) = open();
    run(
        &mut session,
        "print(debug.sethook, debug.setmetatable, debug.getupvalue, debug.getregistry)\n\
         print(type(debug.traceback), type(debug.getinfo), type(debug.getlocal))",
    )
    .unwrap();
    assert_eq!(printed(&rx), "nil   nil   nil   nil\nfunction   function   function\n");
}

#[test]
fn builtin_modules_stay_usable() {
    let (mut session, rx) = open();
    run(&mut session, "print(string.upper('abc'), ('x'):rep(3), math.floor(2.7))").unwrap();
    assert_eq!(printed(&rx), "ABC   xxx   2\n");
}

// ============================================================================
// Console support
// ============================================================================

#[test]
fn needs_more_input_detects_open_blocks() {
    let (session, _rx) = open();
    assert!(session.needs_more_input("function greet(name)"));
    assert!(session.needs_more_input("if x then\n  print(x)"));
    assert!(!session.needs_more_input("x = 1"));
    assert!(!session.needs_more_input("x = )"));
}

// ============================================================================
// Compilation
// ============================================================================

#[test]
fn compile_writes_bytecode_without_executing() {
    let (mut session, rx) = open();
    let mut bytecode = Vec::new();
    session
        .run_script_string(b"print('never')", RunMode::Compile(&mut bytecode))
        .unwrap();
    assert!(bytecode.starts_with(b"\x1bLua"), "not a bytecode header");
    assert_eq!(printed(&rx), "");
}

#[test]
fn compile_reports_syntax_errors() {
    let (mut session, _rx) = open();
    let mut bytecode = Vec::new();
    let err = session
        .run_script_string(b"local = 3", RunMode::Compile(&mut bytecode))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GuestSyntaxError);
    assert!(bytecode.is_empty());
}

// ============================================================================
// Script files
// ============================================================================

#[test]
fn script_file_runs_with_path_chunk_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.lua");
    fs::write(&path, "print('from file')\nerror('late')").unwrap();

    let (mut session, rx) = open();
    let err = session.run_script_file(&path, None, FileMode::Execute).unwrap_err();
    assert_eq!(printed(&rx), "from file\n");
    assert_eq!(err.line(), Some(1));
    assert_eq!(err.to_string(), "late");
}

#[test]
fn require_searches_the_script_directory_only_during_the_run() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("helper.lua"), "return { answer = 42 }").unwrap();
    let path = dir.path().join("main.lua");
    fs::write(&path, "local helper = require('helper')\nprint(helper.answer)").unwrap();

    let (mut session, rx) = open();
    session.run_script_file(&path, None, FileMode::Execute).unwrap();
    assert_eq!(printed(&rx), "42\n");

    let check = format!(
        "print(package.path:find({:?}, 1, true) == nil)",
        dir.path().display().to_string()
    );
    run(&mut session, &check).unwrap();
    assert_eq!(printed(&rx), "true\n");
}

#[test]
fn compile_mode_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.lua");
    let out = dir.path().join("main.luac");
    fs::write(&path, "print('compiled')").unwrap();

    let (mut session, rx) = open();
    session
        .run_script_file(&path, None, FileMode::Compile { out_path: &out })
        .unwrap();
    assert!(fs::read(&out).unwrap().starts_with(b"\x1bLua"));
    assert_eq!(printed(&rx), "");
}

#[test]
fn empty_file_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.lua");
    fs::write(&path, "").unwrap();

    let (mut session, _rx) = open();
    let err = session.run_script_file(&path, None, FileMode::Execute).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileError);
    assert_eq!(session.last_error_kind(), Some(ErrorKind::FileError));
}

#[test]
fn oversized_file_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.lua");
    fs::write(&path, "x = 1\nx = 2\n").unwrap();

    let err = read_script(&path, 8).unwrap_err();
    assert!(matches!(err, EngineError::File(_)));
    assert!(err.to_string().contains("8 byte limit"), "{err}");
    assert_eq!(read_script(&path, 12).unwrap().len(), 12);
}

#[test]
fn missing_file_is_a_file_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = read_script(&dir.path().join("nope.lua"), 1024).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileError);
}

// ============================================================================
// Closing
// ============================================================================

#[test]
fn close_is_idempotent_and_refuses_later_runs() {
    let (mut session, _rx) = open();
    session.close();
    session.close();
    assert!(!session.is_open());
    assert!(matches!(run(&mut session, "x = 1"), Err(EngineError::Closed)));
    assert_eq!(session.last_error_kind(), Some(ErrorKind::SessionClosed));
    assert!(matches!(session.global_names(), Err(EngineError::Closed)));
    assert!(!session.needs_more_input("function f()"));
}
