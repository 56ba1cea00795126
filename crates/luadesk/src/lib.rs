#![doc = include_str!("../../../README.md")]

mod bootstrap;
mod bridge;
pub mod capability;
mod config;
mod error;
mod events;
mod format;
mod host;
pub mod introspect;
mod io;
mod locator;
mod mailbox;
mod session;
pub mod session_manager;
pub mod sockets;
mod worker;

pub use crate::{
    bridge::BridgeContext,
    capability::{CAPABILITY_VIOLATION, Capability, CapabilitySet},
    config::SessionConfig,
    error::{BridgeMisuse, EngineError, ErrorKind, RunError, RuntimeCause},
    events::{CallerKind, DialogService, EventSink, HostEvent, HostEventKind, RunId, RunOutcome},
    format::{display_value, format_general, render_table},
    host::ScriptHost,
    introspect::{DebugSnapshot, FrameEntry, STACKTRACE_DELIMITER, SnapshotError, WatchEntry},
    io::{CollectStringPrint, PrintWriter, print_args, write_args},
    locator::{Located, locate, sentinel},
    mailbox::{Cancelled, InteractiveChannel, Mailbox, Reply},
    session::{FileMode, InterpreterSession, RunMode, SNAPSHOT_UNAVAILABLE, read_script},
    session_manager::{SessionError, SessionManager, ViewInfo},
    worker::{ExecutionRequest, ExecutionWorker, Payload, RunState, WorkerState, spawn as spawn_worker},
};
