//! One embedded interpreter state per script-capable view.
//!
//! [`InterpreterSession`] owns the Lua state for as long as the view lives. It
//! is created and closed on the UI thread but runs guest code on a worker
//! thread; the [`ScriptHost`](crate::ScriptHost) keeps it behind a mutex so
//! only one run can touch it at a time.
//!
//! Every run goes through [`guard_fault`], the single place where a Rust panic
//! raised while servicing guest code is turned into a runtime error.

use std::{
    any::Any,
    fs,
    io::{Read as _, Write},
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashSet;
use mlua::{
    DebugEvent, Error as LuaError, Function, HookTriggers, Lua, LuaOptions, StdLib, Table, Value, VmState,
};
use parking_lot::Mutex;

use crate::{
    bootstrap::run_bootstrap,
    bridge::{self, BridgeContext},
    capability::{CAPABILITY_VIOLATION, GUEST_DEBUG_FUNCTIONS, PermissionDenied},
    config::SessionConfig,
    error::{BridgeMisuse, EngineError, ErrorKind, RuntimeCause},
    events::{CallerKind, HostEventKind},
    introspect::{IntrospectLimits, Introspector, SnapshotError},
    locator::{Located, locate},
    mailbox::Cancelled,
};

/// Instructions between two checks of the shutdown flag.
const SHUTDOWN_CHECK_INSTRUCTIONS: u32 = 1000;

/// Text shown in place of a snapshot that could not be produced.
pub const SNAPSHOT_UNAVAILABLE: &str = "unavailable";

/// How [`InterpreterSession::run_script_string`] treats the chunk.
pub enum RunMode<'a> {
    /// Load and execute the chunk.
    Execute,
    /// Load the chunk and write its stripped bytecode; nothing is executed.
    Compile(&'a mut dyn Write),
}

/// How [`InterpreterSession::run_script_file`] treats the file.
#[derive(Debug, Clone, Copy)]
pub enum FileMode<'a> {
    /// Load and execute the file.
    Execute,
    /// Compile the file and write its stripped bytecode to `out_path`.
    Compile {
        /// Destination of the bytecode.
        out_path: &'a Path,
    },
}

/// Embedded interpreter state plus the error state of its last run.
pub struct InterpreterSession {
    lua: Option<Lua>,
    config: SessionConfig,
    bridge: Arc<BridgeContext>,
    bridge_functions: Vec<&'static str>,
    getlocal: Option<Function>,
    debugging: bool,
    ok: bool,
    last_error: String,
    last_error_wide: Vec<u16>,
    err_line: Option<usize>,
    error_kind: Option<ErrorKind>,
}

impl std::fmt::Debug for InterpreterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterSession")
            .field("open", &self.lua.is_some())
            .field("caller", &self.bridge.caller())
            .field("debugging", &self.debugging)
            .field("ok", &self.ok)
            .field("err_line", &self.err_line)
            .finish_non_exhaustive()
    }
}

impl InterpreterSession {
    /// Creates the interpreter, registers the bridges and runs the bootstrap script.
    ///
    /// Nothing is observable when this fails: the partly built state is dropped.
    ///
    /// # Errors
    /// Returns [`EngineError::Allocation`] when the interpreter cannot be
    /// created, its memory limit cannot be applied, or bootstrapping fails.
    pub fn open(config: SessionConfig, bridge: Arc<BridgeContext>) -> Result<Self, EngineError> {
        let libs = if config.standard_libraries {
            StdLib::ALL_SAFE | StdLib::DEBUG
        } else {
            StdLib::DEBUG
        };
        let lua = panic::catch_unwind(|| {
            // SAFETY: the debug library is loaded only so `debug.getlocal` can be
            // captured for snapshots; guests never get native-code loading.
            unsafe { Lua::unsafe_new_with(libs, LuaOptions::new()) }
        })
        .map_err(|payload| EngineError::Allocation(format!("cannot create interpreter: {}", panic_message(&*payload))))?;

        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit)
                .map_err(|err| EngineError::Allocation(format!("cannot apply memory limit: {err}")))?;
        }

        let getlocal = capture_getlocal(&lua, config.standard_libraries)
            .map_err(|err| EngineError::Allocation(format!("cannot capture introspection hooks: {err}")))?;
        let bridge_functions = bridge::register(&lua, &bridge)
            .map_err(|err| EngineError::Allocation(format!("cannot register bridge functions: {err}")))?;
        let channel = Arc::clone(bridge.channel());
        lua.create_function(move |_, ()| Ok(channel.is_shut_down()))
            .and_then(|stopping| run_bootstrap(&lua, stopping))
            .map_err(|err| EngineError::Allocation(format!("bootstrap failed: {err}")))?;

        tracing::info!(
            view = %bridge.view(),
            caller = %bridge.caller(),
            bridges = bridge_functions.len(),
            "interpreter session opened"
        );

        Ok(Self {
            lua: Some(lua),
            debugging: config.debugging,
            config,
            bridge,
            bridge_functions,
            getlocal,
            ok: true,
            last_error: String::new(),
            last_error_wide: Vec::new(),
            err_line: None,
            error_kind: None,
        })
    }

    /// `false` once the last run failed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// `false` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lua.is_some()
    }

    #[must_use]
    pub fn caller(&self) -> CallerKind {
        self.bridge.caller()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bridge context shared with the registered functions.
    #[must_use]
    pub fn bridge(&self) -> &Arc<BridgeContext> {
        &self.bridge
    }

    /// Qualified names of the registered host bridge functions.
    #[must_use]
    pub fn bridge_functions(&self) -> &[&'static str] {
        &self.bridge_functions
    }

    /// Turns debug snapshots on or off for subsequent runs.
    pub fn set_debugging(&mut self, enabled: bool) {
        self.debugging = enabled;
    }

    #[must_use]
    pub fn is_debugging(&self) -> bool {
        self.debugging
    }

    /// Runs or compiles a chunk held in memory.
    ///
    /// On failure the located line and the cleaned message are stored on the
    /// session (see [`last_error`](Self::last_error)) and returned.
    ///
    /// # Errors
    /// [`EngineError::Syntax`] when the chunk does not load,
    /// [`EngineError::Runtime`] when it fails while executing,
    /// [`EngineError::File`] when compiled output cannot be written,
    /// [`EngineError::Closed`] after [`close`](Self::close).
    pub fn run_script_string(&mut self, source: &[u8], mode: RunMode<'_>) -> Result<(), EngineError> {
        let chunk_name = format!("={}", self.config.chunk_name);
        self.run_chunk(source, &chunk_name, mode)
    }

    /// Reads a script file and runs or compiles it.
    ///
    /// The file must be non-empty and no larger than the configured limit.
    /// While it runs, `require` also searches `working_dir`, or the file's own
    /// directory when no override is given; the search path is restored
    /// afterwards and the process working directory is never changed.
    ///
    /// # Errors
    /// [`EngineError::File`] for unreadable, empty or oversized files and
    /// unwritable output, otherwise as [`run_script_string`](Self::run_script_string).
    pub fn run_script_file(
        &mut self,
        path: &Path,
        working_dir: Option<&Path>,
        mode: FileMode<'_>,
    ) -> Result<(), EngineError> {
        let source = match read_script(path, self.config.max_script_bytes) {
            Ok(source) => source,
            Err(err) => {
                self.record_failure(&err);
                return Err(err);
            }
        };
        let chunk_name = format!("@{}", path.display());
        let search_dir = working_dir
            .map(Path::to_path_buf)
            .or_else(|| path.parent().map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty());

        let _scope = match (&self.lua, search_dir) {
            (Some(lua), Some(dir)) => SearchPathScope::enter(lua, &dir),
            _ => None,
        };

        match mode {
            FileMode::Execute => self.run_chunk(&source, &chunk_name, RunMode::Execute),
            FileMode::Compile { out_path } => {
                let mut bytecode = Vec::new();
                self.run_chunk(&source, &chunk_name, RunMode::Compile(&mut bytecode))?;
                fs::write(out_path, &bytecode).map_err(|err| {
                    let err = EngineError::File(format!("cannot write {}: {err}", out_path.display()));
                    self.record_failure(&err);
                    err
                })?;
                tracing::debug!(path = %out_path.display(), bytes = bytecode.len(), "bytecode written");
                Ok(())
            }
        }
    }

    /// Parses raw interpreter error text into a 0-based line and a cleaned message.
    #[must_use]
    pub fn line_number(raw: &str) -> Located {
        locate(raw)
    }

    /// 0-based line of the last error.
    #[must_use]
    pub fn err_line(&self) -> Option<usize> {
        self.err_line
    }

    /// Overrides the line of the last error, for errors located by the host.
    pub fn set_err_line(&mut self, line: Option<usize>) {
        self.err_line = line;
    }

    /// Cleaned message of the last error; empty after a successful run.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// UTF-16 encoding of [`last_error`](Self::last_error) for wide-string UIs.
    #[must_use]
    pub fn last_error_wide(&self) -> &[u16] {
        &self.last_error_wide
    }

    /// Category of the last error.
    #[must_use]
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Names of the raw globals currently defined, sorted.
    ///
    /// # Errors
    /// Returns [`EngineError::Closed`] after [`close`](Self::close).
    pub fn global_names(&self) -> Result<Vec<String>, EngineError> {
        let lua = self.lua.as_ref().ok_or(EngineError::Closed)?;
        let mut names: Vec<String> = raw_global_names(lua).into_iter().collect();
        names.sort();
        Ok(names)
    }

    /// Returns `true` when `source` is an incomplete chunk, such as an open `function` block.
    #[must_use]
    pub fn needs_more_input(&self, source: &str) -> bool {
        let Some(lua) = self.lua.as_ref() else {
            return false;
        };
        matches!(
            lua.load(source).set_name("=input").into_function(),
            Err(LuaError::SyntaxError {
                incomplete_input: true,
                ..
            })
        )
    }

    /// Latest debug snapshot text; `None` on contention or when none was taken.
    #[must_use]
    pub fn latest_snapshot(&self) -> Option<String> {
        self.bridge.try_latest_snapshot()
    }

    /// Number of guest sockets still open.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.bridge.socket_count()
    }

    /// Releases the sockets and the interpreter. Idempotent.
    pub fn close(&mut self) {
        let released = self.bridge.release_sockets();
        if let Some(lua) = self.lua.take() {
            drop(lua);
            tracing::info!(view = %self.bridge.view(), sockets = released, "interpreter session closed");
        }
    }

    fn run_chunk(&mut self, source: &[u8], chunk_name: &str, mode: RunMode<'_>) -> Result<(), EngineError> {
        self.clear_error();
        let Some(lua) = self.lua.as_ref() else {
            self.record_failure(&EngineError::Closed);
            return Err(EngineError::Closed);
        };
        self.bridge.begin_run();

        let stream = if self.debugging {
            match &self.getlocal {
                Some(getlocal) => Some(SnapshotStream::new(
                    Introspector::new(
                        getlocal.clone(),
                        Arc::new(raw_global_names(lua)),
                        limits(&self.config),
                    ),
                    Arc::clone(&self.bridge),
                    self.config.snapshot_interval(),
                )),
                None => {
                    tracing::warn!(error = %SnapshotError::Unavailable, "debugging requested");
                    self.bridge.post(HostEventKind::Snapshot(SNAPSHOT_UNAVAILABLE.to_owned()));
                    None
                }
            }
        } else {
            None
        };

        let started = Instant::now();
        let bridge = Arc::clone(&self.bridge);
        let result = guard_fault(|| match mode {
            RunMode::Execute => execute(lua, source, chunk_name, &bridge, stream),
            RunMode::Compile(out) => compile(lua, source, chunk_name, out),
        });
        tracing::debug!(
            chunk = chunk_name,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis(),
            "chunk finished"
        );

        if let Err(err) = &result {
            self.record_failure(err);
        }
        result
    }

    fn clear_error(&mut self) {
        self.ok = true;
        self.last_error.clear();
        self.last_error_wide.clear();
        self.err_line = None;
        self.error_kind = None;
    }

    fn record_failure(&mut self, err: &EngineError) {
        self.ok = false;
        self.last_error = err.to_string();
        self.last_error_wide = self.last_error.encode_utf16().collect();
        self.err_line = err.line();
        self.error_kind = Some(err.kind());
    }
}

impl Drop for InterpreterSession {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Execution
// =============================================================================

fn execute(
    lua: &Lua,
    source: &[u8],
    chunk_name: &str,
    bridge: &Arc<BridgeContext>,
    stream: Option<SnapshotStream>,
) -> Result<(), EngineError> {
    let function = lua
        .load(source)
        .set_name(chunk_name)
        .into_function()
        .map_err(|err| syntax_error(&err))?;
    let _hook = HookGuard::install(lua, bridge, stream);
    function.call::<()>(()).map_err(|err| runtime_error(&err))
}

fn compile(lua: &Lua, source: &[u8], chunk_name: &str, out: &mut dyn Write) -> Result<(), EngineError> {
    let function = lua
        .load(source)
        .set_name(chunk_name)
        .into_function()
        .map_err(|err| syntax_error(&err))?;
    let bytecode = function.dump(true);
    out.write_all(&bytecode)
        .and_then(|()| out.flush())
        .map_err(|err| EngineError::File(format!("cannot write bytecode: {err}")))
}

/// Runs `f`, converting a panic into an [`RuntimeCause::InternalFault`] error.
fn guard_fault<T>(f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = format!("internal fault: {}", panic_message(&*payload));
        tracing::error!(%message, "panic while running guest code");
        Err(EngineError::Runtime {
            message,
            line: None,
            cause: RuntimeCause::InternalFault,
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn syntax_error(err: &LuaError) -> EngineError {
    let Located { line, message } = locate(&raw_message(err));
    EngineError::Syntax { message, line }
}

fn runtime_error(err: &LuaError) -> EngineError {
    let Located { line, message } = locate(&raw_message(err));
    EngineError::Runtime {
        message,
        line,
        cause: classify(err),
    }
}

/// Innermost error text without mlua's callback wrapping.
fn raw_message(err: &LuaError) -> String {
    match err {
        LuaError::RuntimeError(message) | LuaError::MemoryError(message) => message.clone(),
        LuaError::SyntaxError { message, .. } => message.clone(),
        LuaError::CallbackError { cause, .. } | LuaError::WithContext { cause, .. } => raw_message(cause),
        LuaError::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

fn classify(err: &LuaError) -> RuntimeCause {
    match err {
        LuaError::CallbackError { cause, .. } | LuaError::WithContext { cause, .. } => classify(cause),
        LuaError::ExternalError(inner) => {
            if inner.downcast_ref::<BridgeMisuse>().is_some() {
                RuntimeCause::HostBridgeMisuse
            } else if inner.downcast_ref::<PermissionDenied>().is_some() {
                RuntimeCause::CapabilityViolation
            } else if inner.downcast_ref::<Cancelled>().is_some() {
                RuntimeCause::InternalFault
            } else {
                RuntimeCause::Guest
            }
        }
        LuaError::RuntimeError(message) if message.contains(CAPABILITY_VIOLATION) => RuntimeCause::CapabilityViolation,
        _ => RuntimeCause::Guest,
    }
}

// =============================================================================
// Hooks and introspection
// =============================================================================

/// Takes `debug.getlocal` for snapshots and leaves the guest at most the
/// read-only part of the debug library.
fn capture_getlocal(lua: &Lua, keep_debug: bool) -> mlua::Result<Option<Function>> {
    let globals = lua.globals();
    let Some(debug) = globals.get::<Option<Table>>("debug")? else {
        return Ok(None);
    };
    let getlocal = debug.get::<Option<Function>>("getlocal")?;
    if keep_debug {
        let visible = lua.create_table()?;
        for name in GUEST_DEBUG_FUNCTIONS {
            visible.raw_set(*name, debug.get::<Value>(*name)?)?;
        }
        globals.raw_set("debug", visible)?;
    } else {
        globals.raw_set("debug", Value::Nil)?;
    }
    Ok(getlocal)
}

fn raw_global_names(lua: &Lua) -> AHashSet<String> {
    lua.globals()
        .pairs::<Value, Value>()
        .filter_map(Result::ok)
        .filter_map(|(key, _)| match key {
            Value::String(name) => Some(name.to_string_lossy()),
            _ => None,
        })
        .collect()
}

fn limits(config: &SessionConfig) -> IntrospectLimits {
    IntrospectLimits {
        max_entries: config.max_watch_entries,
        max_depth: config.max_stack_depth,
        string_width: config.max_string_width,
        capacity: config.snapshot_capacity,
    }
}

/// Throttled snapshot capture driven by the line hook.
struct SnapshotStream {
    introspector: Introspector,
    bridge: Arc<BridgeContext>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl SnapshotStream {
    fn new(introspector: Introspector, bridge: Arc<BridgeContext>, interval: Duration) -> Self {
        Self {
            introspector,
            bridge,
            interval,
            last: Mutex::new(None),
        }
    }

    fn on_line(&self, lua: &Lua) {
        {
            let mut last = self.last.lock();
            if last.is_some_and(|at| at.elapsed() < self.interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        let text = match self.introspector.dump(lua) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "debug snapshot abandoned");
                SNAPSHOT_UNAVAILABLE.to_owned()
            }
        };
        self.bridge.store_snapshot(text.clone());
        self.bridge.post(HostEventKind::Snapshot(text));
    }
}

/// Hook installed for the duration of one execution.
///
/// Always watches the shutdown flag; with a snapshot stream it also fires on
/// every new line.
struct HookGuard<'lua> {
    lua: &'lua Lua,
}

impl<'lua> HookGuard<'lua> {
    fn install(lua: &'lua Lua, bridge: &Arc<BridgeContext>, stream: Option<SnapshotStream>) -> Self {
        let channel = Arc::clone(bridge.channel());
        let mut triggers = HookTriggers::new().every_nth_instruction(SHUTDOWN_CHECK_INSTRUCTIONS);
        if stream.is_some() {
            triggers = triggers.every_line();
        }
        lua.set_hook(triggers, move |lua, debug| {
            if channel.is_shut_down() {
                return Err(LuaError::external(Cancelled));
            }
            if let Some(stream) = &stream
                && matches!(debug.event(), DebugEvent::Line)
            {
                stream.on_line(lua);
            }
            Ok(VmState::Continue)
        });
        Self { lua }
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.lua.remove_hook();
    }
}

// =============================================================================
// Script files
// =============================================================================

/// Reads a script file, refusing empty files and files over `max_bytes`.
///
/// # Errors
/// Returns [`EngineError::File`] describing the problem.
pub fn read_script(path: &Path, max_bytes: usize) -> Result<Vec<u8>, EngineError> {
    let file_error = |err: std::io::Error| EngineError::File(format!("cannot read {}: {err}", path.display()));
    let file = fs::File::open(path).map_err(file_error)?;
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    let mut source = Vec::new();
    file.take(limit.saturating_add(1))
        .read_to_end(&mut source)
        .map_err(file_error)?;
    if source.len() > max_bytes {
        return Err(EngineError::File(format!(
            "{} is larger than the {max_bytes} byte limit",
            path.display()
        )));
    }
    if source.is_empty() {
        return Err(EngineError::File(format!("{} is empty", path.display())));
    }
    Ok(source)
}

/// Prepends a directory to `package.path` and restores the old value on drop.
struct SearchPathScope {
    package: Table,
    previous: String,
}

impl SearchPathScope {
    fn enter(lua: &Lua, dir: &Path) -> Option<Self> {
        let package = lua.globals().get::<Option<Table>>("package").ok().flatten()?;
        let previous = package.get::<Option<String>>("path").ok().flatten().unwrap_or_default();
        let dir = dir.display();
        let scoped = format!("{dir}/?.lua;{dir}/?/init.lua;{previous}");
        if let Err(err) = package.set("path", scoped) {
            tracing::warn!(error = %err, "cannot scope package.path");
            return None;
        }
        Some(Self { package, previous })
    }
}

impl Drop for SearchPathScope {
    fn drop(&mut self) {
        if let Err(err) = self.package.set("path", self.previous.as_str()) {
            tracing::warn!(error = %err, "cannot restore package.path");
        }
    }
}
