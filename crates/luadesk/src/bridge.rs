//! Host bridge functions exposed to guest code.
//!
//! | Guest name | Effect | Capability |
//! |------------|--------|------------|
//! | `print(...)` | print event, args joined by three spaces, trailing newline | - |
//! | `io.write(...)` | print event, args concatenated | - |
//! | `cls()` | clear event | - |
//! | `io.read([fmt])` | read request, blocks for the text | interactive |
//! | `gui.alert(msg)` | message event, blocks until acknowledged | interactive |
//! | `gui.ask(msg)` | question event, returns `1` or `0` | interactive |
//! | `time.tic/toc/elapsed/sleep` | timer marks | timers |
//! | `socket.new/connect/send/receive/error/delete` | TCP sockets | sockets |
//!
//! Every function is registered when the session opens; gated functions check
//! the capability set on each call. Wrong arity or argument types raise a
//! [`BridgeMisuse`] carrying the guest line of the call site.

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use mlua::{Error as LuaError, FromLuaMulti, IntoLuaMulti, Lua, MaybeSend, Table, Value, Variadic};
use parking_lot::Mutex;

use crate::{
    capability::{Capability, CapabilitySet},
    config::SessionConfig,
    error::BridgeMisuse,
    events::{CallerKind, EventSink, HostEvent, HostEventKind, RunId},
    format::display_value,
    io::{CollectStringPrint, print_args, write_args},
    mailbox::{Cancelled, InteractiveChannel},
    sockets::SocketRegistry,
};

/// Bytes returned by `socket.receive` when no maximum is given.
pub const DEFAULT_RECEIVE_BYTES: usize = 4096;

/// Mutable bridge state, owned by the worker while a run is active.
#[derive(Debug, Default)]
pub struct BridgeState {
    sockets: SocketRegistry,
    run_started: Option<Instant>,
    tic: Option<Instant>,
    partial_line: String,
    committed: String,
    latest_snapshot: Option<String>,
}

impl BridgeState {
    fn commit_output(&mut self, text: &str) {
        self.partial_line.push_str(text);
        if let Some(line) = self
            .partial_line
            .lines()
            .rev()
            .map(str::trim_end)
            .find(|line| !line.is_empty())
        {
            self.committed = line.to_owned();
        }
        if let Some(end) = self.partial_line.rfind('\n') {
            self.partial_line.drain(..=end);
        }
    }

    fn clear_output(&mut self) {
        self.partial_line.clear();
        self.committed.clear();
    }

    fn since_run_start(&self) -> Duration {
        self.run_started.map(|start| start.elapsed()).unwrap_or_default()
    }
}

/// Everything a bridge function needs, shared by all registered closures.
pub struct BridgeContext {
    view: Arc<str>,
    caller: CallerKind,
    sink: Arc<dyn EventSink>,
    channel: Arc<InteractiveChannel>,
    capabilities: CapabilitySet,
    socket_timeout: Duration,
    run: Mutex<RunId>,
    state: Mutex<BridgeState>,
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("view", &self.view)
            .field("caller", &self.caller)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl BridgeContext {
    #[must_use]
    pub fn new(
        view: impl Into<Arc<str>>,
        caller: CallerKind,
        sink: Arc<dyn EventSink>,
        channel: Arc<InteractiveChannel>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            view: view.into(),
            caller,
            sink,
            channel,
            capabilities: config.capabilities.clone(),
            socket_timeout: config.socket_timeout(),
            run: Mutex::new(RunId::default()),
            state: Mutex::new(BridgeState::default()),
        }
    }

    #[must_use]
    pub fn view(&self) -> &Arc<str> {
        &self.view
    }

    #[must_use]
    pub fn caller(&self) -> CallerKind {
        self.caller
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<InteractiveChannel> {
        &self.channel
    }

    /// Posts an event addressed to this context's view.
    pub fn post(&self, kind: HostEventKind) {
        let run = *self.run.lock();
        self.sink.post(HostEvent {
            view: Arc::clone(&self.view),
            caller: self.caller,
            run,
            kind,
        });
    }

    /// Stamps subsequent events with `run`.
    pub fn enter_run(&self, run: RunId) {
        *self.run.lock() = run;
    }

    /// Run currently stamped on posted events.
    #[must_use]
    pub fn current_run(&self) -> RunId {
        *self.run.lock()
    }

    /// Resets the per-run marks and output tracking.
    pub fn begin_run(&self) {
        let mut state = self.state.lock();
        state.run_started = Some(Instant::now());
        state.tic = None;
        state.clear_output();
    }

    /// Last non-blank line of output produced in the current run.
    #[must_use]
    pub fn committed_output(&self) -> String {
        self.state.lock().committed.clone()
    }

    /// Latest rendered snapshot without blocking; `None` on contention or when none exists.
    #[must_use]
    pub fn try_latest_snapshot(&self) -> Option<String> {
        self.state.try_lock().and_then(|state| state.latest_snapshot.clone())
    }

    pub(crate) fn store_snapshot(&self, text: String) {
        self.state.lock().latest_snapshot = Some(text);
    }

    /// Closes every guest socket; returns how many were released.
    pub fn release_sockets(&self) -> usize {
        self.state.lock().sockets.clear()
    }

    /// Number of live guest sockets.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.state.lock().sockets.len()
    }

    fn emit_output(&self, text: String) {
        self.state.lock().commit_output(&text);
        self.post(HostEventKind::Print(text));
    }

    fn read_prompt(&self) -> String {
        let state = self.state.lock();
        if state.committed.trim_end().ends_with(':') {
            state.committed.clone()
        } else {
            String::new()
        }
    }

    fn require(&self, capability: Capability, function: &'static str) -> mlua::Result<()> {
        self.capabilities.check(capability, function).map_err(LuaError::external)
    }
}

// =============================================================================
// Registration
// =============================================================================

struct Registrar<'lua> {
    lua: &'lua Lua,
    names: Vec<&'static str>,
}

impl Registrar<'_> {
    fn define<A, R, F>(&mut self, table: &Table, qualified: &'static str, func: F) -> mlua::Result<()>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + MaybeSend + 'static,
    {
        let field = qualified.rsplit('.').next().unwrap_or(qualified);
        table.set(field, self.lua.create_function(func)?)?;
        self.names.push(qualified);
        Ok(())
    }
}

fn namespace(lua: &Lua, globals: &Table, name: &str) -> mlua::Result<Table> {
    if let Some(table) = globals.get::<Option<Table>>(name)? {
        return Ok(table);
    }
    let table = lua.create_table()?;
    globals.set(name, &table)?;
    Ok(table)
}

/// Installs every bridge function and returns their qualified names.
///
/// Must run before the bootstrap script locks the builtin tables.
pub fn register(lua: &Lua, ctx: &Arc<BridgeContext>) -> mlua::Result<Vec<&'static str>> {
    let globals = lua.globals();
    let io = namespace(lua, &globals, "io")?;
    let gui = namespace(lua, &globals, "gui")?;
    let time = namespace(lua, &globals, "time")?;
    let socket = namespace(lua, &globals, "socket")?;
    let mut reg = Registrar {
        lua,
        names: Vec::new(),
    };

    let c = Arc::clone(ctx);
    reg.define(&globals, "print", move |_, args: Variadic<Value>| {
        let mut out = CollectStringPrint::new();
        print_args(&mut out, &args);
        c.emit_output(out.into_output());
        Ok(())
    })?;

    let c = Arc::clone(ctx);
    reg.define(&io, "io.write", move |_, args: Variadic<Value>| {
        let mut out = CollectStringPrint::new();
        write_args(&mut out, &args);
        c.emit_output(out.into_output());
        Ok(())
    })?;

    let c = Arc::clone(ctx);
    reg.define(&globals, "cls", move |lua, args: Variadic<Value>| {
        expect_arity(lua, "cls", &args, 0)?;
        c.state.lock().clear_output();
        c.post(HostEventKind::Clear);
        Ok(())
    })?;

    let c = Arc::clone(ctx);
    reg.define(&io, "io.read", move |lua, args: Variadic<Value>| io_read(&c, lua, &args))?;

    let c = Arc::clone(ctx);
    reg.define(&gui, "gui.alert", move |lua, args: Variadic<Value>| {
        c.require(Capability::Interactive, "gui.alert")?;
        let text = message_arg(lua, "gui.alert", &args)?;
        c.channel
            .alert(|| {
                c.post(HostEventKind::Message {
                    text,
                    is_question: false,
                });
            })
            .map_err(LuaError::external)
    })?;

    let c = Arc::clone(ctx);
    reg.define(&gui, "gui.ask", move |lua, args: Variadic<Value>| {
        c.require(Capability::Interactive, "gui.ask")?;
        let text = message_arg(lua, "gui.ask", &args)?;
        let yes = c
            .channel
            .ask(|| {
                c.post(HostEventKind::Message {
                    text,
                    is_question: true,
                });
            })
            .map_err(LuaError::external)?;
        Ok(i64::from(yes))
    })?;

    register_timers(&mut reg, &time, ctx)?;
    register_sockets(&mut reg, &socket, ctx)?;

    tracing::debug!(count = reg.names.len(), view = %ctx.view, "bridge functions registered");
    Ok(reg.names)
}

fn io_read(ctx: &BridgeContext, lua: &Lua, args: &[Value]) -> mlua::Result<Value> {
    ctx.require(Capability::Interactive, "io.read")?;
    if args.len() > 1 {
        return Err(misuse(lua, "io.read", format!("expected at most 1 argument, got {}", args.len())));
    }
    let numeric = match args.first() {
        None | Some(Value::Nil) => false,
        Some(Value::String(format)) => match format.to_string_lossy().trim_start_matches('*') {
            "n" => true,
            "l" | "L" | "a" => false,
            other => return Err(misuse(lua, "io.read", format!("invalid format '{other}'"))),
        },
        Some(other) => {
            return Err(misuse(
                lua,
                "io.read",
                format!("expected a format string, got {}", other.type_name()),
            ));
        }
    };

    let prompt = ctx.read_prompt();
    let text = ctx
        .channel
        .read(|| ctx.post(HostEventKind::Read { prompt }))
        .map_err(LuaError::external)?;

    if numeric {
        Ok(parse_number(&text))
    } else {
        Ok(Value::String(lua.create_string(&text)?))
    }
}

fn parse_number(text: &str) -> Value {
    let text = text.trim();
    if let Ok(int) = text.parse::<i64>() {
        Value::Integer(int)
    } else if let Ok(num) = text.parse::<f64>() {
        Value::Number(num)
    } else {
        Value::Nil
    }
}

fn register_timers(reg: &mut Registrar<'_>, time: &Table, ctx: &Arc<BridgeContext>) -> mlua::Result<()> {
    let c = Arc::clone(ctx);
    reg.define(time, "time.tic", move |lua, args: Variadic<Value>| {
        c.require(Capability::Timers, "time.tic")?;
        expect_arity(lua, "time.tic", &args, 0)?;
        c.state.lock().tic = Some(Instant::now());
        Ok(())
    })?;

    let c = Arc::clone(ctx);
    reg.define(time, "time.toc", move |lua, args: Variadic<Value>| {
        c.require(Capability::Timers, "time.toc")?;
        expect_arity(lua, "time.toc", &args, 0)?;
        let state = c.state.lock();
        let elapsed = state.tic.map_or_else(|| state.since_run_start(), |tic| tic.elapsed());
        Ok(elapsed.as_secs_f64())
    })?;

    let c = Arc::clone(ctx);
    reg.define(time, "time.elapsed", move |lua, args: Variadic<Value>| {
        c.require(Capability::Timers, "time.elapsed")?;
        expect_arity(lua, "time.elapsed", &args, 0)?;
        Ok(c.state.lock().since_run_start().as_secs_f64())
    })?;

    let c = Arc::clone(ctx);
    reg.define(time, "time.sleep", move |lua, args: Variadic<Value>| {
        c.require(Capability::Timers, "time.sleep")?;
        expect_arity(lua, "time.sleep", &args, 1)?;
        let millis = integer_arg(lua, "time.sleep", &args, 0, "milliseconds")?;
        let millis = u64::try_from(millis).map_err(|_| misuse(lua, "time.sleep", "duration must not be negative"))?;
        sleep_interruptible(&c.channel, Duration::from_millis(millis)).map_err(LuaError::external)
    })?;

    Ok(())
}

/// Sleeps in polling quanta so a closing host is not kept waiting.
fn sleep_interruptible(channel: &InteractiveChannel, total: Duration) -> Result<(), Cancelled> {
    let deadline = Instant::now() + total;
    loop {
        if channel.is_shut_down() {
            return Err(Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(channel.quantum()));
    }
}

fn register_sockets(reg: &mut Registrar<'_>, socket: &Table, ctx: &Arc<BridgeContext>) -> mlua::Result<()> {
    let c = Arc::clone(ctx);
    reg.define(socket, "socket.new", move |lua, args: Variadic<Value>| {
        c.require(Capability::Sockets, "socket.new")?;
        expect_arity(lua, "socket.new", &args, 0)?;
        Ok(i64::from(c.state.lock().sockets.create()))
    })?;

    let c = Arc::clone(ctx);
    reg.define(socket, "socket.connect", move |lua, args: Variadic<Value>| {
        const NAME: &str = "socket.connect";
        c.require(Capability::Sockets, NAME)?;
        if !(3..=4).contains(&args.len()) {
            return Err(misuse(lua, NAME, format!("expected 3 or 4 arguments, got {}", args.len())));
        }
        let id = socket_id(lua, NAME, &args)?;
        let host = string_arg(lua, NAME, &args, 1, "host")?;
        let port = integer_arg(lua, NAME, &args, 2, "port")?;
        let port = u16::try_from(port).map_err(|_| misuse(lua, NAME, format!("port {port} out of range")))?;
        let timeout = match args.get(3) {
            None | Some(Value::Nil) => c.socket_timeout,
            Some(_) => {
                let millis = integer_arg(lua, NAME, &args, 3, "timeout")?;
                Duration::from_millis(u64::try_from(millis).unwrap_or(0).max(1))
            }
        };
        let mut state = c.state.lock();
        let entry = state.sockets.get_mut(id).ok_or_else(|| unknown_socket(lua, NAME, id))?;
        Ok(entry.connect(&host, port, timeout))
    })?;

    let c = Arc::clone(ctx);
    reg.define(socket, "socket.send", move |lua, args: Variadic<Value>| {
        const NAME: &str = "socket.send";
        c.require(Capability::Sockets, NAME)?;
        expect_arity(lua, NAME, &args, 2)?;
        let id = socket_id(lua, NAME, &args)?;
        let data = match &args[1] {
            Value::String(data) => data.as_bytes().to_vec(),
            number @ (Value::Integer(_) | Value::Number(_)) => display_value(number).into_bytes(),
            other => {
                return Err(misuse(
                    lua,
                    NAME,
                    format!("argument #2 (data) expected a string, got {}", other.type_name()),
                ));
            }
        };
        let mut state = c.state.lock();
        let entry = state.sockets.get_mut(id).ok_or_else(|| unknown_socket(lua, NAME, id))?;
        Ok(entry.send(&data).and_then(|sent| i64::try_from(sent).ok()))
    })?;

    let c = Arc::clone(ctx);
    reg.define(socket, "socket.receive", move |lua, args: Variadic<Value>| {
        const NAME: &str = "socket.receive";
        c.require(Capability::Sockets, NAME)?;
        if !(1..=2).contains(&args.len()) {
            return Err(misuse(lua, NAME, format!("expected 1 or 2 arguments, got {}", args.len())));
        }
        let id = socket_id(lua, NAME, &args)?;
        let max = match args.get(1) {
            None | Some(Value::Nil) => DEFAULT_RECEIVE_BYTES,
            Some(_) => {
                let max = integer_arg(lua, NAME, &args, 1, "max")?;
                usize::try_from(max).map_err(|_| misuse(lua, NAME, "max must not be negative"))?
            }
        };
        let received = {
            let mut state = c.state.lock();
            let entry = state.sockets.get_mut(id).ok_or_else(|| unknown_socket(lua, NAME, id))?;
            entry.receive(max)
        };
        match received {
            Some(bytes) => Ok(Value::String(lua.create_string(bytes)?)),
            None => Ok(Value::Nil),
        }
    })?;

    let c = Arc::clone(ctx);
    reg.define(socket, "socket.error", move |lua, args: Variadic<Value>| {
        const NAME: &str = "socket.error";
        c.require(Capability::Sockets, NAME)?;
        expect_arity(lua, NAME, &args, 1)?;
        let id = socket_id(lua, NAME, &args)?;
        let mut state = c.state.lock();
        let entry = state.sockets.get_mut(id).ok_or_else(|| unknown_socket(lua, NAME, id))?;
        Ok(entry.last_error().map(str::to_owned))
    })?;

    let c = Arc::clone(ctx);
    reg.define(socket, "socket.delete", move |lua, args: Variadic<Value>| {
        const NAME: &str = "socket.delete";
        c.require(Capability::Sockets, NAME)?;
        expect_arity(lua, NAME, &args, 1)?;
        let id = socket_id(lua, NAME, &args)?;
        if c.state.lock().sockets.delete(id) {
            Ok(true)
        } else {
            Err(unknown_socket(lua, NAME, id))
        }
    })?;

    Ok(())
}

// =============================================================================
// Argument helpers
// =============================================================================

/// 0-based guest line of the Lua code that called the running bridge function.
fn call_line(lua: &Lua) -> Option<usize> {
    let line = lua.inspect_stack(1)?.curr_line();
    usize::try_from(line).ok()?.checked_sub(1)
}

fn misuse(lua: &Lua, function: &'static str, detail: impl Into<String>) -> LuaError {
    LuaError::external(BridgeMisuse {
        function,
        detail: detail.into(),
        line: call_line(lua),
    })
}

fn unknown_socket(lua: &Lua, function: &'static str, id: u32) -> LuaError {
    misuse(lua, function, format!("unknown socket id {id}"))
}

fn expect_arity(lua: &Lua, function: &'static str, args: &[Value], expected: usize) -> mlua::Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        let plural = if expected == 1 { "" } else { "s" };
        Err(misuse(
            lua,
            function,
            format!("expected {expected} argument{plural}, got {}", args.len()),
        ))
    }
}

fn message_arg(lua: &Lua, function: &'static str, args: &[Value]) -> mlua::Result<String> {
    match args {
        [Value::String(text)] => Ok(text.to_string_lossy()),
        [number @ (Value::Integer(_) | Value::Number(_))] => Ok(display_value(number)),
        [other] => Err(misuse(
            lua,
            function,
            format!("expected a string, got {}", other.type_name()),
        )),
        _ => Err(misuse(lua, function, format!("expected 1 argument, got {}", args.len()))),
    }
}

fn integer_arg(lua: &Lua, function: &'static str, args: &[Value], index: usize, what: &str) -> mlua::Result<i64> {
    let position = index + 1;
    let Some(value) = args.get(index) else {
        return Err(misuse(lua, function, format!("missing argument #{position} ({what})")));
    };
    match lua.coerce_integer(value.clone())? {
        Some(int) => Ok(int),
        None => Err(misuse(
            lua,
            function,
            format!("argument #{position} ({what}) expected an integer, got {}", value.type_name()),
        )),
    }
}

fn string_arg(lua: &Lua, function: &'static str, args: &[Value], index: usize, what: &str) -> mlua::Result<String> {
    let position = index + 1;
    match args.get(index) {
        Some(Value::String(text)) => Ok(text.to_string_lossy()),
        Some(other) => Err(misuse(
            lua,
            function,
            format!("argument #{position} ({what}) expected a string, got {}", other.type_name()),
        )),
        None => Err(misuse(lua, function, format!("missing argument #{position} ({what})"))),
    }
}

fn socket_id(lua: &Lua, function: &'static str, args: &[Value]) -> mlua::Result<u32> {
    let id = integer_arg(lua, function, args, 0, "id")?;
    u32::try_from(id).map_err(|_| misuse(lua, function, format!("unknown socket id {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_output_tracks_last_non_blank_line() {
        let mut state = BridgeState::default();
        state.commit_output("hello\n");
        assert_eq!(state.committed, "hello");
        state.commit_output("Name:");
        assert_eq!(state.committed, "Name:");
        state.commit_output(" \n\n");
        assert_eq!(state.committed, "Name:");
        assert!(state.partial_line.is_empty());
        state.clear_output();
        assert_eq!(state.committed, "");
    }

    #[test]
    fn numbers_parse_as_integers_first() {
        assert_eq!(parse_number(" 42\n"), Value::Integer(42));
        assert_eq!(parse_number("2.5"), Value::Number(2.5));
        assert_eq!(parse_number("abc"), Value::Nil);
    }

    #[test]
    fn interrupted_sleep_reports_cancel() {
        let channel = InteractiveChannel::new(Duration::from_millis(1));
        channel.shutdown();
        assert_eq!(sleep_interruptible(&channel, Duration::from_secs(10)), Err(Cancelled));
    }
}
