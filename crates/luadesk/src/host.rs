//! UI-side controller for one script-capable view.
//!
//! [`ScriptHost`] lives on the thread that owns the view. It opens the
//! session, refuses overlapping runs, spawns a worker per run, answers the
//! worker's interactive requests through a [`DialogService`], and applies the
//! terminal event. It never blocks on a lock the worker may hold: the session,
//! the run flags and the mailbox are all accessed with `try_lock` from here,
//! and work that meets contention is retried from [`ScriptHost::pump`].
//!
//! Each run gets a fresh [`RunId`]. Only events stamped with the current run
//! are acted on, so leftovers of an earlier run, or of an earlier host that
//! used the same view label, can never answer a dialog or end a run.
//!
//! Closing never waits on the worker for longer than the configured close
//! timeout. A worker that has not stopped by then is detached; it keeps its
//! handle on the session, which is released when the worker exits.

use std::{
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    bridge::BridgeContext,
    config::SessionConfig,
    error::{EngineError, RunError},
    events::{CallerKind, DialogService, EventSink, HostEvent, HostEventKind, RunId, RunOutcome},
    introspect::DebugSnapshot,
    mailbox::{InteractiveChannel, Reply},
    session::InterpreterSession,
    worker::{self, ExecutionRequest, Payload, RunState, WorkerState},
};

/// Sleep between checks while `close` waits for a worker.
const CLOSE_POLL: Duration = Duration::from_millis(5);

/// Per-view owner of a session and its runs.
pub struct ScriptHost {
    config: SessionConfig,
    session: Arc<Mutex<InterpreterSession>>,
    bridge: Arc<BridgeContext>,
    channel: Arc<InteractiveChannel>,
    run_state: Arc<Mutex<RunState>>,
    worker: Option<JoinHandle<WorkerState>>,
    current_run: Option<RunId>,
    pending_reply: Option<Reply>,
    pending_finish: bool,
    closed: bool,
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("view", self.bridge.view())
            .field("caller", &self.bridge.caller())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ScriptHost {
    /// Opens a session for the view labelled `view`.
    ///
    /// # Errors
    /// Returns [`EngineError::Allocation`] when the interpreter cannot be created.
    pub fn open(
        view: impl Into<Arc<str>>,
        caller: CallerKind,
        config: SessionConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        let channel = Arc::new(InteractiveChannel::new(config.poll_quantum()));
        let bridge = Arc::new(BridgeContext::new(view, caller, sink, Arc::clone(&channel), &config));
        let session = InterpreterSession::open(config.clone(), Arc::clone(&bridge))?;
        Ok(Self {
            config,
            session: Arc::new(Mutex::new(session)),
            bridge,
            channel,
            run_state: Arc::new(Mutex::new(RunState::default())),
            worker: None,
            current_run: None,
            pending_reply: None,
            pending_finish: false,
            closed: false,
        })
    }

    #[must_use]
    pub fn view(&self) -> &Arc<str> {
        self.bridge.view()
    }

    #[must_use]
    pub fn caller(&self) -> CallerKind {
        self.bridge.caller()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a run of `source` on a new worker.
    ///
    /// # Errors
    /// [`RunError::AlreadyRunning`] while a worker is active (the new run is
    /// not queued), [`RunError::Aborted`] while a stopped run is still
    /// finishing, [`RunError::Spawn`] when no thread could be created, and
    /// [`RunError::Closed`] after [`close`](Self::close).
    pub fn run(&mut self, source: &str) -> Result<(), RunError> {
        self.start(Payload::Source(source.as_bytes().to_vec()))
    }

    /// Starts a run of the script file at `path` on a new worker.
    ///
    /// The file is read on the worker. Its chunk is named after the path, and
    /// `require` also searches `working_dir` (or the file's directory) while
    /// it runs. Read failures arrive as a failed [`RunOutcome`].
    ///
    /// # Errors
    /// As [`run`](Self::run).
    pub fn run_file(&mut self, path: &Path, working_dir: Option<&Path>) -> Result<(), RunError> {
        self.start(Payload::File {
            path: path.to_path_buf(),
            working_dir: working_dir.map(Path::to_path_buf),
        })
    }

    /// Run whose events this host currently acts on.
    #[must_use]
    pub fn current_run(&self) -> Option<RunId> {
        self.current_run
    }

    /// `true` when `event` was posted by this host's current run.
    #[must_use]
    pub fn owns(&self, event: &HostEvent) -> bool {
        self.current_run == Some(event.run) && event.view == *self.bridge.view()
    }

    fn start(&mut self, payload: Payload) -> Result<(), RunError> {
        if self.closed {
            return Err(RunError::Closed);
        }
        let Some(mut state) = self.run_state.try_lock() else {
            return Err(RunError::AlreadyRunning);
        };
        if state.running {
            return Err(if state.aborted {
                RunError::Aborted
            } else {
                RunError::AlreadyRunning
            });
        }
        if let Some(previous) = self.worker.take() {
            // Finished already; the terminal event was applied.
            let _ = previous.join();
        }

        state.running = true;
        state.aborted = false;
        let request = ExecutionRequest::with_payload(
            payload,
            Arc::clone(&self.session),
            Arc::clone(&self.bridge),
            Arc::clone(&self.run_state),
        );
        let run = request.run_id();
        match worker::spawn(request) {
            Ok(handle) => {
                tracing::info!(view = %self.bridge.view(), %run, "run started");
                self.worker = Some(handle);
                self.current_run = Some(run);
                Ok(())
            }
            Err(err) => {
                state.running = false;
                Err(err)
            }
        }
    }

    /// Marks the active run as aborted. Returns `false` when nothing is running.
    ///
    /// The worker is not interrupted; its output is flagged as aborted and new
    /// runs are refused until it finishes.
    pub fn stop(&mut self) -> bool {
        match self.run_state.try_lock() {
            Some(mut state) if state.running => {
                state.aborted = true;
                tracing::info!(view = %self.bridge.view(), "run stopped");
                true
            }
            _ => false,
        }
    }

    /// `true` while a worker is active. Contention counts as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run_state.try_lock().is_none_or(|state| state.running)
    }

    /// Applies one event addressed to this view.
    ///
    /// Interactive requests are answered through `dialogs`; the terminal event
    /// resets the run flags and returns the outcome. Output, clear, error and
    /// snapshot events are rendering concerns of the caller and pass through.
    /// Events from any run but the current one are ignored.
    pub fn handle_event(&mut self, event: &HostEvent, dialogs: &mut dyn DialogService) -> Option<RunOutcome> {
        if !self.owns(event) {
            tracing::debug!(view = %event.view, run = %event.run, "event from a stale run ignored");
            return None;
        }
        match &event.kind {
            HostEventKind::Read { prompt } => {
                let text = dialogs.read_text(prompt).unwrap_or_default();
                self.deliver(Reply::Text(text));
                None
            }
            HostEventKind::Message {
                text,
                is_question: true,
            } => {
                let yes = dialogs.ask(text);
                self.deliver(Reply::Answer(yes));
                None
            }
            HostEventKind::Message {
                text,
                is_question: false,
            } => {
                dialogs.alert(text);
                self.deliver(Reply::Acknowledged);
                None
            }
            HostEventKind::Finished(outcome) => {
                self.current_run = None;
                let mut outcome = outcome.clone();
                outcome.aborted |= self.finish_run();
                tracing::info!(view = %self.bridge.view(), ok = outcome.ok, aborted = outcome.aborted, "run finished");
                Some(outcome)
            }
            HostEventKind::Print(_)
            | HostEventKind::Clear
            | HostEventKind::ErrorOutput { .. }
            | HostEventKind::Snapshot(_) => None,
        }
    }

    /// Retries work that met lock contention. Call from the UI loop.
    pub fn pump(&mut self) {
        if let Some(reply) = self.pending_reply.take() {
            self.deliver(reply);
        }
        if self.pending_finish {
            self.finish_run();
        }
    }

    /// Runs `f` with the session if no worker holds it.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut InterpreterSession) -> R) -> Option<R> {
        self.session.try_lock().map(|mut session| f(&mut session))
    }

    /// Turns debug snapshots on or off. Returns `false` while a run holds the session.
    pub fn set_debugging(&self, enabled: bool) -> bool {
        self.with_session(|session| session.set_debugging(enabled)).is_some()
    }

    /// Latest debug snapshot, parsed. `None` on contention, when no snapshot
    /// was taken, or when the last one was unavailable.
    #[must_use]
    pub fn latest_snapshot(&self) -> Option<DebugSnapshot> {
        let text = self.bridge.try_latest_snapshot()?;
        DebugSnapshot::parse(&text).ok()
    }

    /// Releases any waiting worker, waits for it up to the close timeout, and
    /// closes the session. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current_run = None;
        self.channel.shutdown();
        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + self.config.close_timeout();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(CLOSE_POLL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(view = %self.bridge.view(), "worker thread panicked");
                }
            } else {
                tracing::warn!(
                    view = %self.bridge.view(),
                    timeout_ms = self.config.close_timeout_ms,
                    "worker did not stop in time; detached"
                );
            }
        }
        match self.session.try_lock() {
            Some(mut session) => session.close(),
            None => tracing::debug!(view = %self.bridge.view(), "session released when the detached worker exits"),
        }
        tracing::info!(view = %self.bridge.view(), "script host closed");
    }

    fn deliver(&mut self, reply: Reply) {
        if !self.channel.try_reply(&reply) {
            tracing::debug!(view = %self.bridge.view(), "mailbox busy; reply deferred");
            self.pending_reply = Some(reply);
        }
    }

    /// Clears the run flags; returns whether the run had been aborted.
    fn finish_run(&mut self) -> bool {
        let Some(mut state) = self.run_state.try_lock() else {
            self.pending_finish = true;
            return false;
        };
        let aborted = state.aborted;
        *state = RunState::default();
        drop(state);
        self.pending_finish = false;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        aborted
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.close();
    }
}
