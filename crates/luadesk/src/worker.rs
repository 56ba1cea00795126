//! One background thread per run.
//!
//! The worker owns a private copy of the script text (or the path of the
//! script file), locks the session for the whole run, and posts exactly one
//! [`HostEventKind::Finished`] before it exits, whether the guest succeeded,
//! failed, or something panicked. Every event it posts carries the run's
//! [`RunId`]. The payload copy is released before the terminal event is posted.

use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    bridge::BridgeContext,
    error::{ErrorKind, RunError},
    events::{HostEventKind, RunId, RunOutcome},
    session::{FileMode, InterpreterSession, RunMode},
};

/// Run flags shared by the view and its worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    /// A worker is active.
    pub running: bool,
    /// The view asked the active run to stop.
    pub aborted: bool,
}

/// What a worker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Chunk text held in memory.
    Source(Vec<u8>),
    /// Script file, read on the worker; `require` also searches `working_dir`.
    File {
        path: PathBuf,
        working_dir: Option<PathBuf>,
    },
}

impl Payload {
    fn is_blank(&self) -> bool {
        matches!(self, Self::Source(source) if source.iter().all(u8::is_ascii_whitespace))
    }
}

/// Everything a worker needs for one run.
pub struct ExecutionRequest {
    run: RunId,
    payload: Payload,
    session: Arc<Mutex<InterpreterSession>>,
    bridge: Arc<BridgeContext>,
    run_state: Arc<Mutex<RunState>>,
}

impl ExecutionRequest {
    /// Copies `source` so the caller's buffer can be reused immediately.
    #[must_use]
    pub fn new(
        source: &[u8],
        session: Arc<Mutex<InterpreterSession>>,
        bridge: Arc<BridgeContext>,
        run_state: Arc<Mutex<RunState>>,
    ) -> Self {
        Self::with_payload(Payload::Source(source.to_vec()), session, bridge, run_state)
    }

    /// Builds a request for `payload` under a fresh [`RunId`].
    #[must_use]
    pub fn with_payload(
        payload: Payload,
        session: Arc<Mutex<InterpreterSession>>,
        bridge: Arc<BridgeContext>,
        run_state: Arc<Mutex<RunState>>,
    ) -> Self {
        Self {
            run: RunId::next(),
            payload,
            session,
            bridge,
            run_state,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    FinishedOk,
    FinishedError,
}

/// Starts a worker for `request` on a named thread.
///
/// # Errors
/// Returns [`RunError::Spawn`] when the thread cannot be created. No event is
/// posted in that case; the request is dropped with the failed closure.
pub fn spawn(request: ExecutionRequest) -> Result<JoinHandle<WorkerState>, RunError> {
    let name = format!("luadesk-{}", request.bridge.view());
    thread::Builder::new()
        .name(name)
        .spawn(move || ExecutionWorker::new(request).run())
        .map_err(|err| {
            tracing::error!(error = %err, "cannot spawn worker thread");
            RunError::Spawn(err.to_string())
        })
}

/// A single run.
pub struct ExecutionWorker {
    state: WorkerState,
    request: Option<ExecutionRequest>,
    bridge: Arc<BridgeContext>,
    finished: bool,
}

impl ExecutionWorker {
    #[must_use]
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            state: WorkerState::Created,
            bridge: Arc::clone(&request.bridge),
            request: Some(request),
            finished: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs the request on the current thread and posts the terminal event.
    pub fn run(mut self) -> WorkerState {
        self.state = WorkerState::Running;
        if let Some(request) = &self.request {
            self.bridge.enter_run(request.run);
        }
        tracing::debug!(view = %self.bridge.view(), run = %self.bridge.current_run(), "worker started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute())).unwrap_or_else(|_| {
            RunOutcome::failure(
                ErrorKind::GuestRuntimeError,
                "internal fault: worker panicked".to_owned(),
                None,
            )
        });
        self.finish(outcome);
        self.state
    }

    fn execute(&self) -> RunOutcome {
        let Some(request) = self.request.as_ref() else {
            return RunOutcome::failure(ErrorKind::SessionClosed, "no run request".to_owned(), None);
        };
        if request.payload.is_blank() {
            return RunOutcome::success(String::new());
        }

        let mut session = request.session.lock();
        if !session.is_open() {
            return RunOutcome::failure(ErrorKind::SessionClosed, "session is closed".to_owned(), None);
        }
        let result = match &request.payload {
            Payload::Source(source) => session.run_script_string(source, RunMode::Execute),
            Payload::File { path, working_dir } => {
                session.run_script_file(path, working_dir.as_deref(), FileMode::Execute)
            }
        };
        match result {
            Ok(()) => RunOutcome::success(self.bridge.committed_output()),
            Err(err) => {
                let message = session.last_error().to_owned();
                let line = session.err_line();
                self.bridge.post(HostEventKind::ErrorOutput {
                    message: message.clone(),
                    line,
                });
                let mut outcome = RunOutcome::failure(err.kind(), message, line);
                outcome.committed_output = self.bridge.committed_output();
                outcome
            }
        }
    }

    /// Releases the payload and posts the terminal event, once.
    fn finish(&mut self, mut outcome: RunOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.state = if outcome.ok {
            WorkerState::FinishedOk
        } else {
            WorkerState::FinishedError
        };
        if let Some(request) = self.request.take() {
            if let Some(run_state) = request.run_state.try_lock() {
                outcome.aborted = run_state.aborted;
            }
            drop(request);
        }
        tracing::debug!(view = %self.bridge.view(), ok = outcome.ok, aborted = outcome.aborted, "worker finished");
        self.bridge.post(HostEventKind::Finished(outcome));
    }
}

impl Drop for ExecutionWorker {
    fn drop(&mut self) {
        if !self.finished && self.state != WorkerState::Created {
            self.finish(RunOutcome::failure(
                ErrorKind::GuestRuntimeError,
                "internal fault: worker exited without finishing".to_owned(),
                None,
            ));
        }
    }
}
