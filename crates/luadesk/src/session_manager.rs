//! Registry of open script-capable views.
//!
//! `SessionManager` keeps one [`ScriptHost`] per view id, all posting into the
//! same [`EventSink`]. Events carry the view id and their run id, so the
//! owning thread can feed everything it receives to
//! [`SessionManager::dispatch`] and let the manager route each event to the
//! right host. A host ignores events from runs other than its current one,
//! which covers a view that was closed and reopened under the same id.

use std::{fmt, path::Path, sync::Arc};

use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    config::SessionConfig,
    error::{EngineError, RunError},
    events::{CallerKind, DialogService, EventSink, HostEvent, RunOutcome},
    host::ScriptHost,
};

// =============================================================================
// Error types
// =============================================================================

/// Errors that can occur during view management operations.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// The requested view was not found.
    NotFound(String),
    /// A view with the given id already exists.
    AlreadyExists(String),
    /// The interpreter for a new view could not be opened.
    Engine(EngineError),
    /// A run request was refused.
    Run(RunError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::Engine(e) => write!(f, "{e}"),
            Self::Run(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<EngineError> for SessionError {
    fn from(error: EngineError) -> Self {
        Self::Engine(error)
    }
}

impl From<RunError> for SessionError {
    fn from(error: RunError) -> Self {
        Self::Run(error)
    }
}

// =============================================================================
// Output types
// =============================================================================

/// Summary of one open view, as returned by `list_views`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewInfo {
    /// The view id.
    pub id: String,
    /// Editor or console.
    pub caller: CallerKind,
    /// A run is in flight.
    pub running: bool,
}

// =============================================================================
// Manager
// =============================================================================

/// Named script hosts sharing one event sink.
pub struct SessionManager {
    views: IndexMap<String, ScriptHost>,
    config: SessionConfig,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("views", &self.views.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates an empty manager; every view opened later uses `config`.
    #[must_use]
    pub fn new(config: SessionConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            views: IndexMap::new(),
            config,
            sink,
        }
    }

    /// Opens a session for a new view.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyExists` if a view with `id` is open, or
    /// `SessionError::Engine` if the interpreter cannot be created.
    pub fn open_view(&mut self, id: &str, caller: CallerKind) -> Result<(), SessionError> {
        if self.views.contains_key(id) {
            return Err(SessionError::AlreadyExists(format!("view '{id}' already exists")));
        }
        let config = match caller {
            CallerKind::Editor => self.config.clone(),
            CallerKind::Console => self.config.clone().chunk_name("console"),
        };
        let host = ScriptHost::open(id, caller, config, Arc::clone(&self.sink))?;
        self.views.insert(id.to_owned(), host);
        Ok(())
    }

    /// Closes a view, waiting for its worker up to the close timeout, and drops its session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the view does not exist.
    pub fn close_view(&mut self, id: &str) -> Result<(), SessionError> {
        let mut host = self
            .views
            .shift_remove(id)
            .ok_or_else(|| SessionError::NotFound(format!("view '{id}' not found")))?;
        host.close();
        Ok(())
    }

    /// Starts a run in a view.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown views and
    /// `SessionError::Run` when the host refuses the run.
    pub fn run(&mut self, id: &str, source: &str) -> Result<(), SessionError> {
        Ok(self.view_mut(id)?.run(source)?)
    }

    /// Starts a run of a script file in a view.
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run).
    pub fn run_file(&mut self, id: &str, path: &Path, working_dir: Option<&Path>) -> Result<(), SessionError> {
        Ok(self.view_mut(id)?.run_file(path, working_dir)?)
    }

    /// Stops the run in a view; returns whether one was active.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the view does not exist.
    pub fn stop(&mut self, id: &str) -> Result<bool, SessionError> {
        Ok(self.view_mut(id)?.stop())
    }

    /// Routes an event to its view. Events for closed views and stale runs are dropped.
    pub fn dispatch(&mut self, event: &HostEvent, dialogs: &mut dyn DialogService) -> Option<RunOutcome> {
        match self.views.get_mut(&*event.view) {
            Some(host) => host.handle_event(event, dialogs),
            None => {
                tracing::debug!(view = %event.view, "event for a closed view dropped");
                None
            }
        }
    }

    /// Retries deferred work on every view.
    pub fn pump(&mut self) {
        for host in self.views.values_mut() {
            host.pump();
        }
    }

    /// Lists open views in the order they were opened.
    #[must_use]
    pub fn list_views(&self) -> Vec<ViewInfo> {
        self.views
            .iter()
            .map(|(id, host)| ViewInfo {
                id: id.clone(),
                caller: host.caller(),
                running: host.is_running(),
            })
            .collect()
    }

    /// Looks up a view.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the view does not exist.
    pub fn view(&self, id: &str) -> Result<&ScriptHost, SessionError> {
        self.views
            .get(id)
            .ok_or_else(|| SessionError::NotFound(format!("view '{id}' not found")))
    }

    /// Looks up a view mutably.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the view does not exist.
    pub fn view_mut(&mut self, id: &str) -> Result<&mut ScriptHost, SessionError> {
        self.views
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(format!("view '{id}' not found")))
    }

    /// Closes every view.
    pub fn close_all(&mut self) {
        for (_, mut host) in self.views.drain(..) {
            host.close();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
