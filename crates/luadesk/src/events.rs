//! Events posted from a worker thread to the thread that owns the view.
//!
//! Every event carries the view label, the [`CallerKind`] and the [`RunId`] of
//! the run that produced it, so a host running several views can route it to
//! the widget that started the run and drop leftovers of runs it no longer
//! tracks. Events from one worker arrive in the order they were posted.

use std::{
    fmt,
    sync::{
        Arc, mpsc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::error::ErrorKind;

/// Which kind of view a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallerKind {
    /// A script editor: one script per run.
    Editor,
    /// An interactive console: snippets share globals across runs.
    Console,
}

/// Process-wide identifier of one background run.
///
/// The default id marks events posted outside a background run, such as a
/// session driven directly on the caller's thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RunId(u64);

impl RunId {
    /// Allocates an id no other run in this process has used.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Result of one run, delivered with [`HostEventKind::Finished`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    /// `true` when the guest chunk ran to completion.
    pub ok: bool,
    /// `true` when the run was stopped by the host before it finished.
    pub aborted: bool,
    /// Cleaned error message; empty on success.
    pub message: String,
    /// 0-based line of the error, when it could be located.
    pub error_line: Option<usize>,
    /// Error category on failure.
    pub error_kind: Option<ErrorKind>,
    /// Last non-blank line of output the guest produced.
    pub committed_output: String,
}

impl RunOutcome {
    /// Outcome of a run that completed.
    #[must_use]
    pub fn success(committed_output: String) -> Self {
        Self {
            ok: true,
            committed_output,
            ..Self::default()
        }
    }

    /// Outcome of a run that failed.
    #[must_use]
    pub fn failure(kind: ErrorKind, message: String, error_line: Option<usize>) -> Self {
        Self {
            ok: false,
            message,
            error_line,
            error_kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Payload of a [`HostEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEventKind {
    /// Text produced by `print` or `io.write`.
    Print(String),
    /// The guest called `cls`.
    Clear,
    /// The guest called `io.read`; answer through the interactive channel.
    Read {
        /// Prompt detected from the last committed output line, or empty.
        prompt: String,
    },
    /// The guest called `gui.alert` or `gui.ask`.
    Message {
        /// Text to show.
        text: String,
        /// `true` for a yes/no question, `false` for an acknowledgement.
        is_question: bool,
    },
    /// The run failed; shown in the view's error area.
    ErrorOutput {
        /// Cleaned error message.
        message: String,
        /// 0-based line to highlight, when known.
        line: Option<usize>,
    },
    /// A rendered debug snapshot.
    Snapshot(String),
    /// Terminal event: the worker is done. Posted exactly once per run.
    Finished(RunOutcome),
}

/// Event addressed to one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    /// Label of the view that owns the session.
    pub view: Arc<str>,
    /// Kind of view.
    pub caller: CallerKind,
    /// Run that posted the event.
    pub run: RunId,
    /// What happened.
    pub kind: HostEventKind,
}

impl HostEvent {
    /// Returns `true` for the terminal event of a run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.kind, HostEventKind::Finished(_))
    }
}

/// Destination for events posted by a worker.
///
/// Implementations must be cheap and must not block: posting happens on the
/// worker thread in the middle of guest execution.
pub trait EventSink: Send + Sync {
    /// Queues an event for the UI thread.
    fn post(&self, event: HostEvent);
}

impl EventSink for mpsc::Sender<HostEvent> {
    fn post(&self, event: HostEvent) {
        if self.send(event).is_err() {
            tracing::debug!("event receiver dropped; discarding event");
        }
    }
}

/// Modal dialogs shown on the UI thread on behalf of the guest.
pub trait DialogService {
    /// Asks for a line of text; `None` when the user cancelled.
    fn read_text(&mut self, prompt: &str) -> Option<String>;

    /// Asks a yes/no question.
    fn ask(&mut self, question: &str) -> bool;

    /// Shows a message and returns once the user acknowledged it.
    fn alert(&mut self, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_sink_delivers_in_order() {
        let (tx, rx) = mpsc::channel();
        let view: Arc<str> = Arc::from("main");
        for n in 0..3 {
            tx.post(HostEvent {
                view: Arc::clone(&view),
                caller: CallerKind::Editor,
                run: RunId::default(),
                kind: HostEventKind::Print(n.to_string()),
            });
        }
        let texts: Vec<_> = rx
            .try_iter()
            .map(|event| match event.kind {
                HostEventKind::Print(text) => text,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(texts, ["0", "1", "2"]);
    }

    #[test]
    fn run_ids_are_unique_and_never_default() {
        let first = RunId::next();
        let second = RunId::next();
        assert_ne!(first, second);
        assert_ne!(first, RunId::default());
        assert!(second > first);
    }

    #[test]
    fn posting_after_receiver_dropped_is_silent() {
        let (tx, rx) = mpsc::channel::<HostEvent>();
        drop(rx);
        tx.post(HostEvent {
            view: Arc::from("gone"),
            caller: CallerKind::Console,
            run: RunId::default(),
            kind: HostEventKind::Clear,
        });
    }
}
