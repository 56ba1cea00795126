//! Error taxonomy for the execution engine.
//!
//! Failures are separated by pipeline stage so a host can react to them without
//! string matching: the session could not be created, the guest chunk did not
//! compile, the guest raised at runtime, or a script file could not be read.
//! Misuse of a host bridge function and attempts to overwrite a read-only
//! builtin table are runtime failures too, distinguished by [`RuntimeCause`].

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Coarse error category reported alongside every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The interpreter or the worker thread could not be created.
    AllocationFailure,
    /// The guest chunk failed to load or compile; nothing was executed.
    GuestSyntaxError,
    /// The guest raised, or triggered a fault, during execution.
    GuestRuntimeError,
    /// A script file could not be read or compiled output could not be written.
    FileError,
    /// The session was already closed.
    SessionClosed,
}

/// What produced a [`EngineError::Runtime`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeCause {
    /// Guest code raised an error or hit an interpreter fault.
    Guest,
    /// A host bridge function was called with the wrong arity or argument types.
    HostBridgeMisuse,
    /// Guest code tried to modify a capability-locked builtin table.
    CapabilityViolation,
    /// A panic or other unrecoverable fault surfaced while servicing the run.
    InternalFault,
}

/// Error returned by [`InterpreterSession`](crate::InterpreterSession) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The interpreter could not be allocated or bootstrapped.
    #[error("allocation failure: {0}")]
    Allocation(String),
    /// Loading or compiling the guest chunk failed.
    #[error("{message}")]
    Syntax {
        /// Cleaned error message.
        message: String,
        /// 0-based source line, when it could be located.
        line: Option<usize>,
    },
    /// The guest chunk failed while executing.
    #[error("{message}")]
    Runtime {
        /// Cleaned error message.
        message: String,
        /// 0-based source line, when it could be located.
        line: Option<usize>,
        /// What raised the failure.
        cause: RuntimeCause,
    },
    /// A script file could not be read, or compiled output could not be written.
    #[error("{0}")]
    File(String),
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

impl EngineError {
    /// Returns the coarse category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocation(_) => ErrorKind::AllocationFailure,
            Self::Syntax { .. } => ErrorKind::GuestSyntaxError,
            Self::Runtime { .. } => ErrorKind::GuestRuntimeError,
            Self::File(_) => ErrorKind::FileError,
            Self::Closed => ErrorKind::SessionClosed,
        }
    }

    /// Returns the 0-based source line the error was located at, if any.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Syntax { line, .. } | Self::Runtime { line, .. } => *line,
            _ => None,
        }
    }

    /// Returns the runtime cause for runtime errors.
    #[must_use]
    pub fn cause(&self) -> Option<RuntimeCause> {
        match self {
            Self::Runtime { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

/// Error returned when a run request is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// A worker is already executing a script for this session.
    #[error("a script is already running")]
    AlreadyRunning,
    /// The current run was stopped and has not finished yet.
    #[error("the current run was stopped and is still finishing")]
    Aborted,
    /// The worker thread could not be spawned.
    #[error("could not start worker thread: {0}")]
    Spawn(String),
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

impl RunError {
    /// Returns the coarse category for refusals that map onto the engine taxonomy.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Spawn(_) => Some(ErrorKind::AllocationFailure),
            Self::Closed => Some(ErrorKind::SessionClosed),
            Self::AlreadyRunning | Self::Aborted => None,
        }
    }
}

/// Typed payload for a host bridge function called with bad arguments.
///
/// Raised into the interpreter as an external error. Its text uses the
/// host-sentinel form so [`locate`](crate::locate) recovers the guest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMisuse {
    /// Fully qualified bridge function name, e.g. `gui.ask`.
    pub function: &'static str,
    /// What was wrong with the call.
    pub detail: String,
    /// 0-based guest line of the call site, when known.
    pub line: Option<usize>,
}

impl fmt::Display for BridgeMisuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line {
            write!(f, "<!line={line}!>")?;
        }
        write!(f, "{}: {}", self.function, self.detail)
    }
}

impl std::error::Error for BridgeMisuse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_taxonomy_names() {
        let err = EngineError::Runtime {
            message: "boom".into(),
            line: Some(3),
            cause: RuntimeCause::CapabilityViolation,
        };
        assert_eq!(err.kind().to_string(), "GUEST_RUNTIME_ERROR");
        assert_eq!(err.cause().map(<&str>::from), Some("CAPABILITY_VIOLATION"));
        assert_eq!(err.line(), Some(3));
        assert_eq!(RunError::Spawn("oom".into()).kind(), Some(ErrorKind::AllocationFailure));
        assert_eq!(RunError::AlreadyRunning.kind(), None);
    }

    #[test]
    fn bridge_misuse_uses_sentinel_form() {
        let misuse = BridgeMisuse {
            function: "gui.ask",
            detail: "expected a string".into(),
            line: Some(4),
        };
        assert_eq!(misuse.to_string(), "<!line=4!>gui.ask: expected a string");
    }
}
