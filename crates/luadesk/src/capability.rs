//! Capability-based permissions for host bridge functions.
//!
//! Capabilities control which groups of host bridge functions guest code may
//! call. Every bridge function is registered at session open, and each call is
//! checked against the session's [`CapabilitySet`] at the bridge boundary: the
//! guest can request any operation, but the host only services requests whose
//! capability was granted.
//!
//! The same layer owns the list of builtin module tables that the bootstrap
//! script makes read-only. Writing to any of them, or replacing one of them in
//! the global table, raises [`CAPABILITY_VIOLATION`].
//!
//! # Usage
//!
//! ```
//! use luadesk::capability::{Capability, CapabilitySet};
//!
//! let caps = CapabilitySet::new(vec![Capability::Interactive, Capability::Timers]);
//!
//! assert!(caps.allows(Capability::Timers));
//! assert!(!caps.allows(Capability::Sockets));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Fixed message raised when guest code writes to a read-only builtin table.
pub const CAPABILITY_VIOLATION: &str = "attempt to modify a read-only builtin table";

/// Builtin module tables locked by the bootstrap script.
///
/// Tables that do not exist in a session (for example `io` without the
/// standard libraries) are skipped. `package` stays writable so the host can
/// scope `package.path` to a script's directory.
pub const LOCKED_MODULES: &[&str] = &[
    "coroutine",
    "debug",
    "gui",
    "io",
    "math",
    "os",
    "socket",
    "string",
    "table",
    "time",
    "utf8",
];

/// Debug library functions left visible to guest code.
///
/// Everything that can change hooks, metatables, upvalues or the registry is
/// withheld: the host hook watches for shutdown and must stay installed.
pub const GUEST_DEBUG_FUNCTIONS: &[&str] = &["getinfo", "getlocal", "traceback"];

/// A single permission grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Modal interaction with the user: `io.read`, `gui.ask`, `gui.alert`.
    Interactive,
    /// Outbound TCP sockets through the `socket` namespace.
    Sockets,
    /// Timer marks and blocking sleeps through the `time` namespace.
    Timers,
}

/// Error returned when a bridge call is denied by the capability set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{function}: permission denied (requires capability '{required}')")]
pub struct PermissionDenied {
    /// Bridge function that was called.
    pub function: &'static str,
    /// Capability that would have been required.
    pub required: Capability,
}

/// A set of granted capabilities for a session.
///
/// The set is fixed once the session is open. An empty set
/// ([`CapabilitySet::none`]) still allows printing and clearing output, which
/// are not gated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: Vec<Capability>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::unrestricted()
    }
}

impl CapabilitySet {
    /// Creates a new capability set with the given permissions.
    #[must_use]
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    /// Creates an empty capability set that denies every gated bridge call.
    #[must_use]
    pub fn none() -> Self {
        Self {
            capabilities: Vec::new(),
        }
    }

    /// Creates a capability set that grants everything.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            capabilities: vec![Capability::Interactive, Capability::Sockets, Capability::Timers],
        }
    }

    /// Checks whether a call to `function`, which needs `required`, is allowed.
    pub fn check(&self, required: Capability, function: &'static str) -> Result<(), PermissionDenied> {
        if self.capabilities.contains(&required) {
            Ok(())
        } else {
            Err(PermissionDenied { function, required })
        }
    }

    /// Returns `true` if the capability is granted.
    #[must_use]
    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Returns the capabilities as a slice for inspection.
    #[must_use]
    pub fn as_slice(&self) -> &[Capability] {
        &self.capabilities
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.capabilities.is_empty() {
            return f.write_str("CapabilitySet(none)");
        }
        f.write_str("CapabilitySet(")?;
        for (i, cap) in self.capabilities.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{cap}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_call_names_function_and_capability() {
        let caps = CapabilitySet::new(vec![Capability::Timers]);
        let err = caps.check(Capability::Sockets, "socket.new").unwrap_err();
        assert_eq!(
            err.to_string(),
            "socket.new: permission denied (requires capability 'sockets')"
        );
        assert!(caps.check(Capability::Timers, "time.tic").is_ok());
    }

    #[test]
    fn capability_names_are_snake_case() {
        assert_eq!(Capability::Interactive.to_string(), "interactive");
        let name: &'static str = Capability::Sockets.into();
        assert_eq!(name, "sockets");
    }

    #[test]
    fn display_lists_grants() {
        assert_eq!(CapabilitySet::none().to_string(), "CapabilitySet(none)");
        assert_eq!(
            CapabilitySet::unrestricted().to_string(),
            "CapabilitySet(interactive, sockets, timers)"
        );
    }
}
