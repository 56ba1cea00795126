//! Per-session configuration.
//!
//! `SessionConfig` collects every tunable of a session in one serializable
//! struct with builder-style setters, so a host can load it from its own
//! settings store or build it in code:
//!
//! ```
//! use luadesk::SessionConfig;
//!
//! let config = SessionConfig::new().chunk_name("console").debugging(true).poll_quantum_ms(20);
//! assert_eq!(config.poll_quantum().as_millis(), 20);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilitySet;

/// Default upper bound for a script file read by `run_script_file` (16 MiB).
pub const DEFAULT_MAX_SCRIPT_BYTES: usize = 16 * 1024 * 1024;
/// Default sleep between mailbox checks while a worker waits on the UI.
pub const DEFAULT_POLL_QUANTUM_MS: u64 = 50;
/// Default cap on locals plus globals in one debug snapshot.
pub const DEFAULT_MAX_WATCH_ENTRIES: usize = 64;
/// Default number of call frames walked for a debug snapshot.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 32;
/// Default width at which string values are cut in a debug snapshot.
pub const DEFAULT_MAX_STRING_WIDTH: usize = 60;
/// Default capacity of the snapshot text buffer (16 KiB).
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 16 * 1024;
/// Default minimum time between two snapshots posted while debugging.
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 100;
/// Default send/receive/connect timeout for guest sockets.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5_000;
/// Default time `close` waits for a worker before detaching it.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Tunables for one interpreter session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name reported for guest chunks in error messages and stack frames.
    pub chunk_name: String,
    /// Load the interpreter's standard libraries.
    pub standard_libraries: bool,
    /// Produce debug snapshots while scripts run.
    pub debugging: bool,
    /// Largest script file accepted by `run_script_file`.
    pub max_script_bytes: usize,
    /// Sleep between mailbox checks, in milliseconds.
    pub poll_quantum_ms: u64,
    /// Cap on locals plus globals per snapshot.
    pub max_watch_entries: usize,
    /// Deepest call frame included in a snapshot.
    pub max_stack_depth: usize,
    /// Width at which snapshot string values are cut.
    pub max_string_width: usize,
    /// Capacity of the snapshot text buffer in bytes.
    pub snapshot_capacity: usize,
    /// Minimum time between two posted snapshots, in milliseconds.
    pub snapshot_interval_ms: u64,
    /// Guest socket timeout, in milliseconds.
    pub socket_timeout_ms: u64,
    /// How long closing a view waits for its worker, in milliseconds.
    pub close_timeout_ms: u64,
    /// Interpreter memory limit in bytes; `None` means unlimited.
    pub memory_limit: Option<usize>,
    /// Bridge capabilities granted to guest code.
    pub capabilities: CapabilitySet,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_name: "editor".to_owned(),
            standard_libraries: true,
            debugging: false,
            max_script_bytes: DEFAULT_MAX_SCRIPT_BYTES,
            poll_quantum_ms: DEFAULT_POLL_QUANTUM_MS,
            max_watch_entries: DEFAULT_MAX_WATCH_ENTRIES,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_string_width: DEFAULT_MAX_STRING_WIDTH,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            memory_limit: None,
            capabilities: CapabilitySet::default(),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with every default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Sets the chunk name used in error messages.
    #[must_use]
    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    /// Enables or disables the standard libraries.
    #[must_use]
    pub fn standard_libraries(mut self, enabled: bool) -> Self {
        self.standard_libraries = enabled;
        self
    }

    /// Enables or disables debug snapshots.
    #[must_use]
    pub fn debugging(mut self, enabled: bool) -> Self {
        self.debugging = enabled;
        self
    }

    /// Sets the largest accepted script file.
    #[must_use]
    pub fn max_script_bytes(mut self, limit: usize) -> Self {
        self.max_script_bytes = limit;
        self
    }

    /// Sets the mailbox polling quantum.
    #[must_use]
    pub fn poll_quantum_ms(mut self, millis: u64) -> Self {
        self.poll_quantum_ms = millis;
        self
    }

    /// Sets the snapshot watch-entry cap.
    #[must_use]
    pub fn max_watch_entries(mut self, limit: usize) -> Self {
        self.max_watch_entries = limit;
        self
    }

    /// Sets the snapshot stack depth.
    #[must_use]
    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    /// Sets the snapshot string width.
    #[must_use]
    pub fn max_string_width(mut self, width: usize) -> Self {
        self.max_string_width = width;
        self
    }

    /// Sets the snapshot buffer capacity.
    #[must_use]
    pub fn snapshot_capacity(mut self, bytes: usize) -> Self {
        self.snapshot_capacity = bytes;
        self
    }

    /// Sets the minimum interval between posted snapshots.
    #[must_use]
    pub fn snapshot_interval_ms(mut self, millis: u64) -> Self {
        self.snapshot_interval_ms = millis;
        self
    }

    /// Sets the guest socket timeout.
    #[must_use]
    pub fn socket_timeout_ms(mut self, millis: u64) -> Self {
        self.socket_timeout_ms = millis;
        self
    }

    /// Sets how long closing a view waits for its worker.
    #[must_use]
    pub fn close_timeout_ms(mut self, millis: u64) -> Self {
        self.close_timeout_ms = millis;
        self
    }

    /// Sets the interpreter memory limit.
    #[must_use]
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Replaces the capability set.
    #[must_use]
    pub fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Mailbox polling quantum as a `Duration`.
    #[must_use]
    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms.max(1))
    }

    /// Snapshot interval as a `Duration`.
    #[must_use]
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// Close timeout as a `Duration`.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Socket timeout as a `Duration`.
    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::capability::Capability;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = SessionConfig::from_json(r#"{"chunk_name": "console", "poll_quantum_ms": 10}"#).unwrap();
        assert_eq!(config.chunk_name, "console");
        assert_eq!(config.poll_quantum(), Duration::from_millis(10));
        assert_eq!(config.max_watch_entries, DEFAULT_MAX_WATCH_ENTRIES);
        assert_eq!(config.capabilities, CapabilitySet::unrestricted());
    }

    #[test]
    fn capabilities_round_trip_as_snake_case() {
        let config = SessionConfig::new().capabilities(CapabilitySet::new(vec![Capability::Timers]));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["capabilities"]["capabilities"], serde_json::json!(["timers"]));
    }

    #[test]
    fn zero_quantum_is_clamped() {
        assert_eq!(SessionConfig::new().poll_quantum_ms(0).poll_quantum(), Duration::from_millis(1));
    }
}
