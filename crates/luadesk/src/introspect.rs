//! Debug snapshots of a running guest.
//!
//! A snapshot lists the locals of the frame being executed, then the globals
//! the guest created since the run started, then the call stack. The text form
//! is line-oriented and tab-separated:
//!
//! ```text
//! name \t value \t type \n        (one per watch entry)
//! \nSTACKTRACE\n
//! depth \t line \t name \t kind \n  (one per frame)
//! ```
//!
//! Rendering goes through a fixed-capacity [`SnapshotBuffer`]; a snapshot that
//! would not fit is abandoned as a whole rather than cut.

use std::sync::Arc;

use ahash::AHashSet;
use mlua::{Function, Lua, Value};
use serde::{Deserialize, Serialize};

use crate::format::{format_number, identity, render_table, truncate_chars};

/// Separates watch entries from stack frames in the text form.
pub const STACKTRACE_DELIMITER: &str = "\nSTACKTRACE\n";

/// Name shown for interpreter temporaries.
pub const SENTINEL_NAME: &str = "*";

/// Stack level of the hooked frame as seen from inside `debug.getlocal`.
///
/// Level 0 is `getlocal` itself; the host hook runs as a native callback and
/// does not occupy an interpreter frame.
const HOOKED_FRAME_LEVEL: i64 = 1;

/// Snapshot failure. The caller shows the snapshot as unavailable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// The rendered snapshot exceeded the buffer.
    #[error("snapshot exceeds the {capacity} byte buffer")]
    Overflow {
        /// Buffer capacity in bytes.
        capacity: usize,
    },
    /// The session has no introspection hook (debug library unavailable).
    #[error("introspection is not available in this session")]
    Unavailable,
    /// The snapshot text has no stack trace section.
    #[error("snapshot text has no stack trace section")]
    MissingDelimiter,
}

/// Bounds applied while walking the guest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrospectLimits {
    /// Cap on locals plus globals.
    pub max_entries: usize,
    /// Deepest frame walked.
    pub max_depth: usize,
    /// Width at which string values are cut.
    pub string_width: usize,
    /// Capacity of the text buffer.
    pub capacity: usize,
}

/// One watched variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub name: String,
    pub value: String,
    pub type_tag: String,
}

/// One call frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEntry {
    pub depth: usize,
    /// 1-based current line, `-1` for native frames.
    pub line: i64,
    pub name: String,
    pub kind: String,
}

/// Structured form of a snapshot: locals first, then new globals, then frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub watches: Vec<WatchEntry>,
    pub frames: Vec<FrameEntry>,
}

impl DebugSnapshot {
    /// Renders the text form into a buffer of `capacity` bytes.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Overflow`] when the text does not fit.
    pub fn render(&self, capacity: usize) -> Result<String, SnapshotError> {
        let mut buffer = SnapshotBuffer::with_capacity(capacity);
        for watch in &self.watches {
            buffer.append(&[&watch.name, "\t", &watch.value, "\t", &watch.type_tag, "\n"])?;
        }
        buffer.append(&[STACKTRACE_DELIMITER])?;
        for frame in &self.frames {
            let depth = frame.depth.to_string();
            let line = frame.line.to_string();
            buffer.append(&[&depth, "\t", &line, "\t", &frame.name, "\t", &frame.kind, "\n"])?;
        }
        Ok(buffer.into_string())
    }

    /// Parses the text form back into its structured form.
    ///
    /// Malformed lines are skipped.
    ///
    /// # Errors
    /// Returns [`SnapshotError::MissingDelimiter`] when the text has no stack section.
    pub fn parse(text: &str) -> Result<Self, SnapshotError> {
        let (watch_text, frame_text) = text
            .split_once(STACKTRACE_DELIMITER)
            .ok_or(SnapshotError::MissingDelimiter)?;

        let watches = watch_text
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(3, '\t');
                Some(WatchEntry {
                    name: fields.next()?.to_owned(),
                    value: fields.next()?.to_owned(),
                    type_tag: fields.next()?.to_owned(),
                })
            })
            .collect();

        let frames = frame_text
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(4, '\t');
                Some(FrameEntry {
                    depth: fields.next()?.parse().ok()?,
                    line: fields.next()?.parse().ok()?,
                    name: fields.next()?.to_owned(),
                    kind: fields.next()?.to_owned(),
                })
            })
            .collect();

        Ok(Self { watches, frames })
    }
}

/// Fixed-capacity text buffer that refuses appends which would overflow it.
#[derive(Debug)]
pub struct SnapshotBuffer {
    text: String,
    capacity: usize,
}

impl SnapshotBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Appends all `parts` or nothing.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Overflow`] if the parts do not fit.
    pub fn append(&mut self, parts: &[&str]) -> Result<(), SnapshotError> {
        let needed: usize = parts.iter().map(|part| part.len()).sum();
        if self.text.len() + needed > self.capacity {
            return Err(SnapshotError::Overflow {
                capacity: self.capacity,
            });
        }
        for part in parts {
            self.text.push_str(part);
        }
        Ok(())
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

/// Walks the guest state of a paused interpreter.
///
/// Holds the `debug.getlocal` function captured when the session was opened,
/// so snapshots keep working after the debug library is hidden from guests.
#[derive(Debug, Clone)]
pub struct Introspector {
    getlocal: Function,
    baseline: Arc<AHashSet<String>>,
    limits: IntrospectLimits,
}

impl Introspector {
    #[must_use]
    pub fn new(getlocal: Function, baseline: Arc<AHashSet<String>>, limits: IntrospectLimits) -> Self {
        Self {
            getlocal,
            baseline,
            limits,
        }
    }

    #[must_use]
    pub fn limits(&self) -> IntrospectLimits {
        self.limits
    }

    /// Captures the current state. Must be called from inside an interpreter hook.
    #[must_use]
    pub fn capture(&self, lua: &Lua) -> DebugSnapshot {
        let mut watches = self.locals();
        let remaining = self.limits.max_entries.saturating_sub(watches.len());
        watches.extend(self.new_globals(lua).into_iter().take(remaining));
        watches.truncate(self.limits.max_entries);
        DebugSnapshot {
            watches,
            frames: self.frames(lua),
        }
    }

    /// Captures and renders the current state.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Overflow`] when the text exceeds the buffer.
    pub fn dump(&self, lua: &Lua) -> Result<String, SnapshotError> {
        self.capture(lua).render(self.limits.capacity)
    }

    fn locals(&self) -> Vec<WatchEntry> {
        let mut entries = Vec::new();
        let mut previous: Option<String> = None;
        for index in 1_i64.. {
            if entries.len() >= self.limits.max_entries {
                break;
            }
            let Ok((name, value)) = self.getlocal.call::<(Option<String>, Value)>((HOOKED_FRAME_LEVEL, index)) else {
                break;
            };
            let Some(name) = name else { break };
            let name = if is_temporary(&name) {
                SENTINEL_NAME.to_owned()
            } else {
                name
            };
            let Some(entry) = self.watch(name, &value) else {
                continue;
            };
            push_distinct(&mut entries, &mut previous, entry);
        }
        entries
    }

    fn new_globals(&self, lua: &Lua) -> Vec<WatchEntry> {
        let mut found: Vec<(String, Value)> = lua
            .globals()
            .pairs::<Value, Value>()
            .filter_map(Result::ok)
            .filter_map(|(key, value)| match key {
                Value::String(name) => Some((name.to_string_lossy(), value)),
                _ => None,
            })
            .filter(|(name, _)| !self.baseline.contains(name))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::new();
        let mut previous = None;
        for (name, value) in found {
            if let Some(entry) = self.watch(name, &value) {
                push_distinct(&mut entries, &mut previous, entry);
            }
        }
        entries
    }

    fn watch(&self, name: String, value: &Value) -> Option<WatchEntry> {
        let is_sentinel = name == SENTINEL_NAME;
        let text = match value {
            Value::Nil => return None,
            Value::Boolean(flag) => flag.to_string(),
            Value::Integer(int) => int.to_string(),
            Value::Number(num) if is_sentinel && num.abs() < f64::EPSILON => "0".to_owned(),
            Value::Number(num) => format_number(*num),
            Value::String(text) => truncate_chars(&text.to_string_lossy(), self.limits.string_width).to_owned(),
            Value::Table(table) => render_table(table),
            other => identity(other),
        };
        Some(WatchEntry {
            name: sanitize(&name),
            value: sanitize(&text),
            type_tag: value.type_name().to_owned(),
        })
    }

    fn frames(&self, lua: &Lua) -> Vec<FrameEntry> {
        let mut frames = Vec::new();
        for depth in 0..self.limits.max_depth {
            let Some(debug) = lua.inspect_stack(depth) else {
                break;
            };
            let names = debug.names();
            let source = debug.source();
            let kind = source.what;
            let label = match kind {
                "main" => "main chunk".to_owned(),
                "C" => "native call".to_owned(),
                _ if debug.is_tail_call() => "tail call".to_owned(),
                _ => source
                    .short_src
                    .as_ref()
                    .map_or_else(|| "unknown".to_owned(), ToString::to_string),
            };
            let name = names
                .name
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| names.name_what.as_ref().map(ToString::to_string).filter(|what| !what.is_empty()))
                .unwrap_or(label);
            frames.push(FrameEntry {
                depth,
                line: i64::from(debug.curr_line()),
                name: sanitize(&name),
                kind: kind.to_owned(),
            });
        }
        frames
    }
}

/// Pushes `entry` unless it repeats the previous line ignoring case.
///
/// Returns `true` when the entry was dropped.
fn push_distinct(entries: &mut Vec<WatchEntry>, previous: &mut Option<String>, entry: WatchEntry) -> bool {
    let line = format!("{}\t{}\t{}", entry.name, entry.value, entry.type_tag).to_lowercase();
    if previous.as_deref() == Some(line.as_str()) {
        return true;
    }
    *previous = Some(line);
    entries.push(entry);
    false
}

fn is_temporary(name: &str) -> bool {
    name.starts_with('(') && name.contains("temporary")
}

/// Keeps the line format intact: tabs and line breaks become spaces.
fn sanitize(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> DebugSnapshot {
        DebugSnapshot {
            watches: vec![
                WatchEntry {
                    name: "x".into(),
                    value: "1".into(),
                    type_tag: "number".into(),
                },
                WatchEntry {
                    name: "s".into(),
                    value: "hello".into(),
                    type_tag: "string".into(),
                },
            ],
            frames: vec![FrameEntry {
                depth: 0,
                line: 3,
                name: "main chunk".into(),
                kind: "main".into(),
            }],
        }
    }

    #[test]
    fn render_then_parse_preserves_structure() {
        let text = sample().render(1024).unwrap();
        assert_eq!(text, "x\t1\tnumber\ns\thello\tstring\n\nSTACKTRACE\n0\t3\tmain chunk\tmain\n");
        assert_eq!(DebugSnapshot::parse(&text).unwrap(), sample());
    }

    #[test]
    fn overflow_abandons_whole_snapshot() {
        assert_eq!(sample().render(10), Err(SnapshotError::Overflow { capacity: 10 }));
    }

    #[test]
    fn buffer_append_is_all_or_nothing() {
        let mut buffer = SnapshotBuffer::with_capacity(4);
        buffer.append(&["ab"]).unwrap();
        assert!(buffer.append(&["c", "de"]).is_err());
        assert_eq!(buffer.into_string(), "ab");
    }

    #[test]
    fn parse_requires_delimiter() {
        assert_eq!(DebugSnapshot::parse("x\t1\tnumber\n"), Err(SnapshotError::MissingDelimiter));
    }

    #[test]
    fn duplicate_lines_are_dropped_case_insensitively() {
        let mut entries = Vec::new();
        let mut previous = None;
        let entry = |name: &str| WatchEntry {
            name: name.into(),
            value: "v".into(),
            type_tag: "string".into(),
        };
        assert!(!push_distinct(&mut entries, &mut previous, entry("A")));
        assert!(push_distinct(&mut entries, &mut previous, entry("a")));
        assert!(!push_distinct(&mut entries, &mut previous, entry("b")));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn temporaries_are_recognized() {
        assert!(is_temporary("(temporary)"));
        assert!(is_temporary("(C temporary)"));
        assert!(!is_temporary("(for state)"));
        assert!(!is_temporary("temporary"));
    }
}
