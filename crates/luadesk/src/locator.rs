//! Recovers a source line and a cleaned message from raw interpreter error text.
//!
//! Three shapes are recognized, tried in this order:
//!
//! | Shape | Example | Line |
//! |-------|---------|------|
//! | host sentinel | `<!line=7!>gui.ask: expected a string` | `7` (already 0-based) |
//! | classic chunk prefix | `editor:12: attempt to call a nil value` | `11` |
//! | alternate suffix | `'end' expected (to close 'if' at line 3)` | `2` |
//!
//! A `stack traceback:` tail appended by the interpreter is dropped from the
//! cleaned message. When nothing matches, the text is passed through unchanged.

use std::sync::LazyLock;

use regex::Regex;

/// Marker that introduces the traceback the interpreter appends to runtime errors.
const TRACEBACK_MARKER: &str = "\nstack traceback:";

static SENTINEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<!line=(\d+)!>").expect("valid sentinel regex"));
static CHUNK_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\n]*?:(\d+): ").expect("valid chunk prefix regex"));
static AT_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"at line (\d+)\)").expect("valid at-line regex"));

/// Result of [`locate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// 0-based source line, or `None` when the text carried no location.
    pub line: Option<usize>,
    /// Message with the location prefix and traceback removed.
    pub message: String,
}

/// Formats a host-raised error in the sentinel shape understood by [`locate`].
#[must_use]
pub fn sentinel(line: usize, scope: &str, detail: &str) -> String {
    format!("<!line={line}!>{scope}: {detail}")
}

/// Parses raw error text into a 0-based line and a cleaned message.
///
/// Pure and allocation-light; safe to call from any thread on a private copy
/// of the text.
#[must_use]
pub fn locate(text: &str) -> Located {
    let body = text.split(TRACEBACK_MARKER).next().unwrap_or(text);

    if let Some(caps) = SENTINEL.captures(body)
        && let Some(line) = parse_line(&caps[1])
    {
        let end = caps.get(0).map_or(0, |m| m.end());
        return Located {
            line: Some(line),
            message: body[end..].trim().to_owned(),
        };
    }

    if let Some(caps) = CHUNK_PREFIX.captures(body)
        && let Some(line) = parse_line(&caps[1])
    {
        let end = caps.get(0).map_or(0, |m| m.end());
        return Located {
            line: Some(line.saturating_sub(1)),
            message: body[end..].trim().to_owned(),
        };
    }

    if let Some(caps) = AT_LINE.captures(body)
        && let Some(line) = parse_line(&caps[1])
    {
        return Located {
            line: Some(line.saturating_sub(1)),
            message: body.trim().to_owned(),
        };
    }

    Located {
        line: None,
        message: text.to_owned(),
    }
}

fn parse_line(digits: &str) -> Option<usize> {
    digits.parse().ok()
}
