use std::borrow::Cow;

use mlua::Value;

use crate::format::display_value;

/// Separator `print` puts between two arguments when the first does not end a line.
pub const PRINT_SEPARATOR: &str = "   ";

/// Trait for receiving text produced by the guest output bridges.
///
/// `print` and `io.write` format their arguments and hand the pieces to a
/// writer. The session writer forwards the finished text to the host as one
/// print event; [`CollectStringPrint`] keeps it in memory.
pub trait PrintWriter {
    /// Called once for each formatted argument.
    ///
    /// Writes only the argument's text. Separators and the final newline are
    /// emitted through [`stdout_push`](Self::stdout_push) and
    /// [`stdout_separator`](Self::stdout_separator).
    fn stdout_write(&mut self, output: Cow<'_, str>);

    /// Adds a single character, generally the trailing newline of `print`.
    fn stdout_push(&mut self, end: char);

    /// Adds the separator between two `print` arguments.
    fn stdout_separator(&mut self) {
        self.stdout_write(Cow::Borrowed(PRINT_SEPARATOR));
    }
}

/// A `PrintWriter` that collects all output into a string.
///
/// Used by the bridges to assemble one event payload per call, and useful for
/// capturing output in tests.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    /// Creates a new empty `CollectStringPrint`.
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output as a string slice.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.0.push_str(&output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// Writes `args` with `print` semantics.
///
/// Successive arguments are separated by three spaces unless the previous one
/// already ends with a newline, and the output always ends with a newline.
pub fn print_args(writer: &mut impl PrintWriter, args: &[Value]) {
    let mut previous_ends_line = true;
    for (index, arg) in args.iter().enumerate() {
        if index > 0 && !previous_ends_line {
            writer.stdout_separator();
        }
        let text = display_value(arg);
        previous_ends_line = text.ends_with('\n');
        writer.stdout_write(Cow::Owned(text));
    }
    writer.stdout_push('\n');
}

/// Writes `args` with `io.write` semantics: concatenated, no separators, no newline.
pub fn write_args(writer: &mut impl PrintWriter, args: &[Value]) {
    for arg in args {
        writer.stdout_write(Cow::Owned(display_value(arg)));
    }
}

#[cfg(test)]
mod tests {
    use mlua::Lua;
    use pretty_assertions::assert_eq;

    use super::*;

    fn values(lua: &Lua, code: &str) -> Vec<Value> {
        lua.load(code).eval::<mlua::Variadic<Value>>().unwrap().to_vec()
    }

    #[test]
    fn print_separates_with_three_spaces() {
        let lua = Lua::new();
        let mut out = CollectStringPrint::new();
        print_args(&mut out, &values(&lua, "return 1, 'a', nil, 2.5"));
        assert_eq!(out.output(), "1   a   nil   2.5\n");
    }

    #[test]
    fn print_skips_separator_after_newline() {
        let lua = Lua::new();
        let mut out = CollectStringPrint::new();
        print_args(&mut out, &values(&lua, "return 'line\\n', 'next'"));
        assert_eq!(out.output(), "line\nnext\n");
    }

    #[test]
    fn write_concatenates() {
        let lua = Lua::new();
        let mut out = CollectStringPrint::new();
        write_args(&mut out, &values(&lua, "return 'x=', 3, '\\n'"));
        assert_eq!(out.into_output(), "x=3\n");
    }

    #[test]
    fn empty_print_is_a_newline() {
        let mut out = CollectStringPrint::new();
        print_args(&mut out, &[]);
        assert_eq!(out.output(), "\n");
    }
}
