//! Textual rendering of guest values.
//!
//! Shared by the print bridges and the debug introspector so both show a value
//! the same way: numbers in a `%.14g`-style general format, tables as a short
//! `{ a, b, ... }` listing, and reference types by their identity.

use mlua::{Table, Value};

/// Most elements shown when a table is rendered inline.
pub const MAX_TABLE_ELEMENTS: usize = 10;

/// Significant digits used for floating-point output.
pub const NUMBER_PRECISION: usize = 14;

/// Formats a float like C's `%.{precision}g`.
#[must_use]
pub fn format_general(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_owned();
    }
    if value.is_infinite() {
        return if value.is_sign_negative() { "-inf" } else { "inf" }.to_owned();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i64 = exponent.parse().unwrap_or(0);
    let limit = i64::try_from(precision).unwrap_or(i64::MAX);

    if exponent < -4 || exponent >= limit {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.unsigned_abs())
    } else {
        let decimals = usize::try_from(limit - 1 - exponent).unwrap_or(0);
        trim_fraction(&format!("{value:.decimals$}")).to_owned()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Formats a number value the way `print` shows it.
#[must_use]
pub fn format_number(value: f64) -> String {
    format_general(value, NUMBER_PRECISION)
}

/// Hex identity of a reference value, e.g. `0x55d0c3a4b2c0`.
#[must_use]
pub fn identity(value: &Value) -> String {
    format!("{:p}", value.to_pointer())
}

/// Type name and identity, e.g. `table: 0x55d0c3a4b2c0`.
#[must_use]
pub fn pointer_string(value: &Value) -> String {
    format!("{}: {}", value.type_name(), identity(value))
}

/// Renders a value as `print` and `io.write` show it.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_owned(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(int) => int.to_string(),
        Value::Number(num) => format_number(*num),
        Value::String(text) => text.to_string_lossy(),
        Value::Table(table) => render_table(table),
        other => pointer_string(other),
    }
}

/// Renders a table as `{ a, b, ... }`.
///
/// The array part is listed when present, otherwise the hash part as
/// `key=value` pairs. At most [`MAX_TABLE_ELEMENTS`] elements are shown and a
/// trailing ` ...` marks the cut. Empty tables render as their pointer string.
/// Nested tables are shown by identity so rendering never recurses.
#[must_use]
pub fn render_table(table: &Table) -> String {
    let mut parts = Vec::new();
    let mut truncated = false;

    let len = table.raw_len();
    if len > 0 {
        for index in 1..=len {
            if parts.len() == MAX_TABLE_ELEMENTS {
                truncated = true;
                break;
            }
            let element: Value = table.raw_get(index).unwrap_or(Value::Nil);
            parts.push(render_element(&element));
        }
    } else {
        for pair in table.pairs::<Value, Value>() {
            let Ok((key, element)) = pair else { continue };
            if parts.len() == MAX_TABLE_ELEMENTS {
                truncated = true;
                break;
            }
            parts.push(format!("{}={}", render_element(&key), render_element(&element)));
        }
    }

    if parts.is_empty() {
        return pointer_string(&Value::Table(table.clone()));
    }
    let marker = if truncated { " ..." } else { "" };
    format!("{{ {}{marker} }}", parts.join(", "))
}

fn render_element(value: &Value) -> String {
    match value {
        Value::Table(_) => pointer_string(value),
        other => display_value(other),
    }
}

/// Cuts `text` to at most `width` characters.
#[must_use]
pub fn truncate_chars(text: &str, width: usize) -> &str {
    match text.char_indices().nth(width) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use mlua::Lua;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn general_format_matches_printf() {
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(3.5), "3.5");
        assert_eq!(format_number(100.0), "100");
        assert_eq!(format_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(format_number(1e20), "1e+20");
        assert_eq!(format_number(1.5e-7), "1.5e-07");
        assert_eq!(format_number(-0.0), "-0");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_general(123_456.0, 3), "1.23e+05");
    }

    #[test]
    fn array_tables_stop_after_ten_elements() {
        let lua = Lua::new();
        let table: Table = lua.load("return {1,2,3,4,5,6,7,8,9,10,11,12}").eval().unwrap();
        assert_eq!(render_table(&table), "{ 1, 2, 3, 4, 5, 6, 7, 8, 9, 10 ... }");

        let short: Table = lua.load("return {'a', true, 2.5}").eval().unwrap();
        assert_eq!(render_table(&short), "{ a, true, 2.5 }");
    }

    #[test]
    fn hash_tables_list_pairs_and_empty_tables_show_pointer() {
        let lua = Lua::new();
        let table: Table = lua.load("return {answer = 42}").eval().unwrap();
        assert_eq!(render_table(&table), "{ answer=42 }");

        let empty = lua.create_table().unwrap();
        assert!(render_table(&empty).starts_with("table: 0x"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
