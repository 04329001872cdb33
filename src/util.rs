//! Small helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wrap a value in single quotes for safe embedding in shell text.
///
/// Embedded single quotes are rewritten as `'\''` (close quote, escaped
/// quote, reopen quote), so the result is a single shell word no matter what
/// the input contains.
///
/// - `foo` → `'foo'`
/// - `it's` → `'it'\''s'`
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Current wall-clock time as epoch milliseconds.
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
