//! Callback data travels as `prefix_payload`. The prefix selects the
//! registered callback handler; the payload is the handler's own business.

const SEPARATOR: char = '_';

pub fn wrap_callback_data(prefix: &str, data: &str) -> String {
    format!("{prefix}{SEPARATOR}{data}")
}

/// Splits on the first `_`. Data without a separator yields two empty
/// parts, so it never matches a registered prefix.
pub fn unwrap_callback_data(data: &str) -> (&str, &str) {
    data.split_once(SEPARATOR).unwrap_or(("", ""))
}
