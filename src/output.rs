//! Result clamping and error classification
//!
//! Both functions are total: clamping never fails a run, and every failure
//! text maps to exactly one [`ErrorCode`].

use crate::ErrorCode;
use serde_json::{Value as JsonValue, json};

/// Longest error message handed back to the caller, in characters
pub const MAX_ERROR_MESSAGE_CHARS: usize = 600;

/// Longest serialized prefix kept in a truncation marker, in characters
pub const MAX_PREVIEW_CHARS: usize = 2_000;

/// Sentinels checked in order; the first hit wins.
const SENTINELS: &[(&str, ErrorCode)] = &[
    ("CODE_EXEC_DISABLED", ErrorCode::CodeExecDisabled),
    ("INVALID_INPUT", ErrorCode::InvalidInput),
    ("PKG_INSTALL_DISABLED", ErrorCode::PkgInstallDisabled),
    ("NET_FETCH_DISABLED", ErrorCode::NetFetchDisabled),
    ("MAX_PENDING_JOBS", ErrorCode::MaxPendingJobs),
    ("TIMEOUT", ErrorCode::Timeout),
    // QuickJS raises this when the interrupt handler fires
    ("interrupted", ErrorCode::Timeout),
];

/// Map raw failure text to an error code
pub fn classify(text: &str) -> ErrorCode {
    SENTINELS
        .iter()
        .find(|(needle, _)| text.contains(needle))
        .map(|(_, code)| *code)
        .unwrap_or(ErrorCode::ExecutionError)
}

/// Bound a result by its serialized size
///
/// `serialized` is the JSON text the guest produced for `value`. When it is
/// larger than `max_bytes` the value is replaced by a marker object.
pub fn clamp(value: JsonValue, serialized: &str, max_bytes: u64) -> JsonValue {
    if (serialized.len() as u64) <= max_bytes {
        return value;
    }

    let keep = usize::try_from(max_bytes)
        .unwrap_or(usize::MAX)
        .min(MAX_PREVIEW_CHARS);
    json!({
        "truncated": true,
        "output": truncate_chars(serialized, keep),
    })
}

/// Strip stack frames and bound the length of a failure message
pub fn clean_message(text: &str) -> String {
    let first_frame = text
        .find("\n    at ")
        .or_else(|| text.find("\n    at"))
        .unwrap_or(text.len());
    let trimmed = text[..first_frame].trim();
    truncate_chars(trimmed, MAX_ERROR_MESSAGE_CHARS)
}

/// Keep at most `max` characters, never splitting a code point
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
