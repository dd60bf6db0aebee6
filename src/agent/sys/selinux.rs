// src/agent/sys/selinux.rs

use std::path::Path;

use regex::Regex;

pub const UNKNOWN_CONTEXT: &str = "unknown";

const ATTR_CURRENT: &str = "/proc/self/attr/current";

/// Reads the daemon's security-context label. Any read failure degrades to
/// the `"unknown"` sentinel; the error itself never leaves this module.
pub fn current_context() -> String {
    context_from(Path::new(ATTR_CURRENT))
}

pub(crate) fn context_from(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(raw) => sanitize(&String::from_utf8_lossy(&raw)),
        Err(_) => UNKNOWN_CONTEXT.to_string(),
    }
}

/// Strips every character outside `[a-z0-9:_,]`.
pub fn sanitize(raw: &str) -> String {
    let filter = Regex::new(r"[^a-z0-9:_,]").unwrap();
    filter.replace_all(raw, "").to_string()
}
