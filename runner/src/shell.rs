//! Helpers for assembling remote shell command lines.

/// Quote `value` for a POSIX shell. Plain words are left bare, anything else is wrapped
/// in single quotes with embedded quotes written as `'\''`.
pub fn escape(value: &str) -> String {
    if value.is_empty() {
        return "''".to_owned();
    }

    if value.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',' | '@')
    }) {
        return value.to_owned();
    }

    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Resolve `path` against a remote directory, absolute paths are kept as they are
pub fn join(directory: &str, path: &str) -> String {
    if path.starts_with('/') || directory.is_empty() {
        path.to_owned()
    } else if directory.ends_with('/') {
        format!("{directory}{path}")
    } else {
        format!("{directory}/{path}")
    }
}

/// suffix that discards everything a command prints
pub const DISCARD_OUTPUT: &str = " > /dev/null 2>&1";
