//! POSIX shell escaping for remote commands.
//!
//! Every value interpolated into a command line sent to the build host goes
//! through [`quote`]. Nothing else in the crate builds quoted strings by hand.

/// Quotes `value` so a POSIX shell reads it back as exactly one word with the
/// original bytes.
///
/// The value is wrapped in single quotes; each embedded `'` becomes `'\''`
/// (close quote, escaped quote, reopen quote).
#[must_use]
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Resolves `path` against the remote working directory `base` using POSIX
/// rules: absolute paths are kept, relative ones are appended.
#[must_use]
pub fn remote_join(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    let path = path.strip_prefix("./").unwrap_or(path);
    if path.is_empty() || path == "." {
        return base.to_string();
    }
    format!("{}/{path}", base.trim_end_matches('/'))
}

/// Final component of a remote path.
#[must_use]
pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Wraps `script` for execution by `sh -c`.
#[must_use]
pub fn sh_c(script: &str) -> String {
    format!("sh -c {}", quote(script))
}

/// Wraps `script` for execution by `bash -c`.
#[must_use]
pub fn bash_c(script: &str) -> String {
    format!("bash -c {}", quote(script))
}
