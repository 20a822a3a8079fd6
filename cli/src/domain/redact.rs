//! Secret redaction for build logs written to disk.

use std::sync::LazyLock;

use regex::Regex;

const REDACTED: &str = "REDACTED";

/// `name=value` and `Authorization:` shapes that carry credentials.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(github_token\s*[=:]\s*)\S+",
        r"(?i)(hetzner_token\s*[=:]\s*)\S+",
        r"(?i)(build_repo_token\s*[=:]\s*)\S+",
        r"(?i)(authorization:\s*(?:bearer|token|basic)\s+)\S+",
        r"(?i)(x-access-token:)[^@\s]+",
        r"(?i)(\btoken\s*=\s*)\S+",
        r"(?i)(\b(?:password|passwd|secret)\s*=\s*)\S+",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Replaces credential values in `text` with `REDACTED`, line by line.
#[must_use]
pub fn sanitize_log(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let mut line = line.to_string();
        for pattern in SECRET_PATTERNS.iter() {
            line = pattern
                .replace_all(&line, format!("${{1}}{REDACTED}"))
                .into_owned();
        }
        out.push_str(&line);
    }
    out
}

/// Like [`sanitize_log`], and additionally masks every literal occurrence of
/// the given secret values regardless of surrounding syntax.
#[must_use]
pub fn sanitize_with_secrets(text: &str, secrets: &[&str]) -> String {
    let mut out = sanitize_log(text);
    for secret in secrets.iter().filter(|s| s.len() >= 4) {
        out = out.replace(secret, REDACTED);
    }
    out
}
