//! SSH value validation and client failure classification.

use anyhow::Result;

/// Validates that `key` is an ed25519 public key with non-empty key material.
///
/// Accepts the raw public key format: `ssh-ed25519 <base64-material>`.
///
/// # Errors
///
/// Returns an error if the key does not start with `ssh-ed25519 ` or has no
/// key material after the prefix.
pub fn validate_host_key(key: &str) -> Result<()> {
    let material = key
        .strip_prefix("ssh-ed25519 ")
        .ok_or_else(|| anyhow::anyhow!("host key must be an ed25519 key (got: {key:?})"))?;
    anyhow::ensure!(!material.trim().is_empty(), "host key has no key material");
    Ok(())
}

/// Extracts validated `known_hosts` lines from `ssh-keyscan` output.
///
/// Comment lines are skipped. Each remaining line must be
/// `<host> ssh-ed25519 <material>`.
///
/// # Errors
///
/// Returns an error if no usable ed25519 key line is present.
pub fn parse_keyscan_output(output: &str) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((_host, key)) = line.split_once(' ') else {
            continue;
        };
        if validate_host_key(key.trim()).is_ok() {
            lines.push(line.to_string());
        }
    }
    anyhow::ensure!(!lines.is_empty(), "ssh-keyscan returned no ed25519 host key");
    Ok(lines)
}

/// Accepts IP literals and DNS names; rejects anything that could be read as
/// an option or carry shell metacharacters.
#[must_use]
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 || host.starts_with('-') {
        return false;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// What went wrong when the `ssh` client exited with its own error status (255).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshFailure {
    /// TCP connection could not be established or was dropped.
    Dial,
    /// Connected, but authentication or host-key verification failed.
    Handshake,
}

/// Classifies `ssh` client stderr. Returns `None` when the text does not look
/// like a client-side failure, i.e. a remote command exited 255 on its own.
#[must_use]
pub fn classify_ssh_failure(stderr: &str) -> Option<SshFailure> {
    const HANDSHAKE: &[&str] = &[
        "Permission denied",
        "Host key verification failed",
        "REMOTE HOST IDENTIFICATION HAS CHANGED",
        "no matching host key type",
        "kex_exchange_identification",
        "Too many authentication failures",
    ];
    const DIAL: &[&str] = &[
        "ssh: connect to host",
        "Connection refused",
        "Connection timed out",
        "Connection reset",
        "Connection closed",
        "No route to host",
        "Could not resolve hostname",
        "Network is unreachable",
        "Broken pipe",
        "Timeout, server",
    ];
    if HANDSHAKE.iter().any(|p| stderr.contains(p)) {
        Some(SshFailure::Handshake)
    } else if DIAL.iter().any(|p| stderr.contains(p)) {
        Some(SshFailure::Dial)
    } else {
        None
    }
}
