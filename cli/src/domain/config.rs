//! Run configuration: raw environment values validated into immutable settings.
//!
//! Values arrive as `(name, value)` pairs and are deserialized with `envy`.
//! Empty values count as unset. Validation failures are [`ConfigError`]s.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::error::ConfigError;
use super::secret::Secret;

pub const DEFAULT_API_URL: &str = "https://api.hetzner.cloud/v1";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_STATE_FILE: &str = ".burnbox-server-state.json";
pub const DEFAULT_DOCKER_INSTALL_URL: &str = "https://get.docker.com";

/// Environment as read, before validation. Every field is optional text so
/// that parse errors can name the offending variable.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEnv {
    hetzner_token: Option<String>,
    hetzner_api_url: Option<String>,
    hetzner_server_type: Option<String>,
    hetzner_server_image: Option<String>,
    hetzner_server_location: Option<String>,
    hetzner_server_name: Option<String>,
    hetzner_server_user_data: Option<String>,
    hetzner_ssh_port: Option<String>,
    build_source_dir: Option<String>,
    build_repo_url: Option<String>,
    build_repo_ref: Option<String>,
    build_repo_token: Option<String>,
    build_workdir: Option<String>,
    build_compose_file: Option<String>,
    build_service_name: Option<String>,
    build_timeout_minutes: Option<String>,
    artifact_dir: Option<String>,
    artifact_pattern: Option<String>,
    local_artifact_dir: Option<String>,
    keep_server_on_failure: Option<String>,
    server_state_file: Option<String>,
    user_ssh_keys: Option<String>,
    boot_stability_seconds: Option<String>,
    docker_install_url: Option<String>,
    docker_install_sha256: Option<String>,
    release_tag: Option<String>,
    release_repository: Option<String>,
    release_name: Option<String>,
    release_notes: Option<String>,
    github_token: Option<String>,
    github_repository: Option<String>,
    github_api_url: Option<String>,
    github_actions: Option<String>,
    github_actor: Option<String>,
}

impl RawEnv {
    fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars = vars.into_iter().filter(|(_, v)| !v.trim().is_empty());
        envy::from_iter(vars).map_err(|e| ConfigError::Unreadable(e.to_string()))
    }
}

/// Accepts `true`, `1` and `yes` in any case; everything else is false.
#[must_use]
pub fn parse_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        )
    })
}

fn parse_number<T: std::str::FromStr>(
    var: &'static str,
    value: Option<&str>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: format!("expected a non-negative integer, got {v:?}"),
        }),
    }
}

fn or_default(value: Option<String>, default: &str) -> String {
    value.unwrap_or_else(|| default.to_string())
}

/// What to create at the provider.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: Option<String>,
    pub user_data_path: Option<PathBuf>,
    pub ssh_port: u16,
    pub ssh_user: String,
}

/// Where the source tree comes from.
#[derive(Debug, Clone)]
pub enum SourceLocation {
    Directory(PathBuf),
    Repository {
        url: String,
        reference: Option<String>,
        token: Option<Secret>,
    },
}

/// Remote build parameters.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub work_dir: String,
    pub compose_file: String,
    pub service_name: String,
    pub artifact_dir: String,
    pub artifact_pattern: String,
    pub timeout: Duration,
    pub docker_install_url: String,
    pub docker_install_sha256: Option<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            work_dir: "burnbox-build".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            service_name: "build".to_string(),
            artifact_dir: "out".to_string(),
            artifact_pattern: "*.zip".to_string(),
            timeout: Duration::from_secs(360 * 60),
            docker_install_url: DEFAULT_DOCKER_INSTALL_URL.to_string(),
            docker_install_sha256: None,
        }
    }
}

/// A bounded wait: give up after `timeout`, probing every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Readiness wait parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessSettings {
    pub running: PollPolicy,
    pub port: PollPolicy,
    pub dial_timeout: Duration,
    pub stable: PollPolicy,
    pub stability_window: Duration,
    /// Upper bound for a single shell probe during the stability wait.
    pub probe_timeout: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            running: PollPolicy {
                timeout: Duration::from_secs(5 * 60),
                interval: Duration::from_secs(5),
            },
            port: PollPolicy {
                timeout: Duration::from_secs(5 * 60),
                interval: Duration::from_secs(3),
            },
            dial_timeout: Duration::from_secs(3),
            stable: PollPolicy {
                timeout: Duration::from_secs(8 * 60),
                interval: Duration::from_secs(10),
            },
            stability_window: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// Release publishing target.
#[derive(Debug, Clone)]
pub struct ReleaseSettings {
    pub owner: String,
    pub repo: String,
    pub tag: String,
    pub name: String,
    pub notes: String,
    pub token: Secret,
    pub api_url: String,
}

/// Everything a build run needs, validated once at startup.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub provider_token: Secret,
    pub api_url: String,
    pub server: ServerSpec,
    pub source: SourceLocation,
    pub build: BuildSettings,
    pub readiness: ReadinessSettings,
    pub local_artifact_dir: PathBuf,
    pub keep_server_on_failure: bool,
    pub state_file: PathBuf,
    pub debug_keys: Vec<String>,
    pub release: Option<ReleaseSettings>,
    /// Set only inside GitHub Actions; the actor's public keys become debug keys.
    pub github_actor: Option<String>,
    pub github_api_url: String,
}

impl BuildConfig {
    /// Validates configuration from explicit `(name, value)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required value is missing or malformed.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw = RawEnv::from_vars(vars)?;

        let provider_token = raw
            .hetzner_token
            .map(Secret::new)
            .ok_or(ConfigError::Missing("HETZNER_TOKEN"))?;

        let source = match (raw.build_source_dir, raw.build_repo_url) {
            (Some(dir), None) => SourceLocation::Directory(PathBuf::from(dir)),
            (None, Some(url)) => SourceLocation::Repository {
                url,
                reference: raw.build_repo_ref,
                token: raw.build_repo_token.map(Secret::new),
            },
            _ => return Err(ConfigError::AmbiguousSource),
        };

        let ssh_port: u16 = parse_number("HETZNER_SSH_PORT", raw.hetzner_ssh_port.as_deref(), 22)?;
        if ssh_port == 0 {
            return Err(ConfigError::Invalid {
                var: "HETZNER_SSH_PORT",
                reason: "port must be between 1 and 65535".to_string(),
            });
        }

        let timeout_minutes: u64 = parse_number(
            "BUILD_TIMEOUT_MINUTES",
            raw.build_timeout_minutes.as_deref(),
            360,
        )?;
        if timeout_minutes == 0 {
            return Err(ConfigError::Invalid {
                var: "BUILD_TIMEOUT_MINUTES",
                reason: "timeout must be at least one minute".to_string(),
            });
        }

        let timeout_seconds = timeout_minutes
            .checked_mul(60)
            .ok_or_else(|| ConfigError::Invalid {
                var: "BUILD_TIMEOUT_MINUTES",
                reason: format!("{timeout_minutes} minutes is too large"),
            })?;

        let stability_seconds: u64 = parse_number(
            "BOOT_STABILITY_SECONDS",
            raw.boot_stability_seconds.as_deref(),
            60,
        )?;

        let defaults = BuildSettings::default();
        let build = BuildSettings {
            work_dir: raw.build_workdir.unwrap_or(defaults.work_dir),
            compose_file: raw.build_compose_file.unwrap_or(defaults.compose_file),
            service_name: raw.build_service_name.unwrap_or(defaults.service_name),
            artifact_dir: raw.artifact_dir.unwrap_or(defaults.artifact_dir),
            artifact_pattern: raw.artifact_pattern.unwrap_or(defaults.artifact_pattern),
            timeout: Duration::from_secs(timeout_seconds),
            docker_install_url: raw
                .docker_install_url
                .unwrap_or(defaults.docker_install_url),
            docker_install_sha256: raw.docker_install_sha256,
        };
        if let Some(sum) = &build.docker_install_sha256 {
            if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid {
                    var: "DOCKER_INSTALL_SHA256",
                    reason: "expected 64 hexadecimal characters".to_string(),
                });
            }
        }

        let readiness = ReadinessSettings {
            stability_window: Duration::from_secs(stability_seconds),
            ..ReadinessSettings::default()
        };

        let github_api_url = or_default(raw.github_api_url, DEFAULT_GITHUB_API_URL);
        let release = match raw.release_tag {
            None => None,
            Some(tag) => {
                let repository = raw
                    .release_repository
                    .or(raw.github_repository)
                    .ok_or(ConfigError::Missing("RELEASE_REPOSITORY"))?;
                let (owner, repo) = repository
                    .split_once('/')
                    .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
                    .ok_or_else(|| ConfigError::Invalid {
                        var: "RELEASE_REPOSITORY",
                        reason: format!("expected owner/name, got {repository:?}"),
                    })?;
                let token = raw
                    .github_token
                    .map(Secret::new)
                    .ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;
                Some(ReleaseSettings {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    name: raw.release_name.unwrap_or_else(|| tag.clone()),
                    notes: raw.release_notes.unwrap_or_default(),
                    tag,
                    token,
                    api_url: github_api_url.clone(),
                })
            }
        };

        let github_actor = if parse_flag(raw.github_actions.as_deref()) {
            raw.github_actor
        } else {
            None
        };

        Ok(Self {
            provider_token,
            api_url: or_default(raw.hetzner_api_url, DEFAULT_API_URL),
            server: ServerSpec {
                name: or_default(raw.hetzner_server_name, "burnbox-builder"),
                server_type: or_default(raw.hetzner_server_type, "cx41"),
                image: or_default(raw.hetzner_server_image, "ubuntu-22.04"),
                location: raw.hetzner_server_location,
                user_data_path: raw.hetzner_server_user_data.map(PathBuf::from),
                ssh_port,
                ssh_user: "root".to_string(),
            },
            source,
            build,
            readiness,
            local_artifact_dir: PathBuf::from(or_default(raw.local_artifact_dir, "artifacts")),
            keep_server_on_failure: parse_flag(raw.keep_server_on_failure.as_deref()),
            state_file: PathBuf::from(or_default(raw.server_state_file, DEFAULT_STATE_FILE)),
            debug_keys: split_keys(raw.user_ssh_keys.as_deref()),
            release,
            github_actor,
            github_api_url,
        })
    }

    /// Secret values that must never reach a log file.
    #[must_use]
    pub fn secrets(&self) -> Vec<&str> {
        let mut out = vec![self.provider_token.expose()];
        if let SourceLocation::Repository {
            token: Some(token), ..
        } = &self.source
        {
            out.push(token.expose());
        }
        if let Some(release) = &self.release {
            out.push(release.token.expose());
        }
        out
    }
}

/// Settings for `burnbox cleanup`.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub state_file: PathBuf,
    pub keep_server_on_failure: bool,
    /// Overrides the token stored in the state file when set.
    pub provider_token: Option<Secret>,
    pub api_url: String,
}

impl CleanupConfig {
    /// Validates cleanup configuration from explicit `(name, value)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the environment cannot be read.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw = RawEnv::from_vars(vars)?;
        Ok(Self {
            state_file: PathBuf::from(or_default(raw.server_state_file, DEFAULT_STATE_FILE)),
            keep_server_on_failure: parse_flag(raw.keep_server_on_failure.as_deref()),
            provider_token: raw.hetzner_token.map(Secret::new),
            api_url: or_default(raw.hetzner_api_url, DEFAULT_API_URL),
        })
    }
}

/// Splits a comma-separated list of public keys, dropping blanks.
fn split_keys(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
