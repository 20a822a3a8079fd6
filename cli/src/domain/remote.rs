//! Remote command lines run on the build host.
//!
//! Pure string builders. Every configured value is passed through
//! [`shell::quote`], so paths and names with spaces or quotes stay one word.

use super::config::BuildSettings;
use super::shell::{self, quote};

/// Exit code of the prerequisite check when the login user cannot install packages.
pub const EXIT_NO_PRIVILEGE: i32 = 10;
/// Exit code of the prerequisite check when `curl` is missing.
pub const EXIT_NO_CURL: i32 = 11;
/// Exit code of the prerequisite check when `sha256sum` is missing.
pub const EXIT_NO_SHA256SUM: i32 = 12;

/// Name of the combined compose output file inside the work directory.
pub const BUILD_OUTPUT_FILE: &str = ".burnbox-build-output.log";

/// Command lines derived from one [`BuildSettings`].
pub struct RemoteCommands<'a> {
    settings: &'a BuildSettings,
}

impl<'a> RemoteCommands<'a> {
    #[must_use]
    pub fn new(settings: &'a BuildSettings) -> Self {
        Self { settings }
    }

    /// Exits 0 when docker and the compose plugin (or legacy binary) are usable.
    #[must_use]
    pub fn runtime_probe(&self) -> String {
        shell::sh_c(
            "command -v docker >/dev/null 2>&1 && \
             { docker compose version >/dev/null 2>&1 || docker-compose --version >/dev/null 2>&1; }",
        )
    }

    /// Checks what the runtime installer needs; exits with one of the
    /// `EXIT_*` codes when something is missing.
    #[must_use]
    pub fn runtime_prerequisites(&self) -> String {
        let mut script = format!(
            "if [ \"$(id -u)\" -ne 0 ] && ! sudo -n true >/dev/null 2>&1; then \
               echo 'remote user is not root and has no passwordless sudo' >&2; exit {EXIT_NO_PRIVILEGE}; \
             fi; \
             command -v curl >/dev/null 2>&1 || {{ echo 'curl is not installed' >&2; exit {EXIT_NO_CURL}; }}"
        );
        if self.settings.docker_install_sha256.is_some() {
            script.push_str(&format!(
                "; command -v sha256sum >/dev/null 2>&1 || \
                 {{ echo 'sha256sum is not installed' >&2; exit {EXIT_NO_SHA256SUM}; }}"
            ));
        }
        shell::sh_c(&script)
    }

    /// Downloads the installer, verifies it when a checksum is configured,
    /// and runs it as root.
    #[must_use]
    pub fn runtime_install(&self) -> String {
        let mut script = format!(
            "set -e; tmp=$(mktemp); trap 'rm -f \"$tmp\"' EXIT; curl -fsSL {} -o \"$tmp\"",
            quote(&self.settings.docker_install_url)
        );
        if let Some(sum) = &self.settings.docker_install_sha256 {
            script.push_str(&format!(
                "; printf '%s  %s\\n' {} \"$tmp\" | sha256sum -c -",
                quote(sum)
            ));
        }
        script.push_str(
            "; if [ \"$(id -u)\" -eq 0 ]; then sh \"$tmp\"; else sudo -n sh \"$tmp\"; fi",
        );
        shell::sh_c(&script)
    }

    /// Replaces the work directory with the contents of the uploaded archive.
    #[must_use]
    pub fn stage(&self, remote_archive: &str) -> String {
        let dir = quote(&self.settings.work_dir);
        let archive = quote(remote_archive);
        shell::sh_c(&format!(
            "set -e; rm -rf {dir}; mkdir -p {dir}; tar -xzf {archive} -C {dir}; rm -f {archive}"
        ))
    }

    /// Runs the compose project. The exit status is the build service's exit
    /// status; combined output is also kept in [`BUILD_OUTPUT_FILE`].
    #[must_use]
    pub fn build(&self) -> String {
        let s = self.settings;
        let compose = quote(&s.compose_file);
        let script = format!(
            "set -euo pipefail\n\
             cd {dir}\n\
             if docker compose version >/dev/null 2>&1; then dc='docker compose'; else docker-compose --version; dc='docker-compose'; fi\n\
             $dc -f {compose} pull --ignore-pull-failures\n\
             set +e\n\
             $dc -f {compose} up --build --abort-on-container-exit --exit-code-from {service} 2>&1 | tee {output}\n\
             status=${{PIPESTATUS[0]}}\n\
             exit \"$status\"",
            dir = quote(&s.work_dir),
            service = quote(&s.service_name),
            output = quote(BUILD_OUTPUT_FILE),
        );
        shell::bash_c(&script)
    }

    /// Directory searched for artifacts, relative to the login directory
    /// unless absolute.
    #[must_use]
    pub fn artifact_root(&self) -> String {
        shell::remote_join(&self.settings.work_dir, &self.settings.artifact_dir)
    }

    /// Lists matching artifact files, one path per line.
    #[must_use]
    pub fn list_artifacts(&self) -> String {
        format!(
            "find {} -maxdepth 2 -type f -name {} -print",
            quote(&self.artifact_root()),
            quote(&self.settings.artifact_pattern)
        )
    }

    /// Container logs of the compose project, for failure diagnostics.
    #[must_use]
    pub fn compose_logs(&self) -> String {
        let compose = quote(&self.settings.compose_file);
        shell::sh_c(&format!(
            "cd {} && if docker compose version >/dev/null 2>&1; then \
             docker compose -f {compose} logs --no-color; \
             else docker-compose -f {compose} logs --no-color; fi",
            quote(&self.settings.work_dir)
        ))
    }
}

/// Writes stdin to `path` and then sets its mode.
#[must_use]
pub fn upload(path: &str, mode: u32) -> String {
    let path = quote(path);
    shell::sh_c(&format!("cat > {path} && chmod {mode:o} {path}"))
}

/// Streams `path` to stdout.
#[must_use]
pub fn download(path: &str) -> String {
    format!("cat {}", quote(path))
}

/// Wraps `command` so the remote login shell records its process group id in
/// `pid_file` for the lifetime of the command.
#[must_use]
pub fn tracked(command: &str, pid_file: &str) -> String {
    let pid = quote(pid_file);
    format!("printf '%s' \"$$\" > {pid}; ( {command} ); rc=$?; rm -f {pid}; exit $rc")
}

/// Kills the process group recorded by [`tracked`].
#[must_use]
pub fn kill_tracked(pid_file: &str) -> String {
    let pid = quote(pid_file);
    format!("pid=$(cat {pid} 2>/dev/null) && [ -n \"$pid\" ] && kill -KILL -- \"-$pid\"; rm -f {pid}")
}
