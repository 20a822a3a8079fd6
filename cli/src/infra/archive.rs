//! Source archive preparation: a local directory or a git clone packed into
//! one gzip tarball inside a scratch directory.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::application::ports::ArchivePreparer;
use crate::domain::{Secret, SourceLocation};
use crate::infra::command_runner::TokioCommandRunner;

const CLONE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const ARCHIVE_NAME: &str = "source.tar.gz";

/// Rewrites `git@host:owner/repo` and scheme-less URLs to HTTPS so a token
/// header can authenticate the clone.
///
/// # Errors
///
/// Returns an error for an scp-style URL without a path.
pub fn normalize_repo_url(url: &str) -> Result<String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(url.to_string());
    }
    if let Some(rest) = url.strip_prefix("git@") {
        let Some((host, path)) = rest.split_once(':') else {
            bail!("invalid BUILD_REPO_URL: {url}");
        };
        return Ok(format!("https://{host}/{path}"));
    }
    Ok(format!("https://{}", url.trim_start_matches("//")))
}

/// `AUTHORIZATION` header value for token-authenticated HTTPS git.
#[must_use]
pub fn auth_header(token: &Secret) -> String {
    let payload = format!("x-access-token:{}", token.expose().trim());
    format!("AUTHORIZATION: basic {}", STANDARD.encode(payload))
}

/// Writes `dir` (recursively, symlinks preserved) as a gzip tarball.
fn pack_directory(dir: &Path, archive: &Path) -> Result<()> {
    let file = File::create(archive).with_context(|| format!("creating {}", archive.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("archiving {}", dir.display()))?;
    builder
        .into_inner()
        .context("finishing tar stream")?
        .finish()
        .context("finishing gzip stream")?;
    Ok(())
}

pub struct SourceArchiver {
    runner: TokioCommandRunner,
}

impl Default for SourceArchiver {
    fn default() -> Self {
        Self {
            runner: TokioCommandRunner::default(),
        }
    }
}

impl SourceArchiver {
    async fn git(&self, args: &[&str], envs: &[(&str, &OsStr)]) -> Result<()> {
        let output = self
            .runner
            .run_with_env("git", args, envs, CLONE_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }
        Ok(())
    }

    async fn clone(
        &self,
        url: &str,
        reference: Option<&str>,
        token: Option<&Secret>,
        dest: &Path,
    ) -> Result<()> {
        let dest_str = dest.to_string_lossy().into_owned();
        let dest_str = dest_str.as_str();
        match token {
            Some(token) => {
                let url = normalize_repo_url(url)?;
                let header = auth_header(token);
                // Passed through the environment so the token stays out of argv.
                let envs = [
                    ("GIT_CONFIG_COUNT", OsStr::new("1")),
                    ("GIT_CONFIG_KEY_0", OsStr::new("http.extraheader")),
                    ("GIT_CONFIG_VALUE_0", OsStr::new(header.as_str())),
                    ("GIT_TERMINAL_PROMPT", OsStr::new("0")),
                ];
                self.git(&["clone", "--quiet", url.as_str(), dest_str], &envs)
                    .await?;
            }
            None => {
                let envs = [("GIT_TERMINAL_PROMPT", OsStr::new("0"))];
                self.git(&["clone", "--quiet", url, dest_str], &envs).await?;
            }
        }
        if let Some(reference) = reference {
            self.git(&["-C", dest_str, "checkout", "--quiet", reference], &[])
                .await
                .with_context(|| format!("checking out {reference}"))?;
        }
        Ok(())
    }
}

async fn pack(dir: PathBuf, archive: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || pack_directory(&dir, &archive))
        .await
        .context("archive task panicked")?
}

impl ArchivePreparer for SourceArchiver {
    async fn prepare(
        &self,
        source: &SourceLocation,
    ) -> Result<(PathBuf, Box<dyn std::any::Any + Send>)> {
        let scratch = tempfile::Builder::new()
            .prefix("burnbox-source-")
            .tempdir()
            .context("creating scratch directory")?;
        let archive = scratch.path().join(ARCHIVE_NAME);

        match source {
            SourceLocation::Directory(dir) => {
                if !dir.is_dir() {
                    bail!("BUILD_SOURCE_DIR {} is not a directory", dir.display());
                }
                tracing::info!(dir = %dir.display(), "archiving source directory");
                pack(dir.clone(), archive.clone()).await?;
            }
            SourceLocation::Repository {
                url,
                reference,
                token,
            } => {
                let checkout = scratch.path().join("checkout");
                tracing::info!(url = %url, reference = ?reference, "cloning source repository");
                self.clone(url, reference.as_deref(), token.as_ref(), &checkout)
                    .await
                    .context("cloning BUILD_REPO_URL")?;
                pack(checkout, archive.clone()).await?;
            }
        }

        let size = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        tracing::info!(archive = %archive.display(), bytes = size, "source archive ready");
        let guard: Box<dyn std::any::Any + Send> = Box::new(scratch);
        Ok((archive, guard))
    }
}
