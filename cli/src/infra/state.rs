//! Infrastructure implementation of the `ServerStateStore` port.
//!
//! `StateManager` provides async load/save using `tokio::task::spawn_blocking`
//! with atomic write (temp file + rename) so a crash never leaves a
//! half-written record behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burnbox_common::ServerState;

use crate::application::ports::ServerStateStore;

/// State file manager implementing `ServerStateStore` for the infra layer.
pub struct StateManager {
    path: PathBuf,
}

impl StateManager {
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_sync(&self) -> Result<Option<ServerState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading state file {}", self.path.display()))?;
        let state: ServerState = serde_json::from_str(&content)
            .with_context(|| format!("parsing state file {}", self.path.display()))?;
        state
            .validate()
            .with_context(|| format!("invalid state file {}", self.path.display()))?;
        Ok(Some(state))
    }

    fn save_sync(&self, state: &ServerState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(state).context("serializing state")?;

        let temp_path = self.path.with_extension("json.tmp");
        write_private(&temp_path, content.as_bytes())?;
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("finalizing state file {}", self.path.display()))?;
        Ok(())
    }

    fn clear_sync(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("removing state file {}", self.path.display())),
        }
    }
}

/// Creates (or truncates) `path` readable by the owner only, then writes it.
fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("writing temp file {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("writing temp file {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("setting permissions on {}", path.display()))?;
    }
    Ok(())
}

impl ServerStateStore for StateManager {
    async fn load_async(&self) -> Result<Option<ServerState>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || StateManager::with_path(path).load_sync())
            .await
            .context("state load task panicked")?
    }

    async fn save_async(&self, state: &ServerState) -> Result<()> {
        let path = self.path.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || StateManager::with_path(path).save_sync(&state))
            .await
            .context("state save task panicked")?
    }

    async fn clear_async(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || StateManager::with_path(path).clear_sync())
            .await
            .context("state clear task panicked")?
    }
}
