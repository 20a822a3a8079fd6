//! Persisted record of a provisioned build server.
//!
//! Written right after the server is created and removed after a successful
//! teardown. While it exists it denotes a real remote resource that may still
//! be billing, so the standalone cleanup mode can reconcile it.
//!
//! ⚠️ The record carries the provider token so cleanup can run without the
//! caller re-supplying credentials. Treat the file like the token itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a loaded state record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state file has no server id")]
    MissingServerId,

    #[error("state file has an invalid ssh port: {0}")]
    InvalidPort(u16),
}

/// On-disk server state.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerState {
    pub server_id: u64,
    pub server_name: String,
    pub server_ip: String,
    pub ssh_port: u16,
    /// Ephemeral credential created for this run.
    pub ssh_key_id: u64,
    /// Debug credentials created for this run (reused ones are never listed).
    #[serde(default, alias = "user_key_ids")]
    pub extra_credential_ids: Vec<u64>,
    #[serde(default)]
    pub datacenter: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "hetzner_token")]
    pub provider_token: String,
}

impl ServerState {
    /// Every credential id that must be deleted together with the server.
    pub fn credential_ids(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.ssh_key_id)
            .chain(self.extra_credential_ids.iter().copied())
            .filter(|id| *id != 0)
    }

    /// Checks the invariants a loaded record must satisfy.
    ///
    /// # Errors
    ///
    /// Returns an error if the server id is zero or the port is zero.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.server_id == 0 {
            return Err(StateError::MissingServerId);
        }
        if self.ssh_port == 0 {
            return Err(StateError::InvalidPort(self.ssh_port));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("server_id", &self.server_id)
            .field("server_name", &self.server_name)
            .field("server_ip", &self.server_ip)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_key_id", &self.ssh_key_id)
            .field("extra_credential_ids", &self.extra_credential_ids)
            .field("datacenter", &self.datacenter)
            .field("created_at", &self.created_at)
            .field("provider_token", &"<redacted>")
            .finish()
    }
}
