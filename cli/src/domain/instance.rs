//! Build server and credential types.

use anyhow::{Context, Result};
use burnbox_common::ServerState;
use chrono::{DateTime, Utc};
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use super::secret::Secret;

/// A fresh ed25519 keypair used for exactly one run.
pub struct EphemeralKeypair {
    /// OpenSSH-format private key. Never written to disk.
    pub private_key: Secret,
    /// `ssh-ed25519 AAAA...` authorized-keys line.
    pub public_key: String,
}

impl EphemeralKeypair {
    /// Generates a new keypair from the OS random source.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or encoding fails.
    pub fn generate() -> Result<Self> {
        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
            .context("generating ed25519 key")?;
        let private_key = key
            .to_openssh(LineEnding::LF)
            .context("encoding private key")?;
        let public_key = key
            .public_key()
            .to_openssh()
            .context("encoding public key")?;
        Ok(Self {
            private_key: Secret::new(private_key.as_str()),
            public_key,
        })
    }
}

/// A login credential registered at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: u64,
    /// True when an identical key already existed and was looked up instead of
    /// created. Reused credentials are never deleted.
    pub reused: bool,
}

/// Parameters for creating a server.
#[derive(Debug)]
pub struct InstanceRequest<'a> {
    pub name: &'a str,
    pub server_type: &'a str,
    pub image: &'a str,
    pub location: Option<&'a str>,
    pub user_data: Option<&'a str>,
    pub credential_ids: &'a [u64],
}

/// What the provider returns for a freshly created server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub id: u64,
    pub name: String,
    pub ip: String,
    pub datacenter: String,
}

/// Provider-reported power state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    Migrating,
    Rebuilding,
    Unknown(String),
}

impl InstanceStatus {
    #[must_use]
    pub fn from_api(value: &str) -> Self {
        match value {
            "initializing" => Self::Initializing,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "off" => Self::Off,
            "deleting" => Self::Deleting,
            "migrating" => Self::Migrating,
            "rebuilding" => Self::Rebuilding,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// True for states a new server never leaves on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Off | Self::Deleting)
    }
}

/// A server this run created and is responsible for.
#[derive(Debug)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    pub ip: String,
    pub datacenter: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub private_key: Secret,
    pub credential_id: u64,
    /// Debug credentials created (not reused) for this run.
    pub extra_credential_ids: Vec<u64>,
}

impl Instance {
    /// Credentials this run owns and must delete on teardown.
    #[must_use]
    pub fn owned_credentials(&self) -> Vec<u64> {
        std::iter::once(self.credential_id)
            .chain(self.extra_credential_ids.iter().copied())
            .filter(|id| *id != 0)
            .collect()
    }

    /// Record persisted so `burnbox cleanup` can find the server later.
    #[must_use]
    pub fn to_state(&self, provider_token: &Secret, now: DateTime<Utc>) -> ServerState {
        ServerState {
            server_id: self.id,
            server_name: self.name.clone(),
            server_ip: self.ip.clone(),
            ssh_port: self.ssh_port,
            ssh_key_id: self.credential_id,
            extra_credential_ids: self.extra_credential_ids.clone(),
            datacenter: self.datacenter.clone(),
            created_at: now,
            provider_token: provider_token.expose().to_string(),
        }
    }
}
