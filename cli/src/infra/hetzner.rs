//! Hetzner Cloud implementation of the `ResourceProvider` port.
//!
//! Talks to the public REST API with bearer authentication. Reads and deletes
//! are retried on transient failures; creates are not, so a retried request
//! can never leave a duplicate server behind.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::application::ports::ResourceProvider;
use crate::domain::{CreatedInstance, Credential, InstanceRequest, InstanceStatus, ProviderError, Secret};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SshKeyEnvelope {
    ssh_key: SshKeyBody,
}

#[derive(Debug, Deserialize)]
struct SshKeyList {
    ssh_keys: Vec<SshKeyBody>,
}

#[derive(Debug, Deserialize)]
struct SshKeyBody {
    id: u64,
}

#[derive(Debug, Serialize)]
struct CreateSshKey<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    ssh_keys: &'a [u64],
    start_after_create: bool,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

#[derive(Debug, Deserialize)]
struct ServerBody {
    id: u64,
    name: String,
    status: String,
    public_net: PublicNet,
    #[serde(default)]
    datacenter: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    #[serde(default)]
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// Colon-separated MD5 of the key blob, the form the API filters keys by.
///
/// # Errors
///
/// Returns an error if `public_key` is not `<type> <base64> [comment]`.
pub fn md5_fingerprint(public_key: &str) -> Result<String> {
    let blob = public_key
        .split_whitespace()
        .nth(1)
        .context("public key has no key material")?;
    let bytes = STANDARD
        .decode(blob)
        .context("public key material is not valid base64")?;
    let digest = md5::compute(bytes);
    Ok(digest
        .0
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

fn decode<T: DeserializeOwned>(op: &'static str, body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::Malformed {
        op,
        message: e.to_string(),
    })
}

/// Builds the error for a non-success response.
fn api_error(op: &'static str, status: StatusCode, body: &str) -> ProviderError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => ProviderError::Api {
            op,
            status: status.as_u16(),
            code: env.error.code,
            message: env.error.message,
        },
        Err(_) => ProviderError::Api {
            op,
            status: status.as_u16(),
            code: "unknown".to_string(),
            message: body.chars().take(200).collect(),
        },
    }
}

fn created_instance(server: ServerBody) -> Result<CreatedInstance, ProviderError> {
    let ip = server
        .public_net
        .ipv4
        .map(|v4| v4.ip)
        .ok_or_else(|| ProviderError::Malformed {
            op: "create server",
            message: format!("server {} has no public IPv4 address", server.id),
        })?;
    Ok(CreatedInstance {
        id: server.id,
        name: server.name,
        ip,
        datacenter: server.datacenter.map(|d| d.name).unwrap_or_default(),
    })
}

fn is_uniqueness_error(err: &ProviderError) -> bool {
    matches!(err, ProviderError::Api { status: 409, .. })
        || matches!(err, ProviderError::Api { code, .. } if code == "uniqueness_error")
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct HetznerProvider {
    client: Client,
    api_url: String,
    token: Secret,
}

impl HetznerProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_url: &str, token: Secret) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("burnbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .bearer_auth(self.token.expose())
    }

    /// Sends `request` and returns the body of a successful response.
    async fn send(
        &self,
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), ProviderError> {
        let response: Response = request.send().await.map_err(|e| ProviderError::Transport {
            op,
            message: e.without_url().to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| ProviderError::Transport {
            op,
            message: e.without_url().to_string(),
        })?;
        tracing::debug!(op, status = status.as_u16(), "provider response");
        if status.is_success() {
            Ok((status, body))
        } else {
            Err(api_error(op, status, &body))
        }
    }

    /// Like [`Self::send`], retrying transient failures. A 404 becomes
    /// [`ProviderError::NotFound`].
    async fn send_idempotent(
        &self,
        op: &'static str,
        kind: &'static str,
        id: u64,
        method: Method,
        path: &str,
    ) -> Result<String, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.send(op, self.request(method.clone(), path)).await {
                Ok((_, body)) => return Ok(body),
                Err(ProviderError::Api { status: 404, .. }) => {
                    return Err(ProviderError::NotFound {
                        kind,
                        id: id.to_string(),
                    });
                }
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    tracing::warn!(op, attempt, error = %e, "retrying provider request");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn find_credential_by_fingerprint(&self, public_key: &str) -> Result<u64, ProviderError> {
        let op = "look up ssh key";
        let fingerprint = md5_fingerprint(public_key).map_err(|e| ProviderError::Malformed {
            op,
            message: format!("{e:#}"),
        })?;
        let request = self
            .request(Method::GET, "/ssh_keys")
            .query(&[("fingerprint", fingerprint.as_str())]);
        let (_, body) = self.send(op, request).await?;
        let list: SshKeyList = decode(op, &body)?;
        list.ssh_keys
            .first()
            .map(|k| k.id)
            .ok_or(ProviderError::NotFound {
                kind: "ssh key with fingerprint",
                id: fingerprint,
            })
    }
}

impl ResourceProvider for HetznerProvider {
    async fn create_credential(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<Credential, ProviderError> {
        let op = "create ssh key";
        let request = self
            .request(Method::POST, "/ssh_keys")
            .json(&CreateSshKey { name, public_key });
        match self.send(op, request).await {
            Ok((_, body)) => {
                let created: SshKeyEnvelope = decode(op, &body)?;
                tracing::info!(ssh_key_id = created.ssh_key.id, name, "ssh key created");
                Ok(Credential {
                    id: created.ssh_key.id,
                    reused: false,
                })
            }
            Err(e) if is_uniqueness_error(&e) => {
                let id = self.find_credential_by_fingerprint(public_key).await?;
                tracing::info!(ssh_key_id = id, "ssh key already registered, reusing it");
                Ok(Credential { id, reused: true })
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_credential(&self, id: u64) -> Result<(), ProviderError> {
        self.send_idempotent(
            "delete ssh key",
            "ssh key",
            id,
            Method::DELETE,
            &format!("/ssh_keys/{id}"),
        )
        .await
        .map(|_| ())
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest<'_>,
    ) -> Result<CreatedInstance, ProviderError> {
        let op = "create server";
        let body = CreateServer {
            name: request.name,
            server_type: request.server_type,
            image: request.image,
            location: request.location,
            user_data: request.user_data,
            ssh_keys: request.credential_ids,
            start_after_create: true,
        };
        let (_, response) = self
            .send(op, self.request(Method::POST, "/servers").json(&body))
            .await?;
        let envelope: ServerEnvelope = decode(op, &response)?;
        created_instance(envelope.server)
    }

    async fn instance_status(&self, id: u64) -> Result<InstanceStatus, ProviderError> {
        let body = self
            .send_idempotent(
                "get server",
                "server",
                id,
                Method::GET,
                &format!("/servers/{id}"),
            )
            .await?;
        let envelope: ServerEnvelope = decode("get server", &body)?;
        Ok(InstanceStatus::from_api(&envelope.server.status))
    }

    async fn delete_instance(&self, id: u64) -> Result<(), ProviderError> {
        self.send_idempotent(
            "delete server",
            "server",
            id,
            Method::DELETE,
            &format!("/servers/{id}"),
        )
        .await
        .map(|_| ())
    }
}
