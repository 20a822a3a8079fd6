//! GitHub REST client: release publishing and actor public keys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::application::ports::ArtifactPublisher;
use crate::domain::ReleaseSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Asset uploads may be large; bound them generously instead.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Upper bound on the public-keys response.
const MAX_KEYS_BODY: usize = 1 << 20;
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct Release {
    id: u64,
    upload_url: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateRelease<'a> {
    tag_name: &'a str,
    name: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct UserKey {
    #[serde(default)]
    key: String,
}

/// Strips the RFC 6570 template suffix from a release's `upload_url`.
fn upload_endpoint(upload_url: &str) -> &str {
    upload_url
        .split_once('{')
        .map_or(upload_url, |(base, _)| base)
}

/// Public keys from a `/users/<name>/keys` response, blanks dropped.
fn parse_user_keys(body: &str) -> Result<Vec<String>> {
    let keys: Vec<UserKey> = serde_json::from_str(body).context("parsing GitHub keys response")?;
    Ok(keys
        .into_iter()
        .map(|k| k.key.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("artifact {} has no usable file name", path.display()))
}

pub struct GitHubClient {
    client: Client,
}

impl GitHubClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("burnbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    fn api(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .timeout(REQUEST_TIMEOUT)
    }

    /// Public SSH keys of `user`. Unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns an error on a network failure, a non-200 status, or an
    /// unparseable or oversized body.
    pub async fn fetch_user_keys(&self, api_url: &str, user: &str) -> Result<Vec<String>> {
        let url = format!("{}/users/{user}/keys", api_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("fetching public keys of {user}"))?;
        if response.status() != StatusCode::OK {
            bail!("GitHub returned HTTP {} for keys of {user}", response.status());
        }
        let body = response.text().await.context("reading GitHub keys response")?;
        if body.len() > MAX_KEYS_BODY {
            bail!("GitHub keys response for {user} is too large");
        }
        parse_user_keys(&body)
    }

    async fn find_or_create_release(&self, release: &ReleaseSettings) -> Result<Release> {
        let token = release.token.expose();
        let base = format!(
            "{}/repos/{}/{}",
            release.api_url.trim_end_matches('/'),
            release.owner,
            release.repo
        );

        let response = self
            .api(self.client.get(format!("{base}/releases/tags/{}", release.tag)), token)
            .send()
            .await
            .context("looking up release")?;
        match response.status() {
            StatusCode::OK => return response.json().await.context("parsing release"),
            StatusCode::NOT_FOUND => {}
            status => bail!("looking up release {} returned HTTP {status}", release.tag),
        }

        tracing::info!(tag = %release.tag, "creating release");
        let response = self
            .api(self.client.post(format!("{base}/releases")), token)
            .json(&CreateRelease {
                tag_name: &release.tag,
                name: &release.name,
                body: &release.notes,
            })
            .send()
            .await
            .context("creating release")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("creating release {} returned HTTP {status}: {text}", release.tag);
        }
        response.json().await.context("parsing created release")
    }

    async fn delete_asset(&self, release: &ReleaseSettings, asset: &Asset) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/releases/assets/{}",
            release.api_url.trim_end_matches('/'),
            release.owner,
            release.repo,
            asset.id
        );
        let response = self
            .api(self.client.delete(url), release.token.expose())
            .send()
            .await
            .with_context(|| format!("deleting existing asset {}", asset.name))?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            bail!(
                "deleting existing asset {} returned HTTP {}",
                asset.name,
                response.status()
            );
        }
        Ok(())
    }

    async fn upload_asset(
        &self,
        release: &ReleaseSettings,
        target: &Release,
        path: &Path,
        name: &str,
    ) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let length = file
            .metadata()
            .await
            .with_context(|| format!("reading size of {}", path.display()))?
            .len();
        let response = self
            .api(
                self.client.post(upload_endpoint(&target.upload_url)),
                release.token.expose(),
            )
            .query(&[("name", name)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .timeout(UPLOAD_TIMEOUT)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .with_context(|| format!("uploading {name}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("uploading {name} returned HTTP {status}: {text}");
        }
        tracing::info!(asset = name, bytes = length, release_id = target.id, "asset uploaded");
        Ok(())
    }
}

impl ArtifactPublisher for GitHubClient {
    async fn publish(&self, release: &ReleaseSettings, files: &[PathBuf]) -> Result<()> {
        let target = self.find_or_create_release(release).await?;
        for path in files {
            let name = file_name(path)?;
            if let Some(existing) = target.assets.iter().find(|a| a.name == name) {
                tracing::info!(asset = %name, "replacing existing asset");
                self.delete_asset(release, existing).await?;
            }
            self.upload_asset(release, &target, path, &name).await?;
        }
        Ok(())
    }
}
