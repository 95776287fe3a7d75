use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::registry::UsernameMap;

/// Access token for the forge, read from the environment so it never
/// appears on the command line.
pub const TOKEN_ENV: &str = "GITWARDEN_TOKEN";

const ARMOR_HEADER: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";

/// Where the verification keyring comes from. Exactly one source is
/// selected during configuration resolution.
#[derive(Debug, Clone)]
pub enum KeyringSource {
    /// Pre-built armored keyring read verbatim from disk.
    File(PathBuf),
    /// Assembled from per-user key fetches against a forge instance.
    Remote { base_url: String },
}

/// Key material and user lookups against the forge. A trait seam so
/// keyring assembly can be exercised without a network.
pub trait KeyFetcher {
    /// Armored public key for `username`, by the `<base>/<username>.gpg`
    /// convention.
    fn fetch_key(&self, username: &str) -> Result<String>;

    /// Forge username for a committer email, via the user-search API.
    fn lookup_username(&self, email: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        // A hung forge must not hang the whole run.
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: std::env::var(TOKEN_ENV).ok(),
        })
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::blocking::Response> {
        let mut request = request;
        if let Some(token) = &self.token {
            request = request.header("PRIVATE-TOKEN", token);
        }
        let response = request
            .send()
            .with_context(|| format!("request for {what} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("{what} returned {}", response.status()));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct ForgeUser {
    username: String,
}

impl KeyFetcher for HttpFetcher {
    fn fetch_key(&self, username: &str) -> Result<String> {
        let url = format!("{}/{}.gpg", self.base_url, username);
        let body = self
            .send(self.client.get(&url), &url)?
            .text()
            .with_context(|| format!("reading response from {url}"))?;
        if !body.contains(ARMOR_HEADER) {
            return Err(anyhow!("{url} did not return an armored public key"));
        }
        Ok(body)
    }

    fn lookup_username(&self, email: &str) -> Result<String> {
        let url = format!("{}/api/v4/users", self.base_url);
        let users: Vec<ForgeUser> = self
            .send(
                self.client.get(&url).query(&[("search", email)]),
                &format!("user search for {email}"),
            )?
            .json()
            .with_context(|| format!("decoding user search response for {email}"))?;
        users
            .into_iter()
            .next()
            .map(|user| user.username)
            .ok_or_else(|| anyhow!("no forge user found for {email}"))
    }
}

/// Builds the keyring from a static identity-to-username map. Any fetch
/// problem aborts: the walk must never start with a partial keyring.
pub fn assemble_from_usernames(fetcher: &dyn KeyFetcher, map: &UsernameMap) -> Result<String> {
    let mut ring = String::new();
    for (identity, username) in map.iter() {
        let key = fetcher
            .fetch_key(username)
            .with_context(|| format!("fetching key for {identity} ({username})"))?;
        debug!(identity, username, "fetched key");
        push_key(&mut ring, &key);
    }
    if ring.is_empty() {
        return Err(anyhow!("assembled keyring is empty"));
    }
    Ok(ring)
}

/// Builds the keyring from the committer emails of the walked range,
/// resolving each to a username first.
pub fn assemble_from_emails(fetcher: &dyn KeyFetcher, emails: &BTreeSet<String>) -> Result<String> {
    let mut ring = String::new();
    for email in emails {
        let username = fetcher
            .lookup_username(email)
            .with_context(|| format!("resolving {email}"))?;
        let key = fetcher
            .fetch_key(&username)
            .with_context(|| format!("fetching key for {email} ({username})"))?;
        debug!(email, username, "fetched key");
        push_key(&mut ring, &key);
    }
    if ring.is_empty() {
        return Err(anyhow!("no committers in range, assembled keyring is empty"));
    }
    Ok(ring)
}

fn push_key(ring: &mut String, key: &str) {
    ring.push_str(key);
    if !key.ends_with('\n') {
        ring.push('\n');
    }
}
