//! HTTP client for a Vault KV v2 secret store

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::SecretStoreError;
use crate::store::{SecretStore, VersionedEntry};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Vault KV v2 client authenticated with a token
#[derive(Clone)]
pub struct VaultKvStore {
    client: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for VaultKvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKvStore")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: Option<BTreeMap<String, String>>,
    metadata: Metadata,
}

#[derive(Deserialize)]
struct Metadata {
    version: u64,
}

#[derive(Deserialize)]
struct WriteResponse {
    data: Metadata,
}

impl VaultKvStore {
    /// Create a client for `address`, e.g. `https://vault.example.com:8200`
    ///
    /// # Errors
    /// Returns an error if the address is not a valid URL.
    pub fn new(address: impl AsRef<str>, token: impl Into<String>) -> Result<Self, SecretStoreError> {
        Self::with_client(address, token, Client::new())
    }

    /// Create a client with a custom `reqwest::Client`
    ///
    /// # Errors
    /// Returns an error if the address is not a valid URL.
    pub fn with_client(
        address: impl AsRef<str>,
        token: impl Into<String>,
        client: Client,
    ) -> Result<Self, SecretStoreError> {
        let mut base_url = Url::parse(address.as_ref())?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, SecretStoreError> {
        self.base_url
            .join(&format!("v1/{path}"))
            .map_err(SecretStoreError::Url)
    }

    /// Turn a non-success status into `SecretStoreError::Api`
    async fn check(response: Response) -> Result<Response, SecretStoreError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(SecretStoreError::Api { status, message });
        }
        Ok(response)
    }
}

#[async_trait]
impl SecretStore for VaultKvStore {
    #[instrument(skip(self, description))]
    async fn ensure_mount(&self, mount: &str, description: &str) -> Result<(), SecretStoreError> {
        let url = self.url(&format!("sys/mounts/{mount}"))?;
        let response = self
            .client
            .get(url.clone())
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        // Older servers answer 400 instead of 404 for unknown mounts
        match response.status() {
            status if status.is_success() => {
                debug!("mount exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {}
            _ => {
                Self::check(response).await?;
            }
        }

        let body = json!({
            "type": "kv",
            "description": description,
            "options": { "version": "2" },
        });
        let response = self
            .client
            .post(url)
            .header(TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;

        info!("created KV v2 mount");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_latest(
        &self,
        mount: &str,
        entry: &str,
    ) -> Result<Option<VersionedEntry>, SecretStoreError> {
        let url = self.url(&format!("{mount}/data/{entry}"))?;
        let response = self
            .client
            .get(url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;

        let body: ReadResponse = response
            .json()
            .await
            .map_err(|e| SecretStoreError::InvalidResponse(e.to_string()))?;

        // A deleted latest version reads back with null data
        Ok(body.data.data.map(|data| VersionedEntry {
            version: body.data.metadata.version,
            data,
        }))
    }

    #[instrument(skip(self, data))]
    async fn write(
        &self,
        mount: &str,
        entry: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<u64, SecretStoreError> {
        let url = self.url(&format!("{mount}/data/{entry}"))?;
        let response = self
            .client
            .post(url)
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "data": data }))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let body: WriteResponse = response
            .json()
            .await
            .map_err(|e| SecretStoreError::InvalidResponse(e.to_string()))?;
        Ok(body.data.version)
    }
}
