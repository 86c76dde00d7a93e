//! HashiCorp Vault implementation of [`SecretAuthority`].
//!
//! Talks to Vault's HTTP API directly with `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | authenticate | `POST /v1/<approle_auth_path>` |
//! | read | `GET /v1/<path>` |
//! | write | `POST /v1/<path>` |
//! | renew_lease | `PUT /v1/sys/leases/renew` |
//! | renew_token | `POST /v1/auth/token/renew-self` |
//! | revoke_token | `POST /v1/auth/token/revoke-self` |
//!
//! Tokens go in `X-Vault-Token`, the optional namespace in `X-Vault-Namespace`.

use super::{RawSecret, SecretAuthority};
use crate::config::{AppRoleCredentials, AuthorityConfig};
use crate::errors::{Error, Result};
use crate::secrets::SecretString;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Vault error body: `{"errors": ["..."]}`
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Vault over HTTP.
#[derive(Debug, Clone)]
pub struct VaultAuthority {
    client: reqwest::Client,
    address: String,
    namespace: Option<String>,
    approle_auth_path: String,
}

impl VaultAuthority {
    pub fn new(config: &AuthorityConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(Error::config("Vault address cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::config(format!("Failed to build Vault HTTP client: {}", e)))?;

        Ok(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
            approle_auth_path: config.approle_auth_path.trim_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str, token: Option<&SecretString>) -> RequestBuilder {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token.expose_secret());
        }
        if let Some(namespace) = &self.namespace {
            builder = builder.header(NAMESPACE_HEADER, namespace);
        }
        builder
    }

    /// Send a request and decode the optional secret body.
    async fn send(&self, path: &str, builder: RequestBuilder) -> Result<Option<RawSecret>> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(error_for_status(status, path, &body));
        }
        if status == StatusCode::NO_CONTENT || body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn send_expecting(&self, path: &str, builder: RequestBuilder) -> Result<RawSecret> {
        self.send(path, builder)
            .await?
            .ok_or_else(|| Error::authority(None, format!("empty response from '{}'", path)))
    }
}

fn error_for_status(status: StatusCode, path: &str, body: &[u8]) -> Error {
    let errors = serde_json::from_slice::<ErrorBody>(body).unwrap_or_default().errors;
    let message = if errors.is_empty() {
        status.canonical_reason().unwrap_or("unknown status").to_string()
    } else {
        errors.join("; ")
    };

    match status {
        StatusCode::NOT_FOUND => Error::not_found(path),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::authentication_failed(message),
        _ => Error::authority(Some(status.as_u16()), message),
    }
}

#[async_trait]
impl SecretAuthority for VaultAuthority {
    async fn authenticate(&self, credentials: &AppRoleCredentials) -> Result<RawSecret> {
        let path = self.approle_auth_path.as_str();
        let body = json!({
            "role_id": credentials.role_id,
            "secret_id": credentials.secret_id.expose_secret(),
        });

        let request = self.request(Method::POST, path, None).json(&body);
        let secret = self.send_expecting(path, request).await?;
        if secret.auth.is_none() {
            return Err(Error::authentication_failed(format!(
                "no auth block in response from '{}'",
                path
            )));
        }
        Ok(secret)
    }

    async fn read(&self, token: &SecretString, path: &str) -> Result<Option<RawSecret>> {
        self.send(path, self.request(Method::GET, path, Some(token))).await
    }

    async fn write(
        &self,
        token: &SecretString,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<RawSecret>> {
        self.send(path, self.request(Method::POST, path, Some(token)).json(data)).await
    }

    async fn renew_lease(
        &self,
        token: &SecretString,
        lease_id: &str,
        increment: Duration,
    ) -> Result<RawSecret> {
        let path = "sys/leases/renew";
        let body = json!({ "lease_id": lease_id, "increment": increment.as_secs() });
        self.send_expecting(path, self.request(Method::PUT, path, Some(token)).json(&body)).await
    }

    async fn renew_token(&self, token: &SecretString, increment: Duration) -> Result<RawSecret> {
        let path = "auth/token/renew-self";
        let body = json!({ "increment": increment.as_secs() });
        self.send_expecting(path, self.request(Method::POST, path, Some(token)).json(&body)).await
    }

    async fn revoke_token(&self, token: &SecretString) -> Result<()> {
        let path = "auth/token/revoke-self";
        self.send(path, self.request(Method::POST, path, Some(token))).await.map(|_| ())
    }
}
