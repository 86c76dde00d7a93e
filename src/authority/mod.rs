//! # Secret Authority
//!
//! The seam between the lease engine and the remote secret store. Everything the
//! manager knows about the authority goes through [`SecretAuthority`]; the
//! [`vault`] module implements it over Vault's HTTP API.

pub mod vault;

pub use vault::VaultAuthority;

use crate::config::AppRoleCredentials;
use crate::errors::Result;
use crate::secrets::SecretString;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// An authority response, before any typed parsing.
#[derive(Clone, Default, Deserialize)]
pub struct RawSecret {
    #[serde(default)]
    pub request_id: String,

    /// Authority-side lease id; empty for static secrets and logins.
    #[serde(default)]
    pub lease_id: String,

    /// Lease duration in seconds; zero for secrets without a lease.
    #[serde(default)]
    pub lease_duration: u64,

    #[serde(default)]
    pub renewable: bool,

    #[serde(default)]
    pub data: Option<Map<String, Value>>,

    /// Present on login and token renewal responses.
    #[serde(default)]
    pub auth: Option<RawAuth>,
}

/// Token block of a login or token renewal response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAuth {
    pub client_token: SecretString,

    #[serde(default)]
    pub accessor: String,

    #[serde(default)]
    pub policies: Vec<String>,

    #[serde(default)]
    pub lease_duration: u64,

    #[serde(default)]
    pub renewable: bool,
}

impl RawSecret {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }

    /// Lease duration and renewability, taken from the token block when present.
    pub fn lease_terms(&self) -> (u64, bool) {
        match &self.auth {
            Some(auth) => (auth.lease_duration, auth.renewable),
            None => (self.lease_duration, self.renewable && !self.lease_id.is_empty()),
        }
    }

    /// Lease id used for renewal, or the token accessor for logins.
    pub fn authority_lease_id(&self) -> &str {
        match &self.auth {
            Some(auth) => &auth.accessor,
            None => &self.lease_id,
        }
    }
}

impl fmt::Debug for RawSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&String> = self.data.iter().flat_map(|data| data.keys()).collect();
        f.debug_struct("RawSecret")
            .field("request_id", &self.request_id)
            .field("lease_id", &self.lease_id)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("data_keys", &keys)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Operations the lease engine needs from a secret store.
///
/// Implementations must not log tokens or payload values.
#[async_trait]
pub trait SecretAuthority: Send + Sync {
    /// Log in with app role credentials. The response carries an `auth` block.
    async fn authenticate(&self, credentials: &AppRoleCredentials) -> Result<RawSecret>;

    /// Read the secret at `path`. `None` when the authority returned no secret.
    async fn read(&self, token: &SecretString, path: &str) -> Result<Option<RawSecret>>;

    /// Write `data` to `path`. `None` when the authority returned no body.
    async fn write(
        &self,
        token: &SecretString,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<RawSecret>>;

    /// Extend the lease `lease_id` by `increment`.
    async fn renew_lease(
        &self,
        token: &SecretString,
        lease_id: &str,
        increment: Duration,
    ) -> Result<RawSecret>;

    /// Extend the token's own lease by `increment`.
    async fn renew_token(&self, token: &SecretString, increment: Duration) -> Result<RawSecret>;

    /// Revoke the token and every secret issued under it.
    async fn revoke_token(&self, token: &SecretString) -> Result<()>;
}
