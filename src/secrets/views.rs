//! Typed views over raw authority payloads.
//!
//! Each view is parsed once when a secret is fetched and is immutable afterwards.
//! Parsing fails on the first missing or non-string field.

use crate::authority::RawSecret;
use crate::config::LeasePolicy;
use crate::errors::{Error, Result};
use crate::lease::{Lease, SecretId};
use crate::secrets::SecretString;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Closed set of credential kinds the manager knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    Auth,
    Mongo,
    Postgres,
    TlsCert,
    CloudSts,
    Generic,
}

impl SecretKind {
    /// Name of the option that enables this kind.
    pub fn option_name(&self) -> &'static str {
        match self {
            SecretKind::Auth => "approle_auth_path",
            SecretKind::Mongo => "enable_mongo",
            SecretKind::Postgres => "enable_postgres",
            SecretKind::TlsCert => "enable_tls_cert",
            SecretKind::CloudSts => "enable_cloud_sts",
            SecretKind::Generic => "generic",
        }
    }

    /// The error returned by accessors of a kind that was never enabled.
    pub fn disabled(self) -> Error {
        Error::Disabled { kind: self, option: self.option_name() }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecretKind::Auth => "auth",
            SecretKind::Mongo => "mongo",
            SecretKind::Postgres => "postgres",
            SecretKind::TlsCert => "tls cert",
            SecretKind::CloudSts => "cloud sts",
            SecretKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// A credential parsed from one authority response.
pub trait TypedSecret: Sized + Send + Sync + 'static {
    /// Kind used in errors and logs.
    const KIND: SecretKind;

    fn parse(raw: &RawSecret) -> Result<Self>;
}

/// Read a required string field from a payload.
pub(crate) fn string_field(raw: &RawSecret, kind: SecretKind, key: &'static str) -> Result<String> {
    match raw.field(key) {
        None | Some(Value::Null) => Err(Error::EmptyField { secret: kind, key }),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(Error::InvalidFormat { secret: kind, key }),
    }
}

/// The root auth token.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub client_token: SecretString,
    pub accessor: String,
    pub policies: Vec<String>,
}

impl TypedSecret for AuthToken {
    const KIND: SecretKind = SecretKind::Auth;

    fn parse(raw: &RawSecret) -> Result<Self> {
        let auth = raw.auth.as_ref().ok_or(Error::EmptyField { secret: Self::KIND, key: "auth" })?;
        if auth.client_token.is_empty() {
            return Err(Error::EmptyField { secret: Self::KIND, key: "client_token" });
        }
        Ok(Self {
            client_token: auth.client_token.clone(),
            accessor: auth.accessor.clone(),
            policies: auth.policies.clone(),
        })
    }
}

/// Username and password, e.g. dynamic database credentials.
#[derive(Debug, Clone)]
pub struct UserPass {
    pub username: String,
    pub password: SecretString,
}

impl TypedSecret for UserPass {
    const KIND: SecretKind = SecretKind::Postgres;

    fn parse(raw: &RawSecret) -> Result<Self> {
        Self::parse_as(raw, Self::KIND)
    }
}

impl UserPass {
    /// Parse with the kind used in errors, so mongo and postgres report themselves.
    pub fn parse_as(raw: &RawSecret, kind: SecretKind) -> Result<Self> {
        Ok(Self {
            username: string_field(raw, kind, "username")?,
            password: SecretString::new(string_field(raw, kind, "password")?),
        })
    }
}

/// Temporary cloud credentials from a security token service.
#[derive(Debug, Clone)]
pub struct CloudSts {
    pub access_key: String,
    pub secret_key: SecretString,
    pub security_token: SecretString,
}

impl TypedSecret for CloudSts {
    const KIND: SecretKind = SecretKind::CloudSts;

    fn parse(raw: &RawSecret) -> Result<Self> {
        Ok(Self {
            access_key: string_field(raw, Self::KIND, "access_key")?,
            secret_key: SecretString::new(string_field(raw, Self::KIND, "secret_key")?),
            security_token: SecretString::new(string_field(raw, Self::KIND, "security_token")?),
        })
    }
}

/// An arbitrary secret returned by `read`/`write`.
#[derive(Clone, Default)]
pub struct GenericSecret {
    pub data: Map<String, Value>,
}

impl GenericSecret {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for GenericSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&String> = self.data.keys().collect();
        f.debug_struct("GenericSecret").field("keys", &keys).finish()
    }
}

impl TypedSecret for GenericSecret {
    const KIND: SecretKind = SecretKind::Generic;

    fn parse(raw: &RawSecret) -> Result<Self> {
        Ok(Self { data: raw.data.clone().unwrap_or_default() })
    }
}

/// A typed secret together with the lease it was issued under.
///
/// Published by a secret handler as `Arc<Leased<T>>` and never mutated; a renewal
/// publishes a new value that shares the payload.
pub struct Leased<T> {
    lease: Lease,
    authority_lease_id: String,
    renewable: bool,
    value: Arc<T>,
}

impl<T> Leased<T> {
    pub fn new(
        lease: Lease,
        authority_lease_id: impl Into<String>,
        renewable: bool,
        value: T,
    ) -> Self {
        Self {
            lease,
            authority_lease_id: authority_lease_id.into(),
            renewable,
            value: Arc::new(value),
        }
    }

    /// Wrap `value` parsed from `raw`, leased under `parent`.
    pub fn issue(raw: &RawSecret, value: T, policy: &LeasePolicy, parent: Option<&Lease>) -> Self {
        let (seconds, renewable) = raw.lease_terms();
        let lease = Lease::new(policy, seconds, parent);
        Self::new(lease, raw.authority_lease_id(), renewable, value)
    }

    /// Same payload and authority lease under a renewed lease.
    pub fn with_lease(&self, lease: Lease) -> Self {
        Self {
            lease,
            authority_lease_id: self.authority_lease_id.clone(),
            renewable: self.renewable,
            value: self.value.clone(),
        }
    }

    pub fn id(&self) -> SecretId {
        self.lease.id()
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// The authority's own lease id (or token accessor for auth secrets).
    pub fn authority_lease_id(&self) -> &str {
        &self.authority_lease_id
    }

    pub fn is_renewable(&self) -> bool {
        self.renewable
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Valid and not expired.
    pub fn is_usable(&self) -> bool {
        self.lease.is_valid() && !self.lease.is_expired()
    }
}

impl<T: TypedSecret> Leased<T> {
    /// Parse `raw` as `T` and lease it under `parent`.
    pub fn parse(raw: &RawSecret, policy: &LeasePolicy, parent: Option<&Lease>) -> Result<Self> {
        let value = T::parse(raw)?;
        Ok(Self::issue(raw, value, policy, parent))
    }
}

impl<T> std::ops::Deref for Leased<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Leased<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leased")
            .field("lease", &self.lease)
            .field("authority_lease_id", &self.authority_lease_id)
            .field("renewable", &self.renewable)
            .field("value", &self.value)
            .finish()
    }
}
