//! # Configuration Settings
//!
//! Defines the configuration structure for the credential lease manager.
//! Every timing constant used by the lease arithmetic, the auto-renew backoff
//! and the grace windows is an injected field here rather than a global.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Environment variable prefix used by [`ManagerOptions::from_env`].
pub const ENV_PREFIX: &str = "CREDLEASE";

/// Main manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct ManagerOptions {
    /// Secret authority connection settings
    #[validate(nested)]
    pub authority: AuthorityConfig,

    /// Enable mongo credential leasing
    pub enable_mongo: bool,

    /// Mongo credentials read path
    pub mongo_creds_path: String,

    /// Enable postgres credential leasing
    pub enable_postgres: bool,

    /// Postgres credentials read path
    pub postgres_creds_path: String,

    /// Enable TLS certificate leasing
    pub enable_tls_cert: bool,

    /// TLS certificate read path
    pub tls_cert_path: String,

    /// TLS certificate key read path
    pub tls_cert_key_path: String,

    /// Enable cloud STS credential leasing
    pub enable_cloud_sts: bool,

    /// Cloud STS credentials read path
    pub cloud_sts_creds_path: String,

    /// Lease arithmetic
    #[validate(nested)]
    pub lease: LeasePolicy,

    /// Auto-renew retry backoff
    #[validate(nested)]
    pub backoff: BackoffPolicy,

    /// Grace windows for revocation and resource draining
    #[validate(nested)]
    pub grace: GracePolicy,
}

impl ManagerOptions {
    /// Load options from `CREDLEASE_*` environment variables layered over the defaults.
    ///
    /// Nested fields use a double underscore, e.g. `CREDLEASE_AUTHORITY__ADDRESS` or
    /// `CREDLEASE_BACKOFF__MAX_MS`.
    pub fn from_env() -> Result<Self> {
        let options: ManagerOptions = config::Config::builder()
            .add_source(config::Config::try_from(&ManagerOptions::default())?)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        options.validate()?;
        Ok(options)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    /// Cross-field rules the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if self.enable_mongo && self.mongo_creds_path.is_empty() {
            return Err(Error::config(empty_required("mongo_creds_path", "enable_mongo")));
        }
        if self.enable_postgres && self.postgres_creds_path.is_empty() {
            return Err(Error::config(empty_required("postgres_creds_path", "enable_postgres")));
        }
        if self.enable_tls_cert {
            if self.tls_cert_path.is_empty() {
                return Err(Error::config(empty_required("tls_cert_path", "enable_tls_cert")));
            }
            if self.tls_cert_key_path.is_empty() {
                return Err(Error::config(empty_required("tls_cert_key_path", "enable_tls_cert")));
            }
        }
        if self.enable_cloud_sts && self.cloud_sts_creds_path.is_empty() {
            return Err(Error::config(empty_required("cloud_sts_creds_path", "enable_cloud_sts")));
        }
        if self.lease.renew_before_seconds >= self.lease.max_lease_seconds {
            return Err(Error::config(
                "lease.renew_before_seconds must be below lease.max_lease_seconds",
            ));
        }
        Ok(())
    }
}

fn empty_required(name: &str, required: &str) -> String {
    format!("{} cannot be empty when {} is true", name, required)
}

/// Secret authority connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Authority base address (e.g. "https://vault.example.com:8200")
    #[validate(length(min = 1, message = "Authority address cannot be empty"))]
    pub address: String,

    /// Optional namespace sent with every request
    pub namespace: Option<String>,

    /// Login path for app role authentication
    #[validate(length(min = 1, message = "AppRole auth path cannot be empty"))]
    pub approle_auth_path: String,

    /// Request timeout in seconds
    #[validate(range(min = 1, max = 300, message = "Timeout must be between 1 and 300 seconds"))]
    pub request_timeout_seconds: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            namespace: None,
            approle_auth_path: "auth/approle/login".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl AuthorityConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Lease timing policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LeasePolicy {
    /// How long before the reported lease end a renewal becomes due
    pub renew_before_seconds: u64,

    /// Upper bound of the random delay subtracted from the renew time
    #[validate(range(max = 60000, message = "Renew jitter must be at most 60s"))]
    pub renew_jitter_ms: u64,

    /// Safety margin subtracted from the reported lease end
    pub expire_before_seconds: u64,

    /// A renewed lease with less than this left is treated as a failed renewal
    pub min_remaining_seconds: u64,

    /// Increment requested from the authority on in-place renewal
    #[validate(range(min = 1, message = "Renew increment must be positive"))]
    pub renew_increment_seconds: u64,

    /// Reported durations are capped here
    #[validate(range(min = 1, message = "Max lease must be positive"))]
    pub max_lease_seconds: u64,

    /// Cache lifetime for secrets the authority reports without a lease
    #[validate(range(min = 1, message = "Static TTL must be positive"))]
    pub static_ttl_seconds: u64,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            renew_before_seconds: 60,
            renew_jitter_ms: 1000,
            expire_before_seconds: 1,
            min_remaining_seconds: 600,
            renew_increment_seconds: 3600,
            max_lease_seconds: 10 * 365 * 24 * 3600,
            static_ttl_seconds: 300,
        }
    }
}

impl LeasePolicy {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_seconds)
    }

    pub fn renew_jitter(&self) -> Duration {
        Duration::from_millis(self.renew_jitter_ms)
    }

    pub fn expire_before(&self) -> Duration {
        Duration::from_secs(self.expire_before_seconds)
    }

    pub fn min_remaining(&self) -> Duration {
        Duration::from_secs(self.min_remaining_seconds)
    }

    pub fn renew_increment(&self) -> Duration {
        Duration::from_secs(self.renew_increment_seconds)
    }

    pub fn max_lease(&self) -> Duration {
        Duration::from_secs(self.max_lease_seconds)
    }

    pub fn static_ttl(&self) -> Duration {
        Duration::from_secs(self.static_ttl_seconds)
    }
}

/// Retry backoff for failed automatic refreshes
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Added to the delay after every consecutive failure
    #[validate(range(min = 1, message = "Backoff step must be positive"))]
    pub step_ms: u64,

    /// Cap on the accumulated delay, jitter excluded
    #[validate(range(min = 1, message = "Max backoff must be positive"))]
    pub max_ms: u64,

    /// Upper bound of the random delay added on top
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { step_ms: 50, max_ms: 60_000, jitter_ms: 20 }
    }
}

/// Grace windows
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GracePolicy {
    /// Delay before a rotated-out auth token is revoked at the authority
    pub revoke_seconds: u64,

    /// Delay before a retired resource is closed
    pub drain_seconds: u64,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self { revoke_seconds: 30, drain_seconds: 30 }
    }
}

impl GracePolicy {
    pub fn revoke(&self) -> Duration {
        Duration::from_secs(self.revoke_seconds)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full `EnvFilter` directive
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let options = ManagerOptions::default();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_enabled_kind_requires_path() {
        let options = ManagerOptions { enable_postgres: true, ..Default::default() };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("postgres_creds_path cannot be empty"));

        let options = ManagerOptions {
            enable_tls_cert: true,
            tls_cert_path: "pki/cert".to_string(),
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("tls_cert_key_path"));
    }

    #[test]
    fn test_config_validation_ranges() {
        let mut options = ManagerOptions::default();
        options.authority.request_timeout_seconds = 0;
        assert!(options.validate().is_err());

        let mut options = ManagerOptions::default();
        options.authority.address = String::new();
        assert!(options.validate().is_err());

        let mut options = ManagerOptions::default();
        options.lease.max_lease_seconds = 30;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_policy_durations() {
        let lease = LeasePolicy::default();
        assert_eq!(lease.renew_before(), Duration::from_secs(60));
        assert_eq!(lease.min_remaining(), Duration::from_secs(600));

        let grace = GracePolicy::default();
        assert_eq!(grace.revoke(), Duration::from_secs(30));
        assert_eq!(grace.drain(), Duration::from_secs(30));
    }
}
