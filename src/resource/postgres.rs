//! # Postgres Pool Factory
//!
//! Builds a `sqlx` Postgres pool for the manager's current postgres credential.
//! The connection URL carries everything except the username and password, which
//! come from the credential.
//!
//! Every pool connects eagerly: a rotation to a credential or server that does not
//! work fails `get` and leaves the previous pool active.

use crate::errors::{Error, Result};
use crate::manager::CredentialManager;
use crate::resource::{ResourceClient, ResourceFactory};
use crate::secrets::{Leased, UserPass};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

/// Client handing out the pool for the current postgres credential.
pub type PostgresClient = ResourceClient<PostgresPoolFactory>;

/// Pool settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PostgresPoolConfig {
    /// Connection URL without credentials, e.g. `postgres://db.internal:5432/app`
    #[validate(length(min = 1, message = "Postgres URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections per pool
    #[validate(range(min = 1, max = 1000, message = "Max connections must be between 1 and 1000"))]
    pub max_connections: u32,

    /// Minimum number of idle connections kept open
    pub min_connections: u32,

    /// Timeout for acquiring a connection, in seconds
    #[validate(range(min = 1, max = 300, message = "Acquire timeout must be between 1 and 300"))]
    pub acquire_timeout_seconds: u64,
}

impl Default for PostgresPoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_seconds: 30,
        }
    }
}

impl PostgresPoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

/// Builds one eagerly connected pool per postgres credential.
pub struct PostgresPoolFactory {
    manager: Arc<CredentialManager>,
    config: PostgresPoolConfig,
    connect_options: PgConnectOptions,
}

impl PostgresPoolFactory {
    pub fn new(manager: Arc<CredentialManager>, config: &PostgresPoolConfig) -> Result<Self> {
        config.validate()?;
        if config.min_connections > config.max_connections {
            return Err(Error::config("min_connections cannot be greater than max_connections"));
        }
        let connect_options = PgConnectOptions::from_str(&config.url)?;
        Ok(Self { manager, config: config.clone(), connect_options })
    }

    /// Connect options for `credential`.
    pub fn connect_options(&self, credential: &UserPass) -> PgConnectOptions {
        self.connect_options
            .clone()
            .username(&credential.username)
            .password(credential.password.expose_secret())
    }
}

#[async_trait]
impl ResourceFactory for PostgresPoolFactory {
    type Credential = UserPass;
    type Resource = PgPool;

    async fn credential(&self) -> Result<Arc<Leased<UserPass>>> {
        self.manager.postgres_secret().await
    }

    async fn connect(&self, credential: &Leased<UserPass>) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(self.config.acquire_timeout())
            .test_before_acquire(true)
            .connect_with(self.connect_options(credential))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    host = %self.connect_options.get_host(),
                    username = %credential.username,
                    secret_id = %credential.id(),
                    error = %e,
                    "Failed to connect Postgres pool"
                );
            })?;

        tracing::info!(
            host = %self.connect_options.get_host(),
            database = ?self.connect_options.get_database(),
            username = %credential.username,
            secret_id = %credential.id(),
            max_connections = self.config.max_connections,
            "Postgres pool created"
        );
        Ok(pool)
    }

    async fn close(&self, pool: &PgPool) -> Result<()> {
        pool.close().await;
        Ok(())
    }
}
