//! # Resource Clients
//!
//! A [`ResourceClient`] hands out a long-lived resource (a connection pool, a TLS
//! config) built from a leased credential, and rebuilds it when the credential
//! changes.
//!
//! ## Swap and drain
//!
//! Every [`ResourceClient::get`] asks the factory for the current credential. When
//! its id differs from the one the active resource was built with, a new resource
//! is built and becomes active. The previous one is never mutated: holders keep
//! using it until it is closed after the drain grace period.
//!
//! The credential check and the swap happen under one lock, so concurrent callers
//! observing the same credential change build exactly one new resource.
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = PostgresPoolFactory::new(manager.clone(), &pool_config)?;
//! let client = ResourceClient::new(factory, manager.options().grace.drain());
//!
//! let pool = client.get().await?;
//! sqlx::query("SELECT 1").execute(&*pool).await?;
//!
//! client.close().await?;
//! ```

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "tls")]
pub mod tls;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresClient, PostgresPoolConfig, PostgresPoolFactory};
#[cfg(feature = "tls")]
pub use tls::{server_config, TlsConfigClient, TlsConfigFactory};

use crate::errors::{Error, Result};
use crate::lease::SecretId;
use crate::secrets::Leased;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds resources from credentials.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Credential: Send + Sync + 'static;
    type Resource: Send + Sync + 'static;

    /// The credential new resources should be built with.
    async fn credential(&self) -> Result<Arc<Leased<Self::Credential>>>;

    /// Build a resource from `credential`.
    async fn connect(&self, credential: &Leased<Self::Credential>) -> Result<Self::Resource>;

    /// Release a resource. Called at most once per resource.
    async fn close(&self, resource: &Self::Resource) -> Result<()>;
}

struct Active<R> {
    lease_id: SecretId,
    resource: Arc<R>,
    closed: Arc<AtomicBool>,
}

struct ClientState<R> {
    closed: bool,
    active: Option<Active<R>>,
    retired: JoinSet<()>,
}

/// Caches one resource per credential and drains replaced ones.
pub struct ResourceClient<F: ResourceFactory> {
    factory: Arc<F>,
    drain_grace: Duration,
    drain: CancellationToken,
    state: tokio::sync::Mutex<ClientState<F::Resource>>,
}

impl<F: ResourceFactory> std::fmt::Debug for ResourceClient<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClient")
            .field("drain_grace", &self.drain_grace)
            .finish_non_exhaustive()
    }
}

impl<F: ResourceFactory> ResourceClient<F> {
    pub fn new(factory: F, drain_grace: Duration) -> Self {
        Self {
            factory: Arc::new(factory),
            drain_grace,
            drain: CancellationToken::new(),
            state: tokio::sync::Mutex::new(ClientState {
                closed: false,
                active: None,
                retired: JoinSet::new(),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The resource for the current credential, building it if needed.
    pub async fn get(&self) -> Result<Arc<F::Resource>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }

        let credential = self.factory.credential().await?;
        if let Some(active) = &state.active {
            if active.lease_id == credential.id() {
                return Ok(active.resource.clone());
            }
        }

        let resource = Arc::new(self.factory.connect(&credential).await?);
        let next = Active {
            lease_id: credential.id(),
            resource: resource.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let previous = state.active.replace(next);
        info!(
            secret_id = %credential.id(),
            prev_secret_id = ?previous.as_ref().map(|p| p.lease_id.as_u64()),
            drain_seconds = self.drain_grace.as_secs(),
            "Built resource for new credential"
        );

        while state.retired.try_join_next().is_some() {}
        if let Some(previous) = previous {
            self.retire(&mut state.retired, previous);
        }
        Ok(resource)
    }

    fn retire(&self, retired: &mut JoinSet<()>, previous: Active<F::Resource>) {
        let factory = self.factory.clone();
        let drain = self.drain.clone();
        let grace = self.drain_grace;
        retired.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = drain.cancelled() => {}
            }
            close_once(factory.as_ref(), &previous).await;
        });
    }

    /// Close the active resource and every retired one, then refuse further `get`s.
    ///
    /// Retired resources still draining are closed right away. Returns the error of
    /// closing the active resource, if any.
    pub async fn close(&self) -> Result<()> {
        let (active, mut retired) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.drain.cancel();
            (state.active.take(), std::mem::take(&mut state.retired))
        };

        let result = match active {
            Some(active) if !active.closed.swap(true, Ordering::AcqRel) => {
                self.factory.close(&active.resource).await
            }
            _ => Ok(()),
        };

        while let Some(joined) = retired.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Resource drain task ended abnormally");
            }
        }

        info!("Resource client closed");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.drain.is_cancelled()
    }
}

/// Dropping a client closes its retired resources in the background, provided a
/// runtime is still running. The active resource is not closed; use
/// [`ResourceClient::close`] for that.
impl<F: ResourceFactory> Drop for ResourceClient<F> {
    fn drop(&mut self) {
        self.drain.cancel();
        // Dropping the set would abort the drain tasks before they close anything.
        self.state.get_mut().retired.detach_all();
    }
}

async fn close_once<F: ResourceFactory>(factory: &F, resource: &Active<F::Resource>) {
    if resource.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    match factory.close(&resource.resource).await {
        Ok(()) => debug!(secret_id = %resource.lease_id, "Closed retired resource"),
        Err(e) => warn!(
            secret_id = %resource.lease_id,
            error = %e,
            "Failed to close retired resource"
        ),
    }
}
