//! # Secret Handler
//!
//! A [`SecretHandler`] caches the latest secret of one kind (or one generic path)
//! together with its lease, and refreshes it through an injected [`SecretSource`].
//!
//! ## Caching rules
//!
//! - A successful fetch always publishes the new secret and clears the last error.
//! - A failed fetch records the error but keeps serving the cached secret while its
//!   lease is still valid. The cached value is only dropped once its lease was
//!   canceled, so a handler that fetched once never reports "no secret" before that.
//! - A renewal publishes a new [`Leased`] value for the same payload with a fresh
//!   lease. A renewal whose new lease would expire within `min_remaining` is
//!   rejected with [`Error::MaxLeaseExceeded`] and [`SecretHandler::renew`] falls
//!   back to a full fetch.
//!
//! ## Locking
//!
//! Fetches and renewals are serialized by an async gate. The cached pair lives
//! behind a separate synchronous mutex that is never held across an await, so
//! [`SecretHandler::current`] and [`SecretHandler::get`] never wait on the network.
//!
//! # Example
//!
//! ```rust,ignore
//! let handler = SecretHandler::new(SecretKind::Postgres, "database/creds/app", source, policy);
//! handler.fetch().await?;
//!
//! let (secret, last_error) = handler.get();
//! ```

use crate::config::LeasePolicy;
use crate::errors::{Error, Result};
use crate::lease_span;
use crate::observability::fields;
use crate::secrets::{Leased, SecretKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::Instrument;

/// Where a handler gets its secrets from.
#[async_trait]
pub trait SecretSource<T>: Send + Sync {
    /// Issue a new secret.
    async fn fetch(&self) -> Result<Leased<T>>;

    /// Extend the lease of `current` at the authority.
    ///
    /// Returns the lease duration in seconds the authority granted.
    async fn renew(&self, current: &Leased<T>) -> Result<u64> {
        let _ = current;
        Err(Error::NotRenewable)
    }
}

/// Called with `(previous, new)` whenever a fetch publishes a secret with a new id.
///
/// Runs after the new secret is visible to readers. It must not call back into
/// the handler's fetch or renew operations.
pub type ReplaceHook<T> = Arc<dyn Fn(Option<&Arc<Leased<T>>>, &Arc<Leased<T>>) + Send + Sync>;

struct HandlerState<T> {
    current: Option<Arc<Leased<T>>>,
    last_error: Option<Error>,
}

/// Cache and refresh logic for one secret.
pub struct SecretHandler<T> {
    kind: SecretKind,
    path: String,
    source: Box<dyn SecretSource<T>>,
    policy: LeasePolicy,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<HandlerState<T>>,
    on_replace: Option<ReplaceHook<T>>,
}

impl<T: Send + Sync + 'static> SecretHandler<T> {
    pub fn new(
        kind: SecretKind,
        path: impl Into<String>,
        source: impl SecretSource<T> + 'static,
        policy: LeasePolicy,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            source: Box::new(source),
            policy,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandlerState { current: None, last_error: None }),
            on_replace: None,
        }
    }

    /// Install the hook run when a fetch replaces the secret.
    pub fn with_replace_hook(mut self, hook: ReplaceHook<T>) -> Self {
        self.on_replace = Some(hook);
        self
    }

    pub fn kind(&self) -> SecretKind {
        self.kind
    }

    /// Authority path this handler reads, empty for the auth handler.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, HandlerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached secret, if any.
    pub fn current(&self) -> Option<Arc<Leased<T>>> {
        self.state().current.clone()
    }

    /// The cached secret together with the error of the last failed fetch.
    ///
    /// Both can be set at once: a failed refresh keeps the still-valid secret.
    pub fn get(&self) -> (Option<Arc<Leased<T>>>, Option<Error>) {
        let state = self.state();
        (state.current.clone(), state.last_error.clone())
    }

    /// Issue a new secret from the source and publish it.
    pub async fn fetch(&self) -> Result<Arc<Leased<T>>> {
        let _gate = self.gate.lock().await;
        self.fetch_locked().await
    }

    /// Extend the cached secret's lease in place, without falling back.
    pub async fn try_renew(&self) -> Result<Arc<Leased<T>>> {
        let _gate = self.gate.lock().await;
        self.try_renew_locked().await
    }

    /// Extend the cached secret's lease, fetching a new secret if that fails.
    pub async fn renew(&self) -> Result<Arc<Leased<T>>> {
        let _gate = self.gate.lock().await;
        self.renew_locked().await
    }

    /// Renew when the cached secret is renewable and usable, fetch otherwise.
    pub async fn refresh(&self) -> Result<Arc<Leased<T>>> {
        let _gate = self.gate.lock().await;
        self.refresh_locked().await
    }

    /// Refresh unless another caller already replaced `seen`.
    ///
    /// Several waiters woken by the same lease signal call this with the secret
    /// they waited on; only the first one reaches the authority and the others get
    /// the secret it published.
    pub async fn refresh_from(&self, seen: Option<&Arc<Leased<T>>>) -> Result<Arc<Leased<T>>> {
        let _gate = self.gate.lock().await;
        if let Some(current) = self.current() {
            let replaced = seen.map_or(true, |seen| !Arc::ptr_eq(seen, &current));
            if replaced && current.is_usable() {
                return Ok(current);
            }
        }
        self.refresh_locked().await
    }

    /// The cached secret when it is usable, otherwise the result of a refresh.
    pub async fn get_or_refresh(&self) -> Result<Arc<Leased<T>>> {
        let seen = self.current();
        match seen {
            Some(secret) if secret.is_usable() => Ok(secret),
            seen => self.refresh_from(seen.as_ref()).await,
        }
    }

    /// Cancel the cached secret's lease and every lease issued under it.
    pub fn cancel(&self) {
        if let Some(current) = self.current() {
            current.lease().cancel();
        }
    }

    async fn fetch_locked(&self) -> Result<Arc<Leased<T>>> {
        let span = lease_span!("fetch", self.kind, path = %self.path);
        match self.source.fetch().instrument(span.clone()).await {
            Ok(secret) => {
                span.record(fields::SECRET_ID, secret.id().as_u64());
                Ok(self.publish(Arc::new(secret), true))
            }
            Err(error) => {
                self.record_failure(&error);
                Err(error)
            }
        }
    }

    async fn try_renew_locked(&self) -> Result<Arc<Leased<T>>> {
        let current = self.current().ok_or(Error::NoCachedSecret)?;
        if !current.is_renewable() || !current.lease().is_valid() {
            return Err(Error::NotRenewable);
        }

        let span = lease_span!("renew", self.kind, path = %self.path);
        span.record(fields::SECRET_ID, current.id().as_u64());
        let seconds = self.source.renew(&current).instrument(span).await?;

        if self.policy.expire_offset(seconds) < self.policy.min_remaining() {
            tracing::debug!(
                kind = %self.kind,
                secret_id = %current.id(),
                lease_duration = seconds,
                "Renewed lease is below the minimum remaining time"
            );
            return Err(Error::MaxLeaseExceeded);
        }

        let renewed = current.with_lease(current.lease().renewed(&self.policy, seconds));
        Ok(self.publish(Arc::new(renewed), false))
    }

    async fn renew_locked(&self) -> Result<Arc<Leased<T>>> {
        match self.try_renew_locked().await {
            Ok(secret) => Ok(secret),
            Err(error) => {
                tracing::debug!(
                    kind = %self.kind,
                    path = %self.path,
                    error = %error,
                    "Renewal failed, fetching a new secret"
                );
                self.fetch_locked().await
            }
        }
    }

    async fn refresh_locked(&self) -> Result<Arc<Leased<T>>> {
        match self.current() {
            Some(current) if current.is_renewable() && current.is_usable() => {
                self.renew_locked().await
            }
            _ => self.fetch_locked().await,
        }
    }

    fn publish(&self, secret: Arc<Leased<T>>, fetched: bool) -> Arc<Leased<T>> {
        let previous = {
            let mut state = self.state();
            state.last_error = None;
            state.current.replace(secret.clone())
        };

        let times = secret.lease().times();
        tracing::info!(
            kind = %self.kind,
            path = %self.path,
            secret_id = %secret.id(),
            prev_secret_id = ?previous.as_ref().map(|p| p.id().as_u64()),
            renewed = !fetched,
            created_at = %times.created_at,
            renew_at = %times.renew_at,
            expire_at = %times.expire_at,
            "Published secret"
        );

        let replaced = previous.as_ref().map_or(true, |p| p.id() != secret.id());
        if replaced {
            if let Some(hook) = &self.on_replace {
                hook(previous.as_ref(), &secret);
            }
        }
        secret
    }

    fn record_failure(&self, error: &Error) {
        let mut state = self.state();
        let kept = match &state.current {
            Some(current) if current.lease().is_valid() => true,
            Some(_) => {
                state.current = None;
                false
            }
            None => false,
        };
        state.last_error = Some(error.clone());
        drop(state);

        if error.is_transient() {
            tracing::warn!(
                kind = %self.kind,
                path = %self.path,
                error = %error,
                kept_cached = kept,
                "Failed to fetch secret"
            );
        } else {
            tracing::error!(
                kind = %self.kind,
                path = %self.path,
                error = %error,
                kept_cached = kept,
                "Failed to fetch secret"
            );
        }
    }
}

impl<T> std::fmt::Debug for SecretHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretHandler").field("kind", &self.kind).field("path", &self.path).finish()
    }
}
