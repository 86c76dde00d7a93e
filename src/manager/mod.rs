//! # Credential Manager
//!
//! [`CredentialManager`] owns one [`SecretHandler`] per enabled credential kind, all
//! authorized by a root auth token obtained with app role credentials.
//!
//! ## Startup
//!
//! Construction logs in and performs one fetch for every enabled kind. Any failure
//! fails construction, and no background task is started before all fetches
//! succeeded.
//!
//! ## Cascading invalidation
//!
//! Every dependent secret is leased under the auth lease that was current when it
//! was fetched. When the auth token is replaced, the previous auth lease is
//! canceled, which fires the expire signal of every dependent lease. Each dependent
//! auto-renew task then fetches once with the new token. The previous token is
//! revoked at the authority after [`GracePolicy::revoke`](crate::config::GracePolicy::revoke),
//! or right away when the manager shuts down.
//!
//! # Example
//!
//! ```rust,ignore
//! let authority = Arc::new(VaultAuthority::new(&options.authority)?);
//! let manager = CredentialManager::new(authority, options).await?;
//!
//! let creds = manager.postgres_secret().await?;
//! connect(&creds.username, creds.password.expose_secret()).await?;
//!
//! manager.shutdown().await;
//! ```

use crate::authority::{RawSecret, SecretAuthority};
use crate::config::{AppRoleCredentials, LeasePolicy, ManagerOptions};
use crate::errors::{Error, Result};
use crate::handler::{ReplaceHook, SecretHandler, SecretSource};
use crate::lease::Lease;
use crate::observability::log_options_info;
use crate::renewal::spawn_auto_renew;
use crate::secrets::{
    AuthToken, CloudSts, GenericSecret, Leased, SecretKind, TlsCert, TypedSecret, UserPass,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where the app role credentials come from.
#[derive(Debug, Clone, Default)]
pub enum CredentialSource {
    /// Resolved from `VAULT_AUTHCREDENTIALS` on every login.
    #[default]
    Environment,
    /// Fixed credentials.
    Static(AppRoleCredentials),
}

impl CredentialSource {
    pub fn resolve(&self) -> Result<AppRoleCredentials> {
        match self {
            CredentialSource::Environment => AppRoleCredentials::from_env(),
            CredentialSource::Static(credentials) => {
                credentials.validate()?;
                Ok(credentials.clone())
            }
        }
    }
}

/// Logs in with app role credentials and renews the token itself.
struct AuthSource {
    authority: Arc<dyn SecretAuthority>,
    credentials: CredentialSource,
    policy: LeasePolicy,
}

#[async_trait]
impl SecretSource<AuthToken> for AuthSource {
    async fn fetch(&self) -> Result<Leased<AuthToken>> {
        let credentials = self.credentials.resolve()?;
        let raw = self.authority.authenticate(&credentials).await?;
        Leased::parse(&raw, &self.policy, None)
    }

    async fn renew(&self, current: &Leased<AuthToken>) -> Result<u64> {
        let raw =
            self.authority.renew_token(&current.client_token, self.policy.renew_increment()).await?;
        Ok(raw.lease_terms().0)
    }
}

/// The auth secret dependent requests are authorized by.
///
/// A token that is due for renewal may be replaced at any moment, so dependents
/// back off until the auth task has renewed or rotated it instead of issuing
/// secrets under it. Leases that were due from the start are exempt.
fn current_auth(auth: &SecretHandler<AuthToken>) -> Result<Arc<Leased<AuthToken>>> {
    match auth.current() {
        Some(secret) if secret.is_usable() && !awaiting_renewal(secret.lease()) => Ok(secret),
        _ => Err(Error::Unauthenticated),
    }
}

fn awaiting_renewal(lease: &Lease) -> bool {
    lease.is_renew_due() && !lease.times().renew_after.is_zero()
}

type Parser<T> = fn(&RawSecret) -> Result<T>;

/// Reads one path with the current auth token and renews by authority lease id.
struct LeasedPathSource<T> {
    path: String,
    authority: Arc<dyn SecretAuthority>,
    auth: Arc<SecretHandler<AuthToken>>,
    policy: LeasePolicy,
    parse: Parser<T>,
}

impl<T> LeasedPathSource<T> {
    fn new(
        path: &str,
        authority: &Arc<dyn SecretAuthority>,
        auth: &Arc<SecretHandler<AuthToken>>,
        policy: &LeasePolicy,
        parse: Parser<T>,
    ) -> Self {
        Self {
            path: path.to_string(),
            authority: authority.clone(),
            auth: auth.clone(),
            policy: policy.clone(),
            parse,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> SecretSource<T> for LeasedPathSource<T> {
    async fn fetch(&self) -> Result<Leased<T>> {
        let auth = current_auth(&self.auth)?;
        let raw = self
            .authority
            .read(&auth.client_token, &self.path)
            .await?
            .ok_or_else(|| Error::not_found(&self.path))?;
        let value = (self.parse)(&raw)?;
        Ok(Leased::issue(&raw, value, &self.policy, Some(auth.lease())))
    }

    async fn renew(&self, current: &Leased<T>) -> Result<u64> {
        let auth = current_auth(&self.auth)?;
        let raw = self
            .authority
            .renew_lease(
                &auth.client_token,
                current.authority_lease_id(),
                self.policy.renew_increment(),
            )
            .await?;
        Ok(raw.lease_terms().0)
    }
}

/// Reads the certificate and key paths and combines them into one secret.
struct TlsSource {
    cert_path: String,
    key_path: String,
    authority: Arc<dyn SecretAuthority>,
    auth: Arc<SecretHandler<AuthToken>>,
    policy: LeasePolicy,
}

impl TlsSource {
    async fn read(&self, auth: &Leased<AuthToken>, path: &str) -> Result<RawSecret> {
        self.authority.read(&auth.client_token, path).await?.ok_or_else(|| Error::not_found(path))
    }
}

#[async_trait]
impl SecretSource<TlsCert> for TlsSource {
    async fn fetch(&self) -> Result<Leased<TlsCert>> {
        let auth = current_auth(&self.auth)?;
        let cert = self.read(&auth, &self.cert_path).await?;
        let key = self.read(&auth, &self.key_path).await?;
        let value = TlsCert::from_parts(&cert, &key)?;

        // The pair lives as long as its shorter-lived half.
        let seconds = [cert.lease_terms().0, key.lease_terms().0]
            .into_iter()
            .filter(|seconds| *seconds > 0)
            .min()
            .unwrap_or(0);
        let lease = Lease::new(&self.policy, seconds, Some(auth.lease()));
        Ok(Leased::new(lease, cert.authority_lease_id(), false, value))
    }
}

type Tasks = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Handler of one generic path, set once its first fetch succeeded.
type GenericSlot = Arc<OnceCell<Arc<SecretHandler<GenericSecret>>>>;

fn track(tasks: &Tasks, handle: JoinHandle<()>) {
    let mut tasks = tasks.lock().unwrap_or_else(PoisonError::into_inner);
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

/// Cancel the previous auth lease and revoke its token after the grace period.
fn rotation_hook(
    authority: Arc<dyn SecretAuthority>,
    grace: Duration,
    shutdown: CancellationToken,
    tasks: Tasks,
) -> ReplaceHook<AuthToken> {
    Arc::new(move |previous, current| {
        let Some(previous) = previous else {
            return;
        };
        previous.lease().cancel();

        let prev_secret_id = previous.id();
        info!(
            secret_id = %current.id(),
            prev_secret_id = %prev_secret_id,
            revoke_in_seconds = grace.as_secs(),
            "Auth secret rotated"
        );

        let authority = authority.clone();
        let shutdown = shutdown.clone();
        let token = previous.client_token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = shutdown.cancelled() => {}
            }
            match authority.revoke_token(&token).await {
                Ok(()) => info!(secret_id = %prev_secret_id, "Revoked previous auth token"),
                Err(e) => warn!(
                    secret_id = %prev_secret_id,
                    error = %e,
                    "Failed to revoke previous auth token"
                ),
            }
        });
        track(&tasks, handle);
    })
}

/// Caches, renews and rotates every credential the application uses.
///
/// Dropping the manager stops its background tasks at their next wait point;
/// [`CredentialManager::shutdown`] also waits for them.
pub struct CredentialManager {
    options: ManagerOptions,
    authority: Arc<dyn SecretAuthority>,
    auth: Arc<SecretHandler<AuthToken>>,
    mongo: Option<Arc<SecretHandler<UserPass>>>,
    postgres: Option<Arc<SecretHandler<UserPass>>>,
    tls_cert: Option<Arc<SecretHandler<TlsCert>>>,
    cloud_sts: Option<Arc<SecretHandler<CloudSts>>>,
    generic: Mutex<HashMap<String, GenericSlot>>,
    shutdown: CancellationToken,
    tasks: Tasks,
}

impl CredentialManager {
    /// Create a manager that logs in with credentials from `VAULT_AUTHCREDENTIALS`.
    pub async fn new(authority: Arc<dyn SecretAuthority>, options: ManagerOptions) -> Result<Self> {
        Self::new_with_credentials(authority, options, CredentialSource::Environment).await
    }

    /// Create a manager that logs in with credentials from `credentials`.
    pub async fn new_with_credentials(
        authority: Arc<dyn SecretAuthority>,
        options: ManagerOptions,
        credentials: CredentialSource,
    ) -> Result<Self> {
        options.validate()?;
        log_options_info(&options);

        let shutdown = CancellationToken::new();
        let tasks: Tasks = Arc::default();
        let policy = options.lease.clone();

        let auth_source =
            AuthSource { authority: authority.clone(), credentials, policy: policy.clone() };
        let grace = options.grace.revoke();
        let hook = rotation_hook(authority.clone(), grace, shutdown.clone(), tasks.clone());
        let auth = Arc::new(
            SecretHandler::new(SecretKind::Auth, "", auth_source, policy.clone())
                .with_replace_hook(hook),
        );
        auth.fetch().await.inspect_err(|e| {
            error!(error = %e, "Initial authentication failed");
        })?;

        let mongo = if options.enable_mongo {
            let path = &options.mongo_creds_path;
            let source =
                LeasedPathSource::<UserPass>::new(path, &authority, &auth, &policy, |raw| {
                    UserPass::parse_as(raw, SecretKind::Mongo)
                });
            Some(initial_fetch(SecretKind::Mongo, path, source, &policy).await?)
        } else {
            None
        };

        let postgres = if options.enable_postgres {
            let path = &options.postgres_creds_path;
            let source = LeasedPathSource::new(path, &authority, &auth, &policy, UserPass::parse);
            Some(initial_fetch(SecretKind::Postgres, path, source, &policy).await?)
        } else {
            None
        };

        let tls_cert = if options.enable_tls_cert {
            let source = TlsSource {
                cert_path: options.tls_cert_path.clone(),
                key_path: options.tls_cert_key_path.clone(),
                authority: authority.clone(),
                auth: auth.clone(),
                policy: policy.clone(),
            };
            Some(initial_fetch(SecretKind::TlsCert, &options.tls_cert_path, source, &policy).await?)
        } else {
            None
        };

        let cloud_sts = if options.enable_cloud_sts {
            let path = &options.cloud_sts_creds_path;
            let source = LeasedPathSource::new(path, &authority, &auth, &policy, CloudSts::parse);
            Some(initial_fetch(SecretKind::CloudSts, path, source, &policy).await?)
        } else {
            None
        };

        let manager = Self {
            options,
            authority,
            auth,
            mongo,
            postgres,
            tls_cert,
            cloud_sts,
            generic: Mutex::new(HashMap::new()),
            shutdown,
            tasks,
        };
        manager.start(&manager.auth);
        if let Some(handler) = &manager.mongo {
            manager.start(handler);
        }
        if let Some(handler) = &manager.postgres {
            manager.start(handler);
        }
        if let Some(handler) = &manager.tls_cert {
            manager.start(handler);
        }
        if let Some(handler) = &manager.cloud_sts {
            manager.start(handler);
        }

        info!("Credential manager started");
        Ok(manager)
    }

    fn start<T: Send + Sync + 'static>(&self, handler: &Arc<SecretHandler<T>>) {
        let handle =
            spawn_auto_renew(handler.clone(), self.options.backoff.clone(), self.shutdown.clone());
        track(&self.tasks, handle);
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// The root auth secret.
    pub async fn auth_secret(&self) -> Result<Arc<Leased<AuthToken>>> {
        self.auth.get_or_refresh().await
    }

    pub async fn mongo_secret(&self) -> Result<Arc<Leased<UserPass>>> {
        enabled(&self.mongo, SecretKind::Mongo)?.get_or_refresh().await
    }

    pub async fn postgres_secret(&self) -> Result<Arc<Leased<UserPass>>> {
        enabled(&self.postgres, SecretKind::Postgres)?.get_or_refresh().await
    }

    pub async fn tls_cert_secret(&self) -> Result<Arc<Leased<TlsCert>>> {
        enabled(&self.tls_cert, SecretKind::TlsCert)?.get_or_refresh().await
    }

    pub async fn cloud_sts_secret(&self) -> Result<Arc<Leased<CloudSts>>> {
        enabled(&self.cloud_sts, SecretKind::CloudSts)?.get_or_refresh().await
    }

    /// Read an arbitrary secret.
    ///
    /// The first read of a path fetches it and starts renewing it in the
    /// background; later reads are served from that handler. Only callers of a
    /// path whose first fetch is in flight wait for it.
    pub async fn read(&self, path: &str) -> Result<Arc<Leased<GenericSecret>>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let slot = self
            .generic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .clone();

        let handler = slot
            .get_or_try_init(|| async {
                let policy = &self.options.lease;
                let source = LeasedPathSource::new(
                    path,
                    &self.authority,
                    &self.auth,
                    policy,
                    GenericSecret::parse,
                );
                let handler = SecretHandler::new(SecretKind::Generic, path, source, policy.clone());
                let handler = Arc::new(handler);
                handler.fetch().await?;
                self.start(&handler);
                Ok::<_, Error>(handler)
            })
            .await?;
        handler.get_or_refresh().await
    }

    /// Write `data` to `path` with the current auth token. Not cached.
    pub async fn write(
        &self,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<GenericSecret>> {
        let auth = self.auth.get_or_refresh().await?;
        let raw = self.authority.write(&auth.client_token, path, data).await?;
        raw.as_ref().map(GenericSecret::parse).transpose()
    }

    /// Stop every background task and wait for them to finish.
    ///
    /// Pending revocations of rotated auth tokens run immediately.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Credential manager stopped");
    }
}

impl Drop for CredentialManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager").field("options", &self.options).finish()
    }
}

fn enabled<T>(
    handler: &Option<Arc<SecretHandler<T>>>,
    kind: SecretKind,
) -> Result<&Arc<SecretHandler<T>>> {
    handler.as_ref().ok_or_else(|| kind.disabled())
}

async fn initial_fetch<T: Send + Sync + 'static>(
    kind: SecretKind,
    path: &str,
    source: impl SecretSource<T> + 'static,
    policy: &LeasePolicy,
) -> Result<Arc<SecretHandler<T>>> {
    let handler = SecretHandler::new(kind, path, source, policy.clone());
    handler.fetch().await.inspect_err(|e| {
        error!(kind = %kind, path = %path, error = %e, "Initial fetch failed");
    })?;
    Ok(Arc::new(handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials_are_validated() {
        let source = CredentialSource::Static(AppRoleCredentials::new("role", "secret"));
        assert_eq!(source.resolve().unwrap().role_id, "role");

        let source = CredentialSource::Static(AppRoleCredentials::new("", "secret"));
        assert!(matches!(source.resolve(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_enabled_reports_disabled_kind() {
        let handler: Option<Arc<SecretHandler<UserPass>>> = None;
        let err = enabled(&handler, SecretKind::Mongo).unwrap_err();
        assert_eq!(err, SecretKind::Mongo.disabled());
    }
}
