//! # Auto-Renewal
//!
//! One background task per [`SecretHandler`] keeps its secret fresh:
//!
//! 1. Wait until the cached secret's renew or expire signal fires, or shutdown.
//! 2. Refresh the handler. Unless another caller already replaced the secret, this
//!    renews in place or fetches a new one.
//! 3. On failure sleep for the [`Backoff`] delay and retry step 2 until it succeeds.
//!    Success resets the backoff.
//!
//! Shutdown is observed while waiting and while sleeping. A refresh already in
//! flight is allowed to finish.

use crate::config::BackoffPolicy;
use crate::handler::SecretHandler;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Linear backoff with a cap and random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u64,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Record a failure and return how long to wait before the next attempt.
    ///
    /// After `n` consecutive failures this is `min(max, step * n) + rand(0..jitter)`.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let base = self.policy.step_ms.saturating_mul(self.failures).min(self.policy.max_ms);
        let jitter = if self.policy.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.policy.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// Spawn the auto-renew task for `handler`.
///
/// The task runs until `shutdown` is canceled. If the handler has no secret yet
/// the first refresh happens immediately.
pub fn spawn_auto_renew<T>(
    handler: Arc<SecretHandler<T>>,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(run_auto_renew(handler, Backoff::new(policy), shutdown))
}

async fn run_auto_renew<T>(
    handler: Arc<SecretHandler<T>>,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) where
    T: Send + Sync + 'static,
{
    debug!(kind = %handler.kind(), path = %handler.path(), "Auto-renew task started");

    'wait: loop {
        let waited = handler.current();
        if let Some(secret) = &waited {
            let renew = secret.lease().renew_signal();
            let expire = secret.lease().expire_signal();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'wait,
                _ = renew.cancelled() => {}
                _ = expire.cancelled() => {}
            }
        } else if shutdown.is_cancelled() {
            break 'wait;
        }

        loop {
            match handler.refresh_from(waited.as_ref()).await {
                Ok(_) => {
                    backoff.reset();
                    continue 'wait;
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    warn!(
                        kind = %handler.kind(),
                        path = %handler.path(),
                        error = %error,
                        failures = backoff.failures(),
                        backoff_ms = delay.as_millis() as u64,
                        "Secret refresh failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'wait,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    info!(kind = %handler.kind(), path = %handler.path(), "Auto-renew task stopped");
}
