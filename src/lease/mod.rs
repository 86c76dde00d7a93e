//! # Leases
//!
//! A [`Lease`] is the validity window of one issued secret: when it is due for
//! renewal, when it expires, and whether it has been canceled.
//!
//! ## Signals
//!
//! Each lease exposes two [`CancellationToken`]s:
//! - the **renew signal** fires at `renew_at`, when the parent's renew signal fires,
//!   or when the lease is canceled;
//! - the **expire signal** fires at `expire_at`, when the parent's expire signal fires,
//!   or when the lease is canceled.
//!
//! ## Issuance and renewal
//!
//! Secrets issued under a parent lease (e.g. database credentials under an auth
//! token) share a cancellation scope that is a child of the parent's scope, so
//! canceling a lease cancels every lease below it. An in-place renewal produces a
//! new `Lease` value that keeps the id and scope of the original issuance; the
//! superseded value stops its timers and fires its renew signal so anything
//! waiting on it re-reads the current secret.

pub mod times;

pub use times::LeaseTimes;

use crate::config::LeasePolicy;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_SECRET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one issued secret.
///
/// Two secrets compare equal only if they come from the same authority response;
/// the payload is never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretId(u64);

impl SecretId {
    fn next() -> Self {
        Self(NEXT_SECRET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State shared by every lease value of one issuance.
struct Issuance {
    scope: CancellationToken,
    canceled: AtomicBool,
}

struct LeaseInner {
    id: SecretId,
    times: LeaseTimes,
    expire_deadline: Instant,
    issuance: Arc<Issuance>,
    renew: CancellationToken,
    expire: CancellationToken,
    disarm: CancellationToken,
    parent: Option<Weak<LeaseInner>>,
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.disarm.cancel();
    }
}

/// Validity window of an issued secret. Cheap to clone.
///
/// Must be created inside a Tokio runtime: each lease value runs one timer task
/// until it fires, is superseded, or is dropped.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Issue a lease for an authority-reported duration of `seconds`.
    pub fn new(policy: &LeasePolicy, seconds: u64, parent: Option<&Lease>) -> Self {
        let times = policy.compute(Utc::now(), seconds, policy.sample_jitter());
        let scope = match parent {
            Some(parent) => parent.inner.issuance.scope.child_token(),
            None => CancellationToken::new(),
        };
        let issuance = Arc::new(Issuance { scope, canceled: AtomicBool::new(false) });
        Self::arm(SecretId::next(), times, issuance, parent)
    }

    /// A lease for the same issuance with a fresh duration.
    ///
    /// The returned lease keeps this lease's id, parent and cancellation scope. This
    /// lease stops its timers and fires its renew signal.
    pub fn renewed(&self, policy: &LeasePolicy, seconds: u64) -> Self {
        let times = policy.compute(Utc::now(), seconds, policy.sample_jitter());
        let parent = self.parent();
        let renewed =
            Self::arm(self.inner.id, times, self.inner.issuance.clone(), parent.as_ref());

        self.inner.disarm.cancel();
        self.inner.renew.cancel();
        renewed
    }

    fn arm(
        id: SecretId,
        times: LeaseTimes,
        issuance: Arc<Issuance>,
        parent: Option<&Lease>,
    ) -> Self {
        let now = Instant::now();
        let renew_deadline = deadline(now, times.renew_after);
        let expire_deadline = deadline(now, times.expire_after);

        let inner = Arc::new(LeaseInner {
            id,
            times,
            expire_deadline,
            renew: issuance.scope.child_token(),
            expire: issuance.scope.child_token(),
            disarm: CancellationToken::new(),
            issuance,
            parent: parent.map(|p| Arc::downgrade(&p.inner)),
        });

        // A parent signal that already fired predates this lease and is not propagated,
        // otherwise a child issued during the parent's renewal would be due immediately.
        let parent_renew = parent.map(|p| p.inner.renew.clone()).filter(|t| !t.is_cancelled());
        let parent_expire = parent.map(|p| p.inner.expire.clone());

        tokio::spawn(run_timers(
            inner.renew.clone(),
            inner.expire.clone(),
            inner.disarm.clone(),
            renew_deadline,
            expire_deadline,
            parent_renew,
            parent_expire,
        ));

        Self { inner }
    }

    pub fn id(&self) -> SecretId {
        self.inner.id
    }

    pub fn times(&self) -> &LeaseTimes {
        &self.inner.times
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.times.created_at
    }

    pub fn renew_at(&self) -> DateTime<Utc> {
        self.inner.times.renew_at
    }

    pub fn expire_at(&self) -> DateTime<Utc> {
        self.inner.times.expire_at
    }

    /// Fires when the lease is due for renewal.
    pub fn renew_signal(&self) -> CancellationToken {
        self.inner.renew.clone()
    }

    /// Fires when the lease has expired or was canceled.
    pub fn expire_signal(&self) -> CancellationToken {
        self.inner.expire.clone()
    }

    /// Whether the renew signal has fired.
    pub fn is_renew_due(&self) -> bool {
        self.inner.renew.is_cancelled()
    }

    /// Cancel this issuance and every lease issued under it. Irreversible.
    pub fn cancel(&self) {
        self.inner.issuance.canceled.store(true, Ordering::Release);
        self.inner.issuance.scope.cancel();
    }

    /// Whether this lease itself was canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.issuance.canceled.load(Ordering::Acquire)
    }

    /// Not canceled, and no ancestor canceled.
    pub fn is_valid(&self) -> bool {
        !self.inner.issuance.scope.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.inner.expire_deadline
    }

    /// Time left until expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.inner.expire_deadline.saturating_duration_since(Instant::now())
    }

    /// The lease this one was issued under, while it is still alive.
    pub fn parent(&self) -> Option<Lease> {
        self.inner.parent.as_ref().and_then(Weak::upgrade).map(|inner| Lease { inner })
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.inner.id)
            .field("created_at", &self.inner.times.created_at)
            .field("renew_at", &self.inner.times.renew_at)
            .field("expire_at", &self.inner.times.expire_at)
            .field("canceled", &self.is_canceled())
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

async fn fired(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn run_timers(
    renew: CancellationToken,
    expire: CancellationToken,
    disarm: CancellationToken,
    renew_deadline: Instant,
    expire_deadline: Instant,
    parent_renew: Option<CancellationToken>,
    parent_expire: Option<CancellationToken>,
) {
    tokio::select! {
        _ = disarm.cancelled() => return,
        _ = renew.cancelled() => {}
        _ = tokio::time::sleep_until(renew_deadline) => renew.cancel(),
        _ = fired(parent_renew) => renew.cancel(),
        _ = fired(parent_expire.clone()) => {
            renew.cancel();
            expire.cancel();
            return;
        }
    }

    tokio::select! {
        _ = disarm.cancelled() => {}
        _ = expire.cancelled() => {}
        _ = tokio::time::sleep_until(expire_deadline) => {
            renew.cancel();
            expire.cancel();
        }
        _ = fired(parent_expire) => {
            renew.cancel();
            expire.cancel();
        }
    }
}
