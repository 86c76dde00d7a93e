//! Lease time arithmetic.
//!
//! Pure functions over the [`LeasePolicy`]; no timers or randomness live here
//! except [`LeasePolicy::sample_jitter`].

use crate::config::LeasePolicy;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use std::time::Duration;

/// The three instants of a lease plus their offsets from creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimes {
    pub created_at: DateTime<Utc>,
    pub renew_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    /// `renew_at - created_at`
    pub renew_after: Duration,
    /// `expire_at - created_at`
    pub expire_after: Duration,
}

impl LeasePolicy {
    /// The duration actually used for a reported lease of `seconds`.
    ///
    /// Zero means the authority attached no lease (static secret) and maps to the
    /// static TTL. Anything above `max_lease` is capped.
    pub fn effective_duration(&self, seconds: u64) -> Duration {
        let reported = if seconds == 0 { self.static_ttl() } else { Duration::from_secs(seconds) };
        reported.min(self.max_lease())
    }

    /// Offset from creation at which a lease of `seconds` expires.
    ///
    /// Falls back to the full duration when it is not longer than the safety margin.
    pub fn expire_offset(&self, seconds: u64) -> Duration {
        let duration = self.effective_duration(seconds);
        match duration.checked_sub(self.expire_before()) {
            Some(offset) if !offset.is_zero() => offset,
            _ => duration,
        }
    }

    /// Random delay in `0..renew_jitter`.
    pub fn sample_jitter(&self) -> Duration {
        let max = self.renew_jitter();
        if max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..max)
    }

    /// Compute renew and expire times for a lease of `seconds` created at `now`.
    ///
    /// A renew time that would fall before `now` is clamped to `now`, which means
    /// "renew immediately". The renew time always stays strictly before the expire time.
    pub fn compute(&self, now: DateTime<Utc>, seconds: u64, jitter: Duration) -> LeaseTimes {
        let duration = self.effective_duration(seconds);
        let expire_after = self.expire_offset(seconds);
        let renew_after = duration
            .saturating_sub(self.renew_before())
            .saturating_sub(jitter)
            .min(expire_after.saturating_sub(Duration::from_millis(1)));

        LeaseTimes {
            created_at: now,
            renew_at: add_duration(now, renew_after),
            expire_at: add_duration(now, expire_after),
            renew_after,
            expire_after,
        }
    }
}

fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
