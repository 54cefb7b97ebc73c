use crate::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};

/// Result of one renewal cycle.
#[derive(Debug)]
pub enum Cycle<T> {
    /// The renewal future finished within the deadline
    Completed(T),

    /// The deadline elapsed first; the outstanding renewal was abandoned
    DeadlineExceeded,

    /// The lease last written by this participant ran out first
    LeaseExpired,

    /// Shutdown was requested while the cycle was running
    Shutdown,
}

/// Paces renewals while leading.
///
/// Ticks every retry period, starting one period after leadership was
/// gained. Each cycle is raced against the renew deadline: when the deadline
/// fires, the in-flight renewal future is dropped, and the leader must assume
/// its lease may already belong to someone else.
///
/// Both the wait for a tick and each cycle are also bounded by the lease
/// expiry: the instant at which the last lease this participant wrote stops
/// being trusted. Leadership never outlives that instant, however slowly the
/// backend acknowledges.
#[derive(Debug)]
pub struct RenewalScheduler {
    ticker: Interval,
    renew_deadline: Duration,
    lease_expiry: Instant,
}

impl RenewalScheduler {
    pub fn new(retry_period: Duration, renew_deadline: Duration, lease_expiry: Instant) -> Self {
        let mut ticker = interval_at(Instant::now() + retry_period, retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            ticker,
            renew_deadline,
            lease_expiry,
        }
    }

    /// Wait for the next renewal slot.
    ///
    /// Returns `None` if the lease expires before the slot comes up.
    pub async fn tick(&mut self) -> Option<Instant> {
        tokio::select! {
            biased;

            _ = sleep_until(self.lease_expiry) => None,
            at = self.ticker.tick() => Some(at),
        }
    }

    /// Record a newly written lease.
    pub fn extend_lease(&mut self, expiry: Instant) {
        self.lease_expiry = expiry;
    }

    pub fn lease_expiry(&self) -> Instant {
        self.lease_expiry
    }

    /// Run one renewal, bounded by the renew deadline, the lease expiry and
    /// shutdown.
    pub async fn cycle<F>(&self, shutdown: &mut ShutdownSignal, renewal: F) -> Cycle<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;

            _ = shutdown.requested() => Cycle::Shutdown,
            _ = sleep_until(self.lease_expiry) => Cycle::LeaseExpired,
            result = timeout(self.renew_deadline, renewal) => match result {
                Ok(value) => Cycle::Completed(value),
                Err(_) => Cycle::DeadlineExceeded,
            },
        }
    }

    pub fn renew_deadline(&self) -> Duration {
        self.renew_deadline
    }
}
