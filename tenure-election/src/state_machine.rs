//! The lease state machine: one election attempt from Idle to a terminal outcome.

use crate::notifications::{NotificationStats, ObserverNotifier};
use crate::renewal::{Cycle, RenewalScheduler};
use crate::ShutdownSignal;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tenure_core::{
    Clock, ElectionConfig, LeaderState, LockBackend, LockSpec, Result, TenureError, Version,
    WriteOutcome,
};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Lease written to the record when releasing, so a stale reader does not
/// wait out a full lease for an unheld lock.
const RELEASED_LEASE_MS: u64 = 1_000;

/// Phase of the current election attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Acquiring,
    Leading,
    Renewing,
    Lost,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Acquiring => "acquiring",
            Phase::Leading => "leading",
            Phase::Renewing => "renewing",
            Phase::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// How an election attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The lock was lost or a competing claim won; a new attempt may start
    Lost { was_leading: bool },

    /// Shutdown was requested and the lock record was cleared
    Released,

    /// Shutdown was requested and the lock record was left to expire
    Cancelled { was_leading: bool },
}

/// Why leadership ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// A compare-and-swap found a newer version
    Conflict,

    /// Another participant holds the record
    TakenBy(String),

    /// The record vanished from the backend
    Missing,

    /// No renewal was confirmed within the renew deadline
    DeadlineExceeded,

    /// The last lease this participant wrote ran out before a renewal was
    /// confirmed
    LeaseExpired,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Conflict => write!(f, "renewal conflicted with a newer write"),
            LossReason::TakenBy(holder) => write!(f, "lock taken by {:?}", holder),
            LossReason::Missing => write!(f, "lock record disappeared"),
            LossReason::DeadlineExceeded => write!(f, "renew deadline exceeded"),
            LossReason::LeaseExpired => write!(f, "lease expired before renewal"),
        }
    }
}

/// Statistics about election operations
#[derive(Debug, Default, Clone)]
pub struct ElectionStats {
    pub attempts: u64,
    pub acquisitions: u64,
    pub acquire_conflicts: u64,
    pub renewals: u64,
    pub leadership_lost: u64,
    /// Leadership given up because no renewal was confirmed in time
    pub deadline_exceeded: u64,
    pub transient_errors: u64,
    pub releases: u64,
    pub failed_releases: u64,
    /// When the lease was last written by this participant
    pub last_renewal: Option<Instant>,
    pub notifications: NotificationStats,
}

enum Acquire {
    /// Carries the instant the written lease stops being trusted
    Acquired(Instant),
    Conflict,
    Cancelled,
}

enum TryAcquire {
    Acquired(Instant),
    Conflict,
    HeldBy,
}

enum Renewal {
    Renewed(Instant),
    Lost(LossReason),
    Fatal(TenureError),
}

enum Leadership {
    Lost(LossReason),
    Cancelled,
    Fatal(TenureError),
}

/// Owns this participant's belief about lock ownership.
///
/// The state machine is driven one attempt at a time by the supervisor. It
/// is the only writer of [`LeaderState`] and of the leadership events; the
/// lock record itself is re-read before every decision and never trusted
/// beyond the attempt that read it.
pub struct LeaseStateMachine<B> {
    config: ElectionConfig,
    backend: B,
    clock: Arc<dyn Clock>,
    notifier: ObserverNotifier,
    shutdown: ShutdownSignal,
    state_tx: watch::Sender<LeaderState>,
    stats_tx: watch::Sender<ElectionStats>,
    phase: Phase,
    /// Version of the last record this participant wrote while leading
    held_version: Option<Version>,
}

impl<B: LockBackend> LeaseStateMachine<B> {
    pub fn new(
        config: ElectionConfig,
        backend: B,
        clock: Arc<dyn Clock>,
        notifier: ObserverNotifier,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (state_tx, _) = watch::channel(LeaderState::Unknown);
        let (stats_tx, _) = watch::channel(ElectionStats::default());

        Self {
            config,
            backend,
            clock,
            notifier,
            shutdown,
            state_tx,
            stats_tx,
            phase: Phase::Idle,
            held_version: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LeaderState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<ElectionStats> {
        self.stats_tx.subscribe()
    }

    /// Run one election attempt to completion.
    ///
    /// Per-attempt failures are absorbed into retries or a [`AttemptOutcome::Lost`];
    /// only fatal errors (such as a malformed record) are returned.
    pub async fn run_attempt(&mut self) -> Result<AttemptOutcome> {
        self.set_phase(Phase::Idle);
        self.publish_state(LeaderState::Unknown);
        self.held_version = None;
        self.update_stats(|stats| stats.attempts += 1);

        self.set_phase(Phase::Acquiring);
        let lease_expiry = match self.acquire().await? {
            Acquire::Acquired(expiry) => expiry,
            Acquire::Conflict => {
                self.update_stats(|stats| stats.acquire_conflicts += 1);
                self.set_phase(Phase::Lost);
                self.publish_state(LeaderState::Unknown);
                return Ok(AttemptOutcome::Lost { was_leading: false });
            }
            Acquire::Cancelled => return Ok(self.finish_cancelled(false).await),
        };

        self.enter_leading();

        match self.lead(lease_expiry).await {
            Leadership::Lost(reason) => {
                warn!(
                    "{} lost leadership of {}: {}",
                    self.config.identity, self.config.lock_name, reason
                );
                if matches!(reason, LossReason::DeadlineExceeded | LossReason::LeaseExpired) {
                    self.update_stats(|stats| stats.deadline_exceeded += 1);
                }
                self.leave_leading(Phase::Lost);
                Ok(AttemptOutcome::Lost { was_leading: true })
            }
            Leadership::Cancelled => Ok(self.finish_cancelled(true).await),
            Leadership::Fatal(e) => {
                self.leave_leading(Phase::Lost);
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) -> Result<Acquire> {
        let mut shutdown = self.shutdown.clone();

        loop {
            if shutdown.is_requested() {
                return Ok(Acquire::Cancelled);
            }

            let attempt = tokio::select! {
                biased;

                _ = shutdown.requested() => return Ok(Acquire::Cancelled),
                attempt = self.try_acquire() => attempt,
            };

            match attempt {
                Ok(TryAcquire::Acquired(expiry)) => return Ok(Acquire::Acquired(expiry)),
                Ok(TryAcquire::Conflict) => {
                    debug!(
                        "{} lost the race for {}",
                        self.config.identity, self.config.lock_name
                    );
                    return Ok(Acquire::Conflict);
                }
                Ok(TryAcquire::HeldBy) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to acquire {}, retrying: {}",
                        self.config.lock_name, e
                    );
                    self.update_stats(|stats| stats.transient_errors += 1);
                }
            }

            let wait = self.jittered_retry_period();
            tokio::select! {
                biased;

                _ = shutdown.requested() => return Ok(Acquire::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }

    async fn try_acquire(&mut self) -> Result<TryAcquire> {
        let lock = self.config.lock_name.clone();
        let identity = self.config.identity.clone();
        let skew_ms = self.config.max_clock_skew.as_millis() as u64;

        let current = self.bounded("read", self.backend.read(&lock)).await?;
        let stamped = Instant::now();
        let now = self.clock.now_millis();

        let outcome = match current {
            None => {
                self.notifier.observe_leader(None);
                self.publish_state(LeaderState::NoLeader);
                let spec = self.claim_spec(None, now);
                self.bounded("create", self.backend.create_if_absent(&lock, spec))
                    .await?
            }
            Some(record) => {
                if let Some(holder) = record.spec.active_holder(now, skew_ms) {
                    if holder != identity {
                        let holder = holder.to_string();
                        self.notifier.observe_leader(Some(&holder));
                        self.publish_state(LeaderState::Following(holder));
                        return Ok(TryAcquire::HeldBy);
                    }
                } else {
                    self.notifier.observe_leader(Some(record.holder()));
                    self.publish_state(LeaderState::NoLeader);
                }

                let spec = self.claim_spec(Some(&record.spec), now);
                self.bounded(
                    "compare-and-swap",
                    self.backend.compare_and_swap(&lock, spec, record.version),
                )
                .await?
            }
        };

        match outcome {
            WriteOutcome::Written(version) => {
                self.held_version = Some(version);
                Ok(TryAcquire::Acquired(self.trusted_until(stamped)))
            }
            WriteOutcome::Conflict => Ok(TryAcquire::Conflict),
        }
    }

    async fn lead(&mut self, lease_expiry: Instant) -> Leadership {
        let mut scheduler = RenewalScheduler::new(
            self.config.retry_period,
            self.config.renew_deadline,
            lease_expiry,
        );
        let mut shutdown = self.shutdown.clone();

        loop {
            let due = tokio::select! {
                biased;

                _ = shutdown.requested() => return Leadership::Cancelled,
                due = scheduler.tick() => due,
            };
            if due.is_none() {
                return Leadership::Lost(LossReason::LeaseExpired);
            }

            self.set_phase(Phase::Renewing);

            let cycle = scheduler.cycle(&mut shutdown, self.renew()).await;
            match cycle {
                Cycle::Completed(Renewal::Renewed(expiry)) => {
                    scheduler.extend_lease(expiry);
                    self.set_phase(Phase::Leading);
                    let now = Instant::now();
                    self.update_stats(|stats| {
                        stats.renewals += 1;
                        stats.last_renewal = Some(now);
                    });
                }
                Cycle::Completed(Renewal::Lost(reason)) => return Leadership::Lost(reason),
                Cycle::Completed(Renewal::Fatal(e)) => return Leadership::Fatal(e),
                Cycle::DeadlineExceeded => return Leadership::Lost(LossReason::DeadlineExceeded),
                Cycle::LeaseExpired => return Leadership::Lost(LossReason::LeaseExpired),
                Cycle::Shutdown => return Leadership::Cancelled,
            }
        }
    }

    /// Renew until confirmed, a loss is observed, or the caller's deadline
    /// abandons this future.
    async fn renew(&mut self) -> Renewal {
        loop {
            match self.try_renew().await {
                Ok(renewal) => return renewal,
                Err(e) if e.is_fatal() => return Renewal::Fatal(e),
                Err(e) => {
                    warn!("Failed to renew {}, retrying: {}", self.config.lock_name, e);
                    self.update_stats(|stats| stats.transient_errors += 1);
                    sleep(self.config.retry_period).await;
                }
            }
        }
    }

    async fn try_renew(&mut self) -> Result<Renewal> {
        let lock = self.config.lock_name.clone();

        let record = match self.backend.read(&lock).await? {
            Some(record) => record,
            None => {
                self.notifier.observe_leader(None);
                return Ok(Renewal::Lost(LossReason::Missing));
            }
        };

        if !record.spec.is_held_by(&self.config.identity) {
            self.notifier.observe_leader(Some(record.holder()));
            return Ok(Renewal::Lost(LossReason::TakenBy(record.holder().to_string())));
        }

        let stamped = Instant::now();
        let now = self.clock.now_millis();
        let spec = self.claim_spec(Some(&record.spec), now);

        match self
            .backend
            .compare_and_swap(&lock, spec, record.version)
            .await?
        {
            WriteOutcome::Written(version) => {
                debug!("{} renewed {} at {}", self.config.identity, lock, version);
                self.held_version = Some(version);
                Ok(Renewal::Renewed(self.trusted_until(stamped)))
            }
            WriteOutcome::Conflict => Ok(Renewal::Lost(LossReason::Conflict)),
        }
    }

    /// Shutdown wins over everything else: once observed, the attempt ends
    /// here and, when configured, the record is released exactly once.
    async fn finish_cancelled(&mut self, was_leading: bool) -> AttemptOutcome {
        if was_leading {
            self.leave_leading(Phase::Idle);
        } else {
            self.set_phase(Phase::Idle);
        }

        if !self.config.release_on_cancel {
            return AttemptOutcome::Cancelled { was_leading };
        }

        let window = self.config.release_window();
        match timeout(window, self.release()).await {
            Ok(Ok(true)) => {
                info!(
                    "{} released {}",
                    self.config.identity, self.config.lock_name
                );
                self.update_stats(|stats| stats.releases += 1);
                AttemptOutcome::Released
            }
            Ok(Ok(false)) => AttemptOutcome::Cancelled { was_leading },
            Ok(Err(e)) => {
                warn!("Failed to release {}: {}", self.config.lock_name, e);
                self.update_stats(|stats| stats.failed_releases += 1);
                AttemptOutcome::Cancelled { was_leading }
            }
            Err(_) => {
                warn!(
                    "Release of {} did not complete within {:?}",
                    self.config.lock_name, window
                );
                self.update_stats(|stats| stats.failed_releases += 1);
                AttemptOutcome::Cancelled { was_leading }
            }
        }
    }

    /// Clear the record if this participant still holds it.
    ///
    /// The record is re-read rather than trusting `held_version`, because a
    /// renewal abandoned by shutdown may still have been applied.
    async fn release(&mut self) -> Result<bool> {
        let lock = self.config.lock_name.clone();

        let record = match self.backend.read(&lock).await? {
            Some(record) if record.spec.is_held_by(&self.config.identity) => record,
            _ => return Ok(false),
        };

        let now = self.clock.now_millis();
        let spec = LockSpec {
            holder_identity: String::new(),
            lease_duration_ms: RELEASED_LEASE_MS,
            acquire_time_ms: now,
            renew_time_ms: now,
            lease_expiry_ms: now,
            leader_transitions: record.spec.leader_transitions,
        };

        match self
            .backend
            .compare_and_swap(&lock, spec, record.version)
            .await?
        {
            WriteOutcome::Written(_) => {
                self.held_version = None;
                self.notifier.observe_leader(None);
                self.publish_state(LeaderState::NoLeader);
                Ok(true)
            }
            WriteOutcome::Conflict => Ok(false),
        }
    }

    fn claim_spec(&self, previous: Option<&LockSpec>, now: u64) -> LockSpec {
        let lease_ms = self.config.lease_duration.as_millis() as u64;
        let identity = &self.config.identity;

        let (acquire_time_ms, leader_transitions) = match previous {
            Some(prev) if prev.is_held_by(identity) => {
                (prev.acquire_time_ms, prev.leader_transitions)
            }
            Some(prev) => (now, prev.leader_transitions + 1),
            None => (now, 0),
        };

        LockSpec {
            holder_identity: identity.clone(),
            lease_duration_ms: lease_ms,
            acquire_time_ms,
            renew_time_ms: now,
            lease_expiry_ms: now.saturating_add(lease_ms),
            leader_transitions,
        }
    }

    /// Instant past which a lease stamped at `stamped` is no longer trusted.
    fn trusted_until(&self, stamped: Instant) -> Instant {
        stamped + self.config.trusted_lease()
    }

    fn enter_leading(&mut self) {
        info!(
            "{} acquired {} ({})",
            self.config.identity,
            self.config.lock_name,
            self.held_version
                .map(|v| v.to_string())
                .unwrap_or_default()
        );

        let identity = self.config.identity.clone();
        self.set_phase(Phase::Leading);
        self.notifier.observe_leader(Some(&identity));
        self.notifier.started_leading();
        self.publish_state(LeaderState::Leading);

        let now = Instant::now();
        self.update_stats(|stats| {
            stats.acquisitions += 1;
            stats.last_renewal = Some(now);
        });
    }

    fn leave_leading(&mut self, phase: Phase) {
        self.set_phase(phase);
        self.notifier.stopped_leading();
        self.publish_state(LeaderState::Unknown);

        if phase == Phase::Lost {
            self.update_stats(|stats| stats.leadership_lost += 1);
        } else {
            self.update_stats(|_| {});
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(
                "{}: {} -> {}",
                self.config.identity, self.phase, phase
            );
            self.phase = phase;
        }
    }

    fn publish_state(&self, state: LeaderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn update_stats<F>(&self, update: F)
    where
        F: FnOnce(&mut ElectionStats),
    {
        let notifications = self.notifier.stats();
        self.stats_tx.send_modify(|stats| {
            update(stats);
            stats.notifications = notifications;
        });
    }

    /// Bound a backend call by the renew deadline while acquiring.
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        timeout(self.config.renew_deadline, call)
            .await
            .map_err(|_| TenureError::timeout(format!("{} on {}", operation, self.config.lock_name)))?
    }

    fn jittered_retry_period(&self) -> Duration {
        let base = self.config.retry_period;
        if self.config.jitter_factor <= 0.0 {
            return base;
        }

        let extra = rand::thread_rng().gen_range(0.0..=self.config.jitter_factor);
        base + base.mul_f64(extra)
    }
}
