//! The outer election loop and the handle given to the hosting application.

use crate::notifications::{EventReceiver, ObserverNotifier};
use crate::state_machine::{AttemptOutcome, ElectionStats, LeaseStateMachine};
use crate::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tenure_core::{Clock, ElectionConfig, LeaderState, LockBackend, Result, SystemClock, TenureError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Summary returned when the supervisor stops.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub attempts: u64,
    /// Whether the lock record was cleared on the way out
    pub released: bool,
    pub stats: ElectionStats,
}

/// Runs election attempts back to back until shutdown is requested.
///
/// Each attempt drives the [`LeaseStateMachine`] from Idle to a terminal
/// outcome. A genuine loss starts the next attempt immediately; a shutdown
/// request ends the loop after the optional release.
pub struct ElectionSupervisor<B> {
    machine: LeaseStateMachine<B>,
    shutdown: ShutdownSignal,
}

impl<B: LockBackend> ElectionSupervisor<B> {
    /// Create a supervisor using the system wall clock.
    ///
    /// # Errors
    /// * `TenureError::Config` if the configuration is invalid; no attempt is made
    pub fn new(config: ElectionConfig, backend: B) -> Result<(Self, ElectionHandle, EventReceiver)> {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ElectionConfig,
        backend: B,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, ElectionHandle, EventReceiver)> {
        config.validate()?;

        if config.retry_period + config.renew_deadline >= config.trusted_lease() {
            warn!(
                "retry period {:?} plus renew deadline {:?} reaches the trusted lease {:?}; \
                 a slow renewal will be cut short by lease expiry before its deadline",
                config.retry_period,
                config.renew_deadline,
                config.trusted_lease()
            );
        }

        let (notifier, events) = ObserverNotifier::channel(config.event_buffer);
        let (shutdown_tx, shutdown) = ShutdownSignal::channel();

        let machine = LeaseStateMachine::new(
            config.clone(),
            backend,
            clock,
            notifier,
            shutdown.clone(),
        );

        let handle = ElectionHandle {
            identity: config.identity.clone(),
            lease_duration: config.lease_duration,
            shutdown_tx: Arc::new(shutdown_tx),
            state_rx: machine.subscribe_state(),
            stats_rx: machine.subscribe_stats(),
        };

        Ok((Self { machine, shutdown }, handle, events))
    }

    /// Run until shutdown.
    ///
    /// Returns an error only for failures that make further attempts
    /// pointless, such as a malformed lock record.
    pub async fn run(mut self) -> Result<SupervisorReport> {
        let identity = self.machine.config().identity.clone();
        let lock = self.machine.config().lock_name.clone();

        info!(
            "Starting leader election for {} as {} on {}",
            lock,
            identity,
            self.machine.backend().describe()
        );

        let mut attempts = 0;
        let mut released = false;

        while !self.shutdown.is_requested() {
            attempts += 1;

            match self.machine.run_attempt().await {
                Ok(AttemptOutcome::Lost { was_leading: true }) => {
                    info!("{} is no longer leading {}, restarting election", identity, lock);
                }
                Ok(AttemptOutcome::Lost { was_leading: false }) => {
                    debug!("Election attempt {} for {} lost, retrying", attempts, lock);
                }
                Ok(AttemptOutcome::Released) => {
                    released = true;
                    break;
                }
                Ok(AttemptOutcome::Cancelled { .. }) => break,
                Err(e) => {
                    error!("Leader election for {} failed: {}", lock, e);
                    return Err(e);
                }
            }
        }

        info!(
            "Leader election for {} stopped after {} attempt(s)",
            lock, attempts
        );

        let stats = self.machine.subscribe_stats().borrow().clone();
        Ok(SupervisorReport {
            attempts,
            released,
            stats,
        })
    }
}

/// Handle to a running supervisor, given to the hosting application.
#[derive(Debug, Clone)]
pub struct ElectionHandle {
    identity: String,
    lease_duration: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<LeaderState>,
    stats_rx: watch::Receiver<ElectionStats>,
}

impl ElectionHandle {
    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutdown requested for {}", self.identity);
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Current local view of leadership.
    pub fn leader_state(&self) -> LeaderState {
        self.state_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state_rx.borrow().is_leading()
    }

    /// Identity of the participant currently believed to lead.
    pub fn leader(&self) -> Option<String> {
        match &*self.state_rx.borrow() {
            LeaderState::Leading => Some(self.identity.clone()),
            LeaderState::Following(leader) => Some(leader.clone()),
            LeaderState::Unknown | LeaderState::NoLeader => None,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LeaderState> {
        self.state_rx.clone()
    }

    /// Wait until this participant leads.
    ///
    /// # Errors
    /// * Returns error if the supervisor stops first
    pub async fn wait_for_leadership(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(LeaderState::is_leading)
            .await
            .map(|_| ())
            .map_err(|_| TenureError::internal("election supervisor stopped"))
    }

    pub fn stats(&self) -> ElectionStats {
        self.stats_rx.borrow().clone()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }
}
