//! # Tenure Election
//!
//! Lease-based leader election over a compare-and-swap lock record.
//!
//! This crate provides:
//! - The lease state machine (acquire, renew, lose, release)
//! - Renewal scheduling bounded by the renew deadline
//! - Deduplicated, non-blocking leadership notifications
//! - The election supervisor that runs attempts until shutdown
//! - A liveness check for the election loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tenure_backend::InMemoryBackend;
//! use tenure_core::ElectionConfig;
//! use tenure_election::{ElectionEvent, ElectionSupervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ElectionConfig::new("node-a", "scheduler")
//!         .with_lease_duration(Duration::from_secs(10))
//!         .with_renew_deadline(Duration::from_secs(5))
//!         .with_retry_period(Duration::from_secs(1))
//!         .with_release_on_cancel(true);
//!
//!     let (supervisor, handle, mut events) =
//!         ElectionSupervisor::new(config, InMemoryBackend::new())?;
//!     let election = tokio::spawn(supervisor.run());
//!
//!     while let Some(event) = events.recv().await {
//!         if event == ElectionEvent::StartedLeading {
//!             // do leader work, then step aside
//!             handle.shutdown();
//!         }
//!     }
//!
//!     let report = election.await??;
//!     println!("released: {}", report.released);
//!     Ok(())
//! }
//! ```

pub mod health;
pub mod notifications;
pub mod renewal;
pub mod shutdown;
pub mod state_machine;
pub mod supervisor;

pub use health::{HealthStatus, LeaderHealth};
pub use notifications::{
    spawn_callbacks, ElectionEvent, EventReceiver, LeaderCallbacks, NotificationStats,
    ObserverNotifier,
};
pub use renewal::{Cycle, RenewalScheduler};
pub use shutdown::ShutdownSignal;
pub use state_machine::{AttemptOutcome, ElectionStats, LeaseStateMachine, LossReason, Phase};
pub use supervisor::{ElectionHandle, ElectionSupervisor, SupervisorReport};
