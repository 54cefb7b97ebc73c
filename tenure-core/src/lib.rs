//! # Tenure Core
//!
//! Core building blocks of the Tenure lease-based leader election supervisor.
//!
//! Participants contend for a single lock record held in an external store.
//! Mutual exclusion is derived entirely from the store's atomic
//! create-if-absent and compare-and-swap operations on that record; there is
//! no voting between participants.
//!
//! ## Components
//!
//! - **LockRecord / LockSpec**: the shared record and its versioned envelope
//! - **LockBackend**: the storage interface every backend implements
//! - **ElectionConfig**: validated per-participant timing and identity
//! - **LeaderState**: the participant's local view of leadership
//! - **Clock**: wall-clock source for record timestamps
//! - **TenureError**: error taxonomy separating transient from fatal failures
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use tenure_core::ElectionConfig;
//!
//! let config = ElectionConfig::new("node-a", "scheduler")
//!     .with_lease_duration(Duration::from_secs(10))
//!     .with_renew_deadline(Duration::from_secs(5))
//!     .with_retry_period(Duration::from_secs(1))
//!     .with_release_on_cancel(true);
//!
//! assert!(config.validate().is_ok());
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use backend::{LockBackend, WriteOutcome};
pub use clock::{Clock, SystemClock};
pub use config::ElectionConfig;
pub use error::{Result, TenureError};
pub use types::{LeaderState, LockRecord, LockSpec, Version};
