//! # Tenure Backends
//!
//! Reference implementations of [`LockBackend`](tenure_core::LockBackend).
//!
//! ## Implementations
//!
//! - [`InMemoryBackend`] - records in a concurrent map (tests, single-process contention)
//! - [`FileSystemBackend`] - records as checksummed files in a shared directory
//!
//! ## Example
//!
//! ```rust
//! use tenure_backend::InMemoryBackend;
//! use tenure_core::{LockBackend, LockSpec, Version, WriteOutcome};
//!
//! # tokio_test::block_on(async {
//! let backend = InMemoryBackend::new();
//! let spec = LockSpec {
//!     holder_identity: "node-a".to_string(),
//!     ..Default::default()
//! };
//!
//! let outcome = backend.create_if_absent("scheduler", spec).await.unwrap();
//! assert_eq!(outcome, WriteOutcome::Written(Version::new(1)));
//!
//! let record = backend.read("scheduler").await.unwrap().unwrap();
//! assert_eq!(record.holder(), "node-a");
//! # });
//! ```

pub mod file_system;
pub mod in_memory;

pub use file_system::FileSystemBackend;
pub use in_memory::InMemoryBackend;
