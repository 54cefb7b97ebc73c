use crate::{LockRecord, LockSpec, Result, Version};
use async_trait::async_trait;
use std::sync::Arc;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied and the backend assigned this version
    Written(Version),

    /// Another writer got there first; the stored version no longer matches
    /// (or, for a create, the record already exists)
    Conflict,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written(_))
    }
}

/// Storage for lock records.
///
/// This is the only coordination substrate of the election: mutual
/// exclusion follows entirely from the atomicity of `create_if_absent` and
/// `compare_and_swap` on a single named record. Implementations must offer
/// linearizable reads relative to writes on the same record.
///
/// Transient failures (timeouts, unavailability) must be reported as
/// retryable [`TenureError`](crate::TenureError)s; a record that cannot be
/// decoded must be reported as
/// [`TenureError::MalformedRecord`](crate::TenureError::MalformedRecord).
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Read the current record.
    ///
    /// # Returns
    /// * `Ok(Some(record))` if the record exists
    /// * `Ok(None)` if it was never created
    /// * `Err(TenureError)` if the read failed
    async fn read(&self, lock: &str) -> Result<Option<LockRecord>>;

    /// Create the record if it does not exist yet.
    async fn create_if_absent(&self, lock: &str, spec: LockSpec) -> Result<WriteOutcome>;

    /// Replace the record if its stored version still equals `expected`.
    async fn compare_and_swap(
        &self,
        lock: &str,
        spec: LockSpec,
        expected: Version,
    ) -> Result<WriteOutcome>;

    /// Human readable description used in logs.
    fn describe(&self) -> String {
        "lock backend".to_string()
    }
}

#[async_trait]
impl<B: LockBackend + ?Sized> LockBackend for Arc<B> {
    async fn read(&self, lock: &str) -> Result<Option<LockRecord>> {
        (**self).read(lock).await
    }

    async fn create_if_absent(&self, lock: &str, spec: LockSpec) -> Result<WriteOutcome> {
        (**self).create_if_absent(lock, spec).await
    }

    async fn compare_and_swap(
        &self,
        lock: &str,
        spec: LockSpec,
        expected: Version,
    ) -> Result<WriteOutcome> {
        (**self).compare_and_swap(lock, spec, expected).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
