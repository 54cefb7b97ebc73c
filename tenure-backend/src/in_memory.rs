use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tenure_core::{LockBackend, LockRecord, LockSpec, Result, Version, WriteOutcome};
use tracing::trace;

/// In-memory lock backend.
///
/// Records are kept in a concurrent map keyed by lock name. Each write holds
/// the map shard for its key while comparing and replacing, which makes
/// `create_if_absent` and `compare_and_swap` atomic per record. Clones share
/// the same records, so several participants in one process can contend
/// through one backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    records: Arc<DashMap<String, LockRecord>>,
}

impl InMemoryBackend {
    /// Create a new, empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lock records stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Delete a lock record outright, as an operator clearing the store would.
    pub fn remove(&self, lock: &str) -> Option<LockRecord> {
        self.records.remove(lock).map(|(_, record)| record)
    }
}

#[async_trait]
impl LockBackend for InMemoryBackend {
    async fn read(&self, lock: &str) -> Result<Option<LockRecord>> {
        Ok(self.records.get(lock).map(|record| record.clone()))
    }

    async fn create_if_absent(&self, lock: &str, spec: LockSpec) -> Result<WriteOutcome> {
        match self.records.entry(lock.to_string()) {
            Entry::Occupied(_) => Ok(WriteOutcome::Conflict),
            Entry::Vacant(vacant) => {
                let version = Version::new(1);
                trace!("Created lock {} at {}", lock, version);
                vacant.insert(LockRecord::new(spec, version));
                Ok(WriteOutcome::Written(version))
            }
        }
    }

    async fn compare_and_swap(
        &self,
        lock: &str,
        spec: LockSpec,
        expected: Version,
    ) -> Result<WriteOutcome> {
        match self.records.entry(lock.to_string()) {
            Entry::Vacant(_) => Ok(WriteOutcome::Conflict),
            Entry::Occupied(mut occupied) => {
                if occupied.get().version != expected {
                    return Ok(WriteOutcome::Conflict);
                }

                let version = expected.next();
                trace!("Swapped lock {} from {} to {}", lock, expected, version);
                occupied.insert(LockRecord::new(spec, version));
                Ok(WriteOutcome::Written(version))
            }
        }
    }

    fn describe(&self) -> String {
        "in-memory backend".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str) -> LockSpec {
        LockSpec {
            holder_identity: holder.to_string(),
            lease_duration_ms: 10_000,
            lease_expiry_ms: 10_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let backend = InMemoryBackend::new();
        assert!(backend.read("jobs").await.unwrap().is_none());

        let first = backend.create_if_absent("jobs", spec("a")).await.unwrap();
        assert_eq!(first, WriteOutcome::Written(Version::new(1)));

        let second = backend.create_if_absent("jobs", spec("b")).await.unwrap();
        assert_eq!(second, WriteOutcome::Conflict);

        let record = backend.read("jobs").await.unwrap().unwrap();
        assert_eq!(record.holder(), "a");
    }

    #[tokio::test]
    async fn test_compare_and_swap_advances_version() {
        let backend = InMemoryBackend::new();
        backend.create_if_absent("jobs", spec("a")).await.unwrap();

        let outcome = backend
            .compare_and_swap("jobs", spec("b"), Version::new(1))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(Version::new(2)));

        // Stale version is always rejected
        let stale = backend
            .compare_and_swap("jobs", spec("c"), Version::new(1))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Conflict);
        assert_eq!(backend.read("jobs").await.unwrap().unwrap().holder(), "b");
    }

    #[tokio::test]
    async fn test_compare_and_swap_on_missing_record() {
        let backend = InMemoryBackend::new();
        let outcome = backend
            .compare_and_swap("jobs", spec("a"), Version::new(1))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_locks_are_independent() {
        let backend = InMemoryBackend::new();
        backend.create_if_absent("jobs", spec("a")).await.unwrap();
        backend.create_if_absent("mail", spec("b")).await.unwrap();

        assert_eq!(backend.len(), 2);
        assert_eq!(backend.read("mail").await.unwrap().unwrap().holder(), "b");
    }

    #[tokio::test]
    async fn test_concurrent_swaps_admit_one_winner() {
        let backend = InMemoryBackend::new();
        backend.create_if_absent("jobs", spec("seed")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .compare_and_swap("jobs", spec(&format!("p{}", i)), Version::new(1))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_written() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(
            backend.read("jobs").await.unwrap().unwrap().version,
            Version::new(2)
        );
    }
}
