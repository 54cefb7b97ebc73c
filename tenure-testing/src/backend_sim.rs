use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tenure_backend::InMemoryBackend;
use tenure_core::{LockBackend, LockRecord, LockSpec, Result, TenureError, Version, WriteOutcome};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BackendConditions {
    pub latency_min: Duration,
    pub latency_max: Duration,
    /// Probability that a call fails before reaching the store
    pub error_rate: f64,
    /// Probability that a write is applied but its acknowledgement is lost
    pub ack_loss_rate: f64,
    /// Calls never complete while set
    pub hang: bool,
}

impl Default for BackendConditions {
    fn default() -> Self {
        Self {
            latency_min: Duration::ZERO,
            latency_max: Duration::ZERO,
            error_rate: 0.0,
            ack_loss_rate: 0.0,
            hang: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Partition {
    identities: HashSet<String>,
    until: Option<Instant>,
}

#[derive(Debug, Default, Clone)]
pub struct BackendStats {
    pub calls: u64,
    pub writes_applied: u64,
    pub conflicts: u64,
    pub injected_errors: u64,
    pub lost_acks: u64,
    pub partitioned_calls: u64,
    pub calls_by_identity: HashMap<String, u64>,
}

/// Shared lock store with injectable faults.
///
/// Each participant talks to the store through its own [`SimulatedBackend`],
/// so partitions can cut off individual identities while the others keep
/// working.
pub struct BackendSimulator {
    store: InMemoryBackend,
    conditions: RwLock<BackendConditions>,
    partitions: RwLock<Vec<Partition>>,
    stats: Mutex<BackendStats>,
}

impl BackendSimulator {
    pub fn new() -> Self {
        Self {
            store: InMemoryBackend::new(),
            conditions: RwLock::new(BackendConditions::default()),
            partitions: RwLock::new(Vec::new()),
            stats: Mutex::new(BackendStats::default()),
        }
    }

    /// Backend view for one participant.
    pub fn connect(self: &Arc<Self>, identity: impl Into<String>) -> SimulatedBackend {
        SimulatedBackend {
            identity: identity.into(),
            simulator: self.clone(),
        }
    }

    /// The underlying store, bypassing every fault.
    pub fn store(&self) -> &InMemoryBackend {
        &self.store
    }

    pub async fn record(&self, lock: &str) -> Option<LockRecord> {
        self.store.read(lock).await.ok().flatten()
    }

    pub fn update_conditions(&self, conditions: BackendConditions) {
        debug!("Updated backend conditions: {:?}", conditions);
        *self.conditions.write() = conditions;
    }

    pub fn conditions(&self) -> BackendConditions {
        self.conditions.read().clone()
    }

    /// Cut `identities` off from the store, for `duration` or until healed.
    pub fn create_partition(&self, identities: HashSet<String>, duration: Option<Duration>) {
        warn!(
            "Partitioning {:?} from the lock store for {:?}",
            identities, duration
        );
        self.partitions.write().push(Partition {
            identities,
            until: duration.map(|d| Instant::now() + d),
        });
    }

    pub fn heal_partitions(&self) {
        self.partitions.write().clear();
        info!("Healed all lock store partitions");
    }

    pub fn is_partitioned(&self, identity: &str) -> bool {
        let now = Instant::now();
        self.partitions.read().iter().any(|partition| {
            partition.until.map_or(true, |until| now < until)
                && partition.identities.contains(identity)
        })
    }

    pub fn stats(&self) -> BackendStats {
        self.stats.lock().clone()
    }

    /// Apply the current conditions to a call from `identity`.
    async fn admit(&self, identity: &str, operation: &str) -> Result<()> {
        {
            let mut stats = self.stats.lock();
            stats.calls += 1;
            *stats
                .calls_by_identity
                .entry(identity.to_string())
                .or_default() += 1;
        }

        if self.is_partitioned(identity) {
            self.stats.lock().partitioned_calls += 1;
            debug!("{} from {} rejected by partition", operation, identity);
            return Err(TenureError::unavailable(format!(
                "{} is partitioned from the lock store",
                identity
            )));
        }

        let conditions = self.conditions();

        if conditions.hang {
            debug!("{} from {} hangs", operation, identity);
            std::future::pending::<()>().await;
        }

        let latency = random_latency(&conditions);
        if !latency.is_zero() {
            sleep(latency).await;
        }

        if rand::thread_rng().gen::<f64>() < conditions.error_rate {
            self.stats.lock().injected_errors += 1;
            return Err(TenureError::unavailable(format!(
                "injected failure on {} from {}",
                operation, identity
            )));
        }

        Ok(())
    }

    fn settle(&self, identity: &str, operation: &str, outcome: WriteOutcome) -> Result<WriteOutcome> {
        match outcome {
            WriteOutcome::Written(version) => {
                self.stats.lock().writes_applied += 1;

                let ack_loss_rate = self.conditions.read().ack_loss_rate;
                if rand::thread_rng().gen::<f64>() < ack_loss_rate {
                    self.stats.lock().lost_acks += 1;
                    debug!(
                        "{} from {} applied at {} but the acknowledgement was lost",
                        operation, identity, version
                    );
                    return Err(TenureError::timeout(format!("{} acknowledgement", operation)));
                }
            }
            WriteOutcome::Conflict => {
                self.stats.lock().conflicts += 1;
            }
        }

        Ok(outcome)
    }
}

impl Default for BackendSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn random_latency(conditions: &BackendConditions) -> Duration {
    if conditions.latency_max <= conditions.latency_min {
        return conditions.latency_min;
    }

    let millis = rand::thread_rng().gen_range(
        conditions.latency_min.as_millis()..=conditions.latency_max.as_millis(),
    );
    Duration::from_millis(millis as u64)
}

/// One participant's connection to a [`BackendSimulator`].
#[derive(Clone)]
pub struct SimulatedBackend {
    identity: String,
    simulator: Arc<BackendSimulator>,
}

impl SimulatedBackend {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl LockBackend for SimulatedBackend {
    async fn read(&self, lock: &str) -> Result<Option<LockRecord>> {
        self.simulator.admit(&self.identity, "read").await?;
        self.simulator.store.read(lock).await
    }

    async fn create_if_absent(&self, lock: &str, spec: LockSpec) -> Result<WriteOutcome> {
        self.simulator.admit(&self.identity, "create").await?;
        let outcome = self.simulator.store.create_if_absent(lock, spec).await?;
        self.simulator.settle(&self.identity, "create", outcome)
    }

    async fn compare_and_swap(
        &self,
        lock: &str,
        spec: LockSpec,
        expected: Version,
    ) -> Result<WriteOutcome> {
        self.simulator.admit(&self.identity, "compare-and-swap").await?;
        let outcome = self
            .simulator
            .store
            .compare_and_swap(lock, spec, expected)
            .await?;
        self.simulator.settle(&self.identity, "compare-and-swap", outcome)
    }

    fn describe(&self) -> String {
        format!("simulated lock store ({})", self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str) -> LockSpec {
        LockSpec {
            holder_identity: holder.to_string(),
            lease_duration_ms: 10_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_views_share_one_store() {
        let simulator = Arc::new(BackendSimulator::new());
        let a = simulator.connect("a");
        let b = simulator.connect("b");

        assert!(a.create_if_absent("jobs", spec("a")).await.unwrap().is_written());
        assert_eq!(
            b.create_if_absent("jobs", spec("b")).await.unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(b.read("jobs").await.unwrap().unwrap().holder(), "a");

        let stats = simulator.stats();
        assert_eq!(stats.calls, 3);
        assert_eq!(stats.writes_applied, 1);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.calls_by_identity["b"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_isolates_one_identity() {
        let simulator = Arc::new(BackendSimulator::new());
        let a = simulator.connect("a");
        let b = simulator.connect("b");

        simulator.create_partition(["a".to_string()].into(), Some(Duration::from_secs(5)));

        let err = a.read("jobs").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(b.read("jobs").await.is_ok());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(a.read("jobs").await.is_ok());
        assert_eq!(simulator.stats().partitioned_calls, 1);
    }

    #[tokio::test]
    async fn test_lost_ack_still_applies_write() {
        let simulator = Arc::new(BackendSimulator::new());
        let a = simulator.connect("a");
        simulator.update_conditions(BackendConditions {
            ack_loss_rate: 1.0,
            ..Default::default()
        });

        let err = a.create_if_absent("jobs", spec("a")).await.unwrap_err();
        assert!(matches!(err, TenureError::Timeout { .. }));

        let record = simulator.record("jobs").await.unwrap();
        assert_eq!(record.holder(), "a");
        assert_eq!(record.version, Version::new(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let simulator = Arc::new(BackendSimulator::new());
        let a = simulator.connect("a");
        simulator.update_conditions(BackendConditions {
            latency_min: Duration::from_millis(200),
            latency_max: Duration::from_millis(200),
            ..Default::default()
        });

        let start = Instant::now();
        a.read("jobs").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let simulator = Arc::new(BackendSimulator::new());
        let a = simulator.connect("a");
        simulator.update_conditions(BackendConditions {
            hang: true,
            ..Default::default()
        });

        let result = tokio::time::timeout(Duration::from_secs(60), a.read("jobs")).await;
        assert!(result.is_err());
    }
}
