use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{error, info, warn};

use tenure_core::{ElectionConfig, LockRecord, Result};
use tenure_election::{ElectionEvent, ElectionHandle, ElectionSupervisor, SupervisorReport};

use crate::backend_sim::{BackendConditions, BackendSimulator, BackendStats};
use crate::clock::TokioClock;

#[derive(Debug, Clone)]
pub enum FaultType {
    /// Abort the participant's task; its lease is left to expire
    Crash { identity: String },
    /// Graceful shutdown through the election handle
    Stop { identity: String },
    /// Start a fresh supervisor under an existing identity
    Restart { identity: String },
    /// Cut participants off from the lock store
    Partition {
        identities: HashSet<String>,
        duration: Option<Duration>,
    },
    Heal,
    ErrorRate { rate: f64, duration: Duration },
    HighLatency {
        min: Duration,
        max: Duration,
        duration: Duration,
    },
    /// Every store call hangs
    Hang { duration: Duration },
}

#[derive(Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    pub participants: Vec<String>,
    pub faults: Vec<(Duration, FaultType)>, // (offset from start, fault)
    pub run_for: Duration,
}

/// What the harness observed while a scenario ran.
#[derive(Debug)]
pub struct TestResult {
    pub scenario: String,
    pub duration: Duration,
    /// Largest number of participants that believed they led at one sample
    pub max_concurrent_leaders: usize,
    /// Sequence of distinct leaders, in the order they were sampled
    pub leader_history: Vec<String>,
    pub final_leader: Option<String>,
    pub final_record: Option<LockRecord>,
    pub backend_stats: BackendStats,
}

impl TestResult {
    pub fn mutual_exclusion_held(&self) -> bool {
        self.max_concurrent_leaders <= 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Crashed,
    Stopped,
}

struct Participant {
    handle: ElectionHandle,
    task: JoinHandle<Result<SupervisorReport>>,
    events: Arc<Mutex<Vec<ElectionEvent>>>,
    status: Status,
}

/// Runs several supervisors for one lock against a shared simulated store.
pub struct ElectionTestHarness {
    simulator: Arc<BackendSimulator>,
    clock: TokioClock,
    config: ElectionConfig,
    participants: BTreeMap<String, Participant>,
    sample_every: Duration,
}

impl ElectionTestHarness {
    /// `config` is used as a template; each participant gets its own identity.
    pub fn new(config: ElectionConfig) -> Self {
        Self {
            simulator: Arc::new(BackendSimulator::new()),
            clock: TokioClock::new(),
            config,
            participants: BTreeMap::new(),
            sample_every: Duration::from_millis(100),
        }
    }

    pub fn simulator(&self) -> &Arc<BackendSimulator> {
        &self.simulator
    }

    pub fn clock(&self) -> &TokioClock {
        &self.clock
    }

    pub fn lock_name(&self) -> &str {
        &self.config.lock_name
    }

    pub fn start(&mut self, identity: &str) -> Result<ElectionHandle> {
        let config = ElectionConfig {
            identity: identity.to_string(),
            ..self.config.clone()
        };
        self.start_with(config, self.clock.clone())
    }

    /// Start a participant with its own configuration and clock.
    pub fn start_with(&mut self, config: ElectionConfig, clock: TokioClock) -> Result<ElectionHandle> {
        let identity = config.identity.clone();
        let backend = self.simulator.connect(identity.clone());
        let (supervisor, handle, mut rx) =
            ElectionSupervisor::with_clock(config, backend, clock.shared())?;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().push(event);
            }
        });

        let id = identity.clone();
        let task = tokio::spawn(async move {
            let result = supervisor.run().await;
            if let Err(e) = &result {
                error!("Supervisor for {} failed: {}", id, e);
            }
            result
        });

        info!("Started participant {}", identity);
        if let Some(previous) = self.participants.insert(
            identity.clone(),
            Participant {
                handle: handle.clone(),
                task,
                events,
                status: Status::Running,
            },
        ) {
            if previous.status == Status::Running {
                warn!("Replacing running participant {}", identity);
                previous.task.abort();
            }
        }

        Ok(handle)
    }

    /// Kill a participant without giving it a chance to release.
    pub fn crash(&mut self, identity: &str) -> bool {
        match self.participants.get_mut(identity) {
            Some(participant) if participant.status == Status::Running => {
                info!("Crashing participant {}", identity);
                participant.task.abort();
                participant.status = Status::Crashed;
                true
            }
            _ => false,
        }
    }

    /// Shut a participant down and wait for its report.
    ///
    /// The participant's events stay available after it stops.
    pub async fn stop(&mut self, identity: &str) -> Option<Result<SupervisorReport>> {
        let participant = self
            .participants
            .get_mut(identity)
            .filter(|p| p.status == Status::Running)?;
        participant.handle.shutdown();
        participant.status = Status::Stopped;

        match (&mut participant.task).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Participant {} did not stop cleanly: {}", identity, e);
                None
            }
        }
    }

    pub async fn stop_all(&mut self) {
        let identities: Vec<String> = self.participants.keys().cloned().collect();
        for identity in identities {
            self.stop(&identity).await;
        }
    }

    pub fn handle(&self, identity: &str) -> Option<&ElectionHandle> {
        self.participants.get(identity).map(|p| &p.handle)
    }

    /// Events delivered to a participant so far.
    pub fn events(&self, identity: &str) -> Vec<ElectionEvent> {
        self.participants
            .get(identity)
            .map(|p| p.events.lock().clone())
            .unwrap_or_default()
    }

    /// Participants whose supervisor currently believes it leads.
    pub fn leaders(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|(_, p)| p.status == Status::Running && !p.task.is_finished())
            .filter(|(_, p)| p.handle.is_leader())
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub async fn record(&self) -> Option<LockRecord> {
        self.simulator.record(&self.config.lock_name).await
    }

    /// Wait until exactly one participant leads.
    pub async fn wait_for_leader(&self, limit: Duration) -> Option<String> {
        let deadline = Instant::now() + limit;

        loop {
            let leaders = self.leaders();
            if leaders.len() == 1 {
                return leaders.into_iter().next();
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn inject_fault(&mut self, fault: FaultType) {
        match fault {
            FaultType::Crash { identity } => {
                self.crash(&identity);
            }

            FaultType::Stop { identity } => {
                self.stop(&identity).await;
            }

            FaultType::Restart { identity } => {
                if let Err(e) = self.start(&identity) {
                    error!("Failed to restart {}: {}", identity, e);
                }
            }

            FaultType::Partition {
                identities,
                duration,
            } => {
                self.simulator.create_partition(identities, duration);
            }

            FaultType::Heal => self.simulator.heal_partitions(),

            FaultType::ErrorRate { rate, duration } => {
                info!("Injecting error rate {} (duration: {:?})", rate, duration);
                self.apply_for(
                    BackendConditions {
                        error_rate: rate,
                        ..Default::default()
                    },
                    duration,
                );
            }

            FaultType::HighLatency { min, max, duration } => {
                info!(
                    "Injecting latency {:?}-{:?} (duration: {:?})",
                    min, max, duration
                );
                self.apply_for(
                    BackendConditions {
                        latency_min: min,
                        latency_max: max,
                        ..Default::default()
                    },
                    duration,
                );
            }

            FaultType::Hang { duration } => {
                info!("Injecting store hang (duration: {:?})", duration);
                self.apply_for(
                    BackendConditions {
                        hang: true,
                        ..Default::default()
                    },
                    duration,
                );
            }
        }
    }

    fn apply_for(&self, conditions: BackendConditions, duration: Duration) {
        self.simulator.update_conditions(conditions);

        let simulator = self.simulator.clone();
        tokio::spawn(async move {
            sleep(duration).await;
            simulator.update_conditions(BackendConditions::default());
        });
    }

    pub async fn run_scenario(&mut self, scenario: TestScenario) -> Result<TestResult> {
        info!("Running test scenario: {}", scenario.name);
        let start = Instant::now();
        let mut observer = LeadershipObserver::default();

        for identity in &scenario.participants {
            self.start(identity)?;
        }

        let mut faults = scenario.faults;
        faults.sort_by_key(|(at, _)| *at);

        for (at, fault) in faults {
            self.observe_until(start + at, &mut observer).await;
            self.inject_fault(fault).await;
        }
        self.observe_until(start + scenario.run_for, &mut observer).await;

        let final_leader = self.leaders().into_iter().next();
        Ok(TestResult {
            scenario: scenario.name,
            duration: start.elapsed(),
            max_concurrent_leaders: observer.max_concurrent,
            leader_history: observer.history,
            final_leader,
            final_record: self.record().await,
            backend_stats: self.simulator.stats(),
        })
    }

    async fn observe_until(&self, until: Instant, observer: &mut LeadershipObserver) {
        loop {
            observer.sample(self.leaders());

            let next = Instant::now() + self.sample_every;
            if next > until {
                sleep_until(until).await;
                observer.sample(self.leaders());
                return;
            }
            sleep_until(next).await;
        }
    }
}

impl Drop for ElectionTestHarness {
    fn drop(&mut self) {
        for participant in self.participants.values() {
            if participant.status == Status::Running {
                participant.task.abort();
            }
        }
    }
}

#[derive(Debug, Default)]
struct LeadershipObserver {
    max_concurrent: usize,
    history: Vec<String>,
}

impl LeadershipObserver {
    fn sample(&mut self, leaders: Vec<String>) {
        self.max_concurrent = self.max_concurrent.max(leaders.len());

        if let [leader] = leaders.as_slice() {
            if self.history.last() != Some(leader) {
                self.history.push(leader.clone());
            }
        }
    }
}

/// Scenarios every election configuration should survive.
pub fn create_test_scenarios() -> Vec<TestScenario> {
    let participants = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    vec![
        TestScenario {
            name: "Steady State".to_string(),
            participants: participants.clone(),
            faults: vec![],
            run_for: Duration::from_secs(60),
        },
        TestScenario {
            name: "Leader Crash".to_string(),
            participants: participants.clone(),
            faults: vec![(
                Duration::from_secs(5),
                FaultType::Crash {
                    identity: "a".to_string(),
                },
            )],
            run_for: Duration::from_secs(40),
        },
        TestScenario {
            name: "Leader Partition".to_string(),
            participants: participants.clone(),
            faults: vec![(
                Duration::from_secs(5),
                FaultType::Partition {
                    identities: ["a".to_string()].into(),
                    duration: Some(Duration::from_secs(30)),
                },
            )],
            run_for: Duration::from_secs(60),
        },
        TestScenario {
            name: "Flaky Store".to_string(),
            participants: participants.clone(),
            faults: vec![(
                Duration::from_secs(5),
                FaultType::ErrorRate {
                    rate: 0.3,
                    duration: Duration::from_secs(20),
                },
            )],
            run_for: Duration::from_secs(60),
        },
        TestScenario {
            name: "Store Hang".to_string(),
            participants: participants.clone(),
            faults: vec![(
                Duration::from_secs(5),
                FaultType::Hang {
                    duration: Duration::from_secs(15),
                },
            )],
            run_for: Duration::from_secs(60),
        },
        TestScenario {
            name: "Rolling Restart".to_string(),
            participants,
            faults: vec![
                (
                    Duration::from_secs(5),
                    FaultType::Stop {
                        identity: "a".to_string(),
                    },
                ),
                (
                    Duration::from_secs(10),
                    FaultType::Restart {
                        identity: "a".to_string(),
                    },
                ),
                (
                    Duration::from_secs(20),
                    FaultType::Crash {
                        identity: "b".to_string(),
                    },
                ),
            ],
            run_for: Duration::from_secs(60),
        },
    ]
}
