//! Election behaviour under lock store faults.

use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use tenure_core::ElectionConfig;
use tenure_election::ElectionEvent;
use tenure_testing::{
    create_test_scenarios, init_test_logging, BackendConditions, ElectionTestHarness, FaultType,
    TestScenario,
};

fn config() -> ElectionConfig {
    ElectionConfig::new("template", "scheduler")
        .with_lease_duration(Duration::from_secs(10))
        .with_renew_deadline(Duration::from_secs(5))
        .with_retry_period(Duration::from_secs(1))
        .with_release_on_cancel(true)
}

#[tokio::test(start_paused = true)]
async fn test_standard_scenarios() {
    init_test_logging();

    for scenario in create_test_scenarios() {
        let name = scenario.name.clone();
        let mut harness = ElectionTestHarness::new(config());
        let result = harness.run_scenario(scenario).await.unwrap();

        assert!(
            result.mutual_exclusion_held(),
            "{}: {} concurrent leaders",
            name,
            result.max_concurrent_leaders
        );

        let leader = result
            .final_leader
            .unwrap_or_else(|| panic!("{}: no leader at the end", name));
        assert_eq!(result.final_record.unwrap().holder(), leader, "{}", name);

        harness.stop_all().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_leader_steps_down_before_takeover() {
    init_test_logging();

    let mut harness = ElectionTestHarness::new(config());
    harness.start("a").unwrap();
    harness.wait_for_leader(Duration::from_secs(1)).await.unwrap();
    harness.start("b").unwrap();

    sleep(Duration::from_millis(3_500)).await;
    let held = harness.record().await.unwrap();
    harness
        .inject_fault(FaultType::Partition {
            identities: ["a".to_string()].into(),
            duration: None,
        })
        .await;
    let partitioned_at = Instant::now();

    // a keeps believing until its renew deadline, then steps down
    sleep(Duration::from_secs(4)).await;
    assert_eq!(harness.leaders(), vec!["a".to_string()]);

    sleep(Duration::from_secs(2)).await;
    assert!(harness.leaders().is_empty());
    assert!(harness.events("a").contains(&ElectionEvent::StoppedLeading));
    assert_eq!(harness.record().await.unwrap().holder(), "a");

    // b only takes over once the lease a last wrote has expired
    assert_eq!(
        harness.wait_for_leader(Duration::from_secs(10)).await,
        Some("b".to_string())
    );
    let record = harness.record().await.unwrap();
    assert!(record.spec.acquire_time_ms >= held.spec.lease_expiry_ms);
    assert!(partitioned_at.elapsed() >= Duration::from_secs(9));

    let stats = harness.handle("a").unwrap().stats();
    assert_eq!(stats.deadline_exceeded, 1);
    assert!(stats.transient_errors >= 4);

    // After healing, a follows the new leader instead of fighting for the lock
    harness.inject_fault(FaultType::Heal).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.leaders(), vec!["b".to_string()]);
    assert!(harness
        .events("a")
        .contains(&ElectionEvent::NewLeader(Some("b".to_string()))));
}

#[tokio::test(start_paused = true)]
async fn test_short_outage_keeps_leadership() {
    let mut harness = ElectionTestHarness::new(config());
    harness.start("a").unwrap();
    harness.wait_for_leader(Duration::from_secs(1)).await.unwrap();
    harness.start("b").unwrap();

    sleep(Duration::from_millis(2_500)).await;
    harness
        .inject_fault(FaultType::ErrorRate {
            rate: 1.0,
            duration: Duration::from_secs(3),
        })
        .await;

    sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.leaders(), vec!["a".to_string()]);
    assert_eq!(
        harness.events("a"),
        vec![
            ElectionEvent::NewLeader(Some("a".to_string())),
            ElectionEvent::StartedLeading,
        ]
    );

    let stats = harness.handle("a").unwrap().stats();
    assert!(stats.transient_errors >= 2);
    assert_eq!(stats.leadership_lost, 0);
    assert!(harness.simulator().stats().injected_errors >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_acknowledgements_do_not_depose_leader() {
    let mut harness = ElectionTestHarness::new(config());
    harness.start("a").unwrap();
    harness.wait_for_leader(Duration::from_secs(1)).await.unwrap();

    sleep(Duration::from_millis(2_500)).await;
    harness.simulator().update_conditions(BackendConditions {
        ack_loss_rate: 1.0,
        ..Default::default()
    });
    sleep(Duration::from_secs(3)).await;
    harness
        .simulator()
        .update_conditions(BackendConditions::default());

    sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.leaders(), vec!["a".to_string()]);

    let stats = harness.handle("a").unwrap().stats();
    assert_eq!(stats.leadership_lost, 0);
    assert!(harness.simulator().stats().lost_acks >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_acknowledgement_on_create_reclaims_own_record() {
    let mut harness = ElectionTestHarness::new(config());
    harness.simulator().update_conditions(BackendConditions {
        ack_loss_rate: 1.0,
        ..Default::default()
    });
    harness.start("a").unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(harness.leaders().is_empty());
    harness
        .simulator()
        .update_conditions(BackendConditions::default());

    assert_eq!(
        harness.wait_for_leader(Duration::from_secs(5)).await,
        Some("a".to_string())
    );

    let record = harness.record().await.unwrap();
    assert_eq!(record.spec.leader_transitions, 0);
    assert_eq!(record.version.value(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_store_forces_step_down_at_deadline() {
    let mut harness = ElectionTestHarness::new(config());
    harness.start("a").unwrap();
    harness.wait_for_leader(Duration::from_secs(1)).await.unwrap();

    sleep(Duration::from_millis(1_500)).await;
    harness
        .inject_fault(FaultType::Hang {
            duration: Duration::from_secs(30),
        })
        .await;

    // Next tick at 2s, then the 5s renew deadline
    sleep(Duration::from_millis(5_400)).await;
    assert_eq!(harness.leaders(), vec!["a".to_string()]);
    sleep(Duration::from_millis(200)).await;
    assert!(harness.leaders().is_empty());

    let stats = harness.handle("a").unwrap().stats();
    assert_eq!(stats.deadline_exceeded, 1);
    assert_eq!(
        harness.events("a"),
        vec![
            ElectionEvent::NewLeader(Some("a".to_string())),
            ElectionEvent::StartedLeading,
            ElectionEvent::StoppedLeading,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_store_hangs_gives_up_release() {
    let mut harness = ElectionTestHarness::new(config());
    harness.start("a").unwrap();
    harness.wait_for_leader(Duration::from_secs(1)).await.unwrap();

    harness.simulator().update_conditions(BackendConditions {
        hang: true,
        ..Default::default()
    });

    let start = Instant::now();
    let report = harness.stop("a").await.unwrap().unwrap();

    assert!(!report.released);
    assert_eq!(report.stats.failed_releases, 1);
    // The release is bounded by the renew deadline
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

fn flaky_scenario(error_rate: f64, latency_ms: u64, seed_leader_crash: bool) -> TestScenario {
    let mut faults = vec![
        (
            Duration::from_secs(3),
            FaultType::ErrorRate {
                rate: error_rate,
                duration: Duration::from_secs(20),
            },
        ),
        (
            Duration::from_secs(4),
            FaultType::Partition {
                identities: HashSet::from(["b".to_string()]),
                duration: Some(Duration::from_secs(8)),
            },
        ),
    ];
    if latency_ms > 0 {
        faults.push((
            Duration::from_secs(30),
            FaultType::HighLatency {
                min: Duration::from_millis(latency_ms / 2),
                max: Duration::from_millis(latency_ms),
                duration: Duration::from_secs(10),
            },
        ));
    }
    if seed_leader_crash {
        faults.push((
            Duration::from_secs(45),
            FaultType::Crash {
                identity: "a".to_string(),
            },
        ));
    }

    TestScenario {
        name: format!(
            "flaky store (errors {:.2}, latency {}ms, crash {})",
            error_rate, latency_ms, seed_leader_crash
        ),
        participants: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        faults,
        run_for: Duration::from_secs(90),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_at_most_one_leader_under_faults(
        error_rate in 0.0f64..0.6,
        latency_ms in prop_oneof![Just(0u64), 10u64..800],
        crash in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let result = runtime.block_on(async {
            let mut harness = ElectionTestHarness::new(config());
            let result = harness
                .run_scenario(flaky_scenario(error_rate, latency_ms, crash))
                .await
                .unwrap();
            harness.stop_all().await;
            result
        });

        prop_assert!(result.mutual_exclusion_held(), "{:?}", result);
        prop_assert!(result.final_leader.is_some(), "{:?}", result);
    }
}
