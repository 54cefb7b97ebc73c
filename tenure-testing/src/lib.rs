pub mod backend_sim;
pub mod clock;
pub mod fault_injection;

pub use backend_sim::{BackendConditions, BackendSimulator, BackendStats, SimulatedBackend};
pub use clock::TokioClock;
pub use fault_injection::{
    create_test_scenarios, ElectionTestHarness, FaultType, TestResult, TestScenario,
};

/// Install a compact subscriber for tests, honouring `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
