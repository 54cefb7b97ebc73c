//! Run one participant of a leader election over a shared lock directory.
//!
//! Start several copies with different `LEADER_NAME`s and the same
//! `TENURE_LOCK_DIR`; stop the leader with ctrl-c and watch another take over.
//!
//! ```text
//! LEADER_NAME=alpha TENURE_LOCK_DIR=/tmp/locks cargo run --bin tenure-demo
//! LEADER_NAME=beta  TENURE_LOCK_DIR=/tmp/locks cargo run --bin tenure-demo
//! ```

use anyhow::Context;
use async_trait::async_trait;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tenure_backend::FileSystemBackend;
use tenure_core::config::ENV_LOCK_NAME;
use tenure_core::ElectionConfig;
use tenure_election::{
    spawn_callbacks, ElectionSupervisor, HealthStatus, LeaderCallbacks, LeaderHealth,
};

const DEFAULT_LOCK_NAME: &str = "tenure-demo";

struct DemoCallbacks {
    identity: String,
}

#[async_trait]
impl LeaderCallbacks for DemoCallbacks {
    async fn on_started_leading(&mut self) {
        info!("started leading.");
    }

    async fn on_stopped_leading(&mut self) {
        info!("no longer the leader, staying inactive.");
    }

    async fn on_new_leader(&mut self, identity: Option<&str>) {
        match identity {
            Some(id) if id == self.identity => {
                info!("I am {}! I will lead you to greatness!", id)
            }
            Some(id) => info!("All hail {}", id),
            None => info!("The lock is free"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let identity = env::var("LEADER_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| ElectionConfig::generated_identity("tenure-demo"));
    let lock_dir = env::var("TENURE_LOCK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("tenure-locks"));
    let lock_name = env::var(ENV_LOCK_NAME).unwrap_or_else(|_| DEFAULT_LOCK_NAME.to_string());

    let config = ElectionConfig::new(identity.clone(), lock_name)
        .with_lease_duration(Duration::from_secs(10))
        .with_renew_deadline(Duration::from_secs(5))
        .with_retry_period(Duration::from_secs(1))
        .with_release_on_cancel(true);

    let backend = FileSystemBackend::new(&lock_dir)
        .await
        .with_context(|| format!("opening lock directory {}", lock_dir.display()))?;

    info!(
        "Running as {} against {}",
        identity,
        lock_dir.display()
    );

    let (supervisor, handle, events) = ElectionSupervisor::new(config, backend)?;
    let callbacks = spawn_callbacks(events, DemoCallbacks { identity });
    let health = LeaderHealth::new(handle.clone(), Duration::from_secs(5));

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, stepping down");
            ctrl_c.shutdown();
        }
    });

    let mut election = tokio::spawn(supervisor.run());
    let mut health_checks = tokio::time::interval(Duration::from_secs(15));

    let report = loop {
        tokio::select! {
            result = &mut election => break result??,
            _ = health_checks.tick() => {
                if let HealthStatus::Unhealthy { reason, .. } = health.check() {
                    error!("Election loop is stuck: {}", reason);
                }
            }
        }
    };

    if let Err(e) = callbacks.await {
        warn!("Callback task ended abnormally: {}", e);
    }

    info!(
        "Stopped after {} attempt(s), {} acquisition(s), released: {}",
        report.attempts, report.stats.acquisitions, report.released
    );
    Ok(())
}
