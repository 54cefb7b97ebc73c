//! Liveness check for a participant's election loop.

use crate::ElectionHandle;
use std::time::Duration;
use tokio::time::Instant;

/// Health status of the election loop
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// Not leading, or leading with a fresh lease
    Healthy,

    /// Believes it leads, but has not renewed for longer than its lease
    Unhealthy {
        /// Reason for unhealthy status
        reason: String,
        /// Time since the last successful renewal
        since_renewal: Duration,
    },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Reports a wedged leader.
///
/// A working loop steps down once the renew deadline passes without a
/// confirmed renewal, which is always before the lease expires. A process
/// that still claims leadership after `lease_duration + tolerance` without
/// renewing has a stuck election loop and should be restarted by whatever
/// probes this check.
#[derive(Debug, Clone)]
pub struct LeaderHealth {
    handle: ElectionHandle,
    tolerance: Duration,
}

impl LeaderHealth {
    pub fn new(handle: ElectionHandle, tolerance: Duration) -> Self {
        Self { handle, tolerance }
    }

    pub fn check(&self) -> HealthStatus {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> HealthStatus {
        if !self.handle.is_leader() {
            return HealthStatus::Healthy;
        }

        let last_renewal = match self.handle.stats().last_renewal {
            Some(at) => at,
            None => return HealthStatus::Healthy,
        };

        let since_renewal = now.saturating_duration_since(last_renewal);
        let limit = self.handle.lease_duration() + self.tolerance;

        if since_renewal > limit {
            HealthStatus::Unhealthy {
                reason: format!(
                    "{} still claims leadership {:?} after its last renewal (limit {:?})",
                    self.handle.identity(),
                    since_renewal,
                    limit
                ),
                since_renewal,
            }
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ElectionSupervisor;
    use tenure_backend::InMemoryBackend;
    use tenure_core::ElectionConfig;

    fn config() -> ElectionConfig {
        ElectionConfig::new("a", "jobs")
            .with_lease_duration(Duration::from_secs(10))
            .with_renew_deadline(Duration::from_secs(5))
            .with_retry_period(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_is_healthy() {
        let (_supervisor, handle, _events) =
            ElectionSupervisor::new(config(), InMemoryBackend::new()).unwrap();

        let health = LeaderHealth::new(handle, Duration::from_secs(2));
        assert!(health.check().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewing_leader_is_healthy_and_stale_claim_is_not() {
        let (supervisor, handle, _events) =
            ElectionSupervisor::new(config(), InMemoryBackend::new()).unwrap();
        tokio::spawn(supervisor.run());
        handle.wait_for_leadership().await.unwrap();

        let health = LeaderHealth::new(handle.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(health.check().is_healthy());

        // Viewed from far in the future, the last renewal is too old
        let later = Instant::now() + Duration::from_secs(13);
        match health.check_at(later) {
            HealthStatus::Unhealthy { since_renewal, .. } => {
                assert!(since_renewal > Duration::from_secs(12));
            }
            other => panic!("expected unhealthy, got {:?}", other),
        }
    }
}
