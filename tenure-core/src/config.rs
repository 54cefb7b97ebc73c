use crate::{Result, TenureError};
use std::time::Duration;
use uuid::Uuid;

/// Longest accepted identity or lock name, in bytes.
pub const MAX_NAME_LEN: usize = 253;

/// Environment variables read by [`ElectionConfig::from_env`].
pub const ENV_IDENTITY: &str = "TENURE_IDENTITY";
pub const ENV_LOCK_NAME: &str = "TENURE_LOCK_NAME";
pub const ENV_LEASE_DURATION_MS: &str = "TENURE_LEASE_DURATION_MS";
pub const ENV_RENEW_DEADLINE_MS: &str = "TENURE_RENEW_DEADLINE_MS";
pub const ENV_RETRY_PERIOD_MS: &str = "TENURE_RETRY_PERIOD_MS";
pub const ENV_RELEASE_ON_CANCEL: &str = "TENURE_RELEASE_ON_CANCEL";

/// Per-participant election configuration.
///
/// The timing fields must satisfy
/// `retry_period < renew_deadline < lease_duration`; [`validate`](Self::validate)
/// rejects anything else before an election attempt is made.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Unique name of this participant
    pub identity: String,

    /// Name of the lock record contended for
    pub lock_name: String,

    /// How long a claim stays valid without renewal
    pub lease_duration: Duration,

    /// Time budget for confirming a renewal before stepping down
    pub renew_deadline: Duration,

    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,

    /// Clear the lock record on graceful shutdown
    pub release_on_cancel: bool,

    /// Upper bound of the random extension applied to acquisition waits,
    /// as a fraction of `retry_period`
    pub jitter_factor: f64,

    /// Extra time a foreign lease is honoured past its expiry
    pub max_clock_skew: Duration,

    /// Capacity of the leadership event queue
    pub event_buffer: usize,

    /// Budget for the release write on shutdown, defaults to `renew_deadline`
    pub release_timeout: Option<Duration>,
}

impl ElectionConfig {
    pub fn new(identity: impl Into<String>, lock_name: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lock_name: lock_name.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: false,
            jitter_factor: 1.2,
            max_clock_skew: Duration::ZERO,
            event_buffer: 64,
            release_timeout: None,
        }
    }

    /// Build an identity that is unique across restarts, e.g. `worker-<uuid>`.
    pub fn generated_identity(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_renew_deadline(mut self, deadline: Duration) -> Self {
        self.renew_deadline = deadline;
        self
    }

    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    pub fn with_release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = Some(timeout);
        self
    }

    pub fn release_window(&self) -> Duration {
        self.release_timeout.unwrap_or(self.renew_deadline)
    }

    /// How long a leader trusts a lease it wrote, measured from just before
    /// the write was stamped. Shorter than the lease by the skew allowance.
    pub fn trusted_lease(&self) -> Duration {
        self.lease_duration.saturating_sub(self.max_clock_skew)
    }

    /// Check every invariant of the configuration.
    pub fn validate(&self) -> Result<()> {
        validate_name("identity", &self.identity)?;
        validate_name("lock name", &self.lock_name)?;

        if self.retry_period.is_zero() {
            return Err(TenureError::config("retry period must be greater than zero"));
        }

        if self.renew_deadline <= self.retry_period {
            return Err(TenureError::config(format!(
                "renew deadline {:?} must be greater than retry period {:?}",
                self.renew_deadline, self.retry_period
            )));
        }

        if self.lease_duration <= self.renew_deadline {
            return Err(TenureError::config(format!(
                "lease duration {:?} must be greater than renew deadline {:?}",
                self.lease_duration, self.renew_deadline
            )));
        }

        if self.trusted_lease() <= self.renew_deadline {
            return Err(TenureError::config(format!(
                "max clock skew {:?} leaves less than the renew deadline {:?} of a {:?} lease",
                self.max_clock_skew, self.renew_deadline, self.lease_duration
            )));
        }

        if !self.jitter_factor.is_finite() || self.jitter_factor < 0.0 {
            return Err(TenureError::config(format!(
                "jitter factor {} must be a finite, non-negative number",
                self.jitter_factor
            )));
        }

        if self.renew_deadline.as_secs_f64() <= self.retry_period.as_secs_f64() * self.jitter_factor
        {
            return Err(TenureError::config(format!(
                "renew deadline {:?} must be greater than jittered retry period {:?} x {}",
                self.renew_deadline, self.retry_period, self.jitter_factor
            )));
        }

        if self.event_buffer == 0 {
            return Err(TenureError::config("event buffer must hold at least one event"));
        }

        if let Some(timeout) = self.release_timeout {
            if timeout.is_zero() || timeout > self.renew_deadline {
                return Err(TenureError::config(format!(
                    "release timeout {:?} must be non-zero and at most the renew deadline {:?}",
                    timeout, self.renew_deadline
                )));
            }
        }

        Ok(())
    }

    /// Load a configuration from `TENURE_*` environment variables.
    ///
    /// Identity and lock name are required; durations fall back to the
    /// defaults of [`ElectionConfig::new`].
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let identity = lookup(ENV_IDENTITY)
            .ok_or_else(|| TenureError::config(format!("{} is not set", ENV_IDENTITY)))?;
        let lock_name = lookup(ENV_LOCK_NAME)
            .ok_or_else(|| TenureError::config(format!("{} is not set", ENV_LOCK_NAME)))?;

        let mut config = Self::new(identity, lock_name);

        if let Some(ms) = parse_millis(&lookup, ENV_LEASE_DURATION_MS)? {
            config.lease_duration = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_RENEW_DEADLINE_MS)? {
            config.renew_deadline = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_RETRY_PERIOD_MS)? {
            config.retry_period = ms;
        }
        if let Some(raw) = lookup(ENV_RELEASE_ON_CANCEL) {
            config.release_on_cancel = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(TenureError::config(format!(
                        "{} has invalid boolean value {:?}",
                        ENV_RELEASE_ON_CANCEL, other
                    )))
                }
            };
        }

        Ok(config)
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| TenureError::config(format!("{} is not a number of milliseconds: {}", key, e))),
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TenureError::config(format!("{} must not be empty", what)));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(TenureError::config(format!(
            "{} is {} bytes long, the limit is {}",
            what,
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(TenureError::config(format!(
            "{} {:?} contains control characters",
            what, name
        )));
    }

    Ok(())
}
