//! # Core Types
//!
//! The lock record shared between participants and the local view of
//! leadership derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque compare-and-swap token attached to a stored lock record.
///
/// Backends assign a new, strictly greater version on every successful
/// write. Participants never fabricate versions; they only echo back the
/// one they last read.
///
/// # Examples
///
/// ```rust
/// use tenure_core::Version;
///
/// let v1 = Version::new(1);
/// assert!(v1.next() > v1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Content of a lock record, everything except the backend-owned version.
///
/// All timestamps are wall-clock milliseconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockSpec {
    /// Identity of the claimed leader, empty when unheld
    pub holder_identity: String,
    /// Lease length the holder advertised when it last wrote the record
    pub lease_duration_ms: u64,
    /// When the current holder first acquired the lock
    pub acquire_time_ms: u64,
    /// When the current holder last renewed the lock
    pub renew_time_ms: u64,
    /// Instant after which the claim is void
    pub lease_expiry_ms: u64,
    /// Number of times the lock changed hands
    pub leader_transitions: u64,
}

impl LockSpec {
    /// Whether a holder identity is recorded at all.
    pub fn is_held(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    /// Whether the claim is void at `now_ms`.
    ///
    /// A record is expired only once `now_ms` reaches the expiry plus the
    /// tolerated clock skew, never earlier. Unheld records are always free.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tenure_core::LockSpec;
    ///
    /// let spec = LockSpec {
    ///     holder_identity: "a".to_string(),
    ///     lease_expiry_ms: 10_000,
    ///     ..Default::default()
    /// };
    /// assert!(!spec.is_expired_at(9_999, 0));
    /// assert!(spec.is_expired_at(10_000, 0));
    /// assert!(!spec.is_expired_at(10_000, 500));
    /// ```
    pub fn is_expired_at(&self, now_ms: u64, max_skew_ms: u64) -> bool {
        !self.is_held() || now_ms >= self.lease_expiry_ms.saturating_add(max_skew_ms)
    }

    /// The identity that currently owns the lease at `now_ms`, if any.
    pub fn active_holder(&self, now_ms: u64, max_skew_ms: u64) -> Option<&str> {
        if self.is_expired_at(now_ms, max_skew_ms) {
            None
        } else {
            Some(self.holder_identity.as_str())
        }
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.is_held() && self.holder_identity == identity
    }
}

/// A lock record as stored by a [`LockBackend`](crate::backend::LockBackend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(flatten)]
    pub spec: LockSpec,
    pub version: Version,
}

impl LockRecord {
    pub fn new(spec: LockSpec, version: Version) -> Self {
        Self { spec, version }
    }

    pub fn holder(&self) -> &str {
        &self.spec.holder_identity
    }
}

/// This participant's local view of leadership.
///
/// Published by the election loop and read by the hosting application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LeaderState {
    /// No election attempt has reached a conclusion yet
    #[default]
    Unknown,

    /// This participant holds the lease
    Leading,

    /// Another participant holds an unexpired lease
    Following(String),

    /// The lease is unheld or expired
    NoLeader,
}

impl LeaderState {
    pub fn is_leading(&self) -> bool {
        matches!(self, LeaderState::Leading)
    }
}

impl fmt::Display for LeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderState::Unknown => write!(f, "unknown"),
            LeaderState::Leading => write!(f, "leading"),
            LeaderState::Following(leader) => write!(f, "following {}", leader),
            LeaderState::NoLeader => write!(f, "no leader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(holder: &str, expiry: u64) -> LockSpec {
        LockSpec {
            holder_identity: holder.to_string(),
            lease_duration_ms: 10_000,
            acquire_time_ms: expiry.saturating_sub(10_000),
            renew_time_ms: expiry.saturating_sub(10_000),
            lease_expiry_ms: expiry,
            leader_transitions: 1,
        }
    }

    #[test]
    fn test_unheld_record_is_always_expired() {
        let spec = LockSpec::default();
        assert!(!spec.is_held());
        assert!(spec.is_expired_at(0, 0));
        assert_eq!(spec.active_holder(0, 0), None);
    }

    #[test]
    fn test_expiry_boundary() {
        let spec = held("a", 5_000);
        assert_eq!(spec.active_holder(4_999, 0), Some("a"));
        assert_eq!(spec.active_holder(5_000, 0), None);
    }

    #[test]
    fn test_skew_delays_expiry() {
        let spec = held("a", 5_000);
        assert_eq!(spec.active_holder(5_200, 250), Some("a"));
        assert_eq!(spec.active_holder(5_250, 250), None);
        assert!(!held("a", u64::MAX).is_expired_at(u64::MAX - 1, 1_000));
    }

    #[test]
    fn test_held_by() {
        let spec = held("a", 1);
        assert!(spec.is_held_by("a"));
        assert!(!spec.is_held_by("b"));
        assert!(!LockSpec::default().is_held_by(""));
    }

    #[test]
    fn test_record_json_is_flat() {
        let record = LockRecord::new(held("node-1", 20_000), Version::new(7));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["holder_identity"], "node-1");
        assert_eq!(json["version"], 7);

        let decoded: LockRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_leader_state_display() {
        assert_eq!(LeaderState::default(), LeaderState::Unknown);
        assert_eq!(
            LeaderState::Following("b".to_string()).to_string(),
            "following b"
        );
        assert!(LeaderState::Leading.is_leading());
        assert!(!LeaderState::NoLeader.is_leading());
    }
}
