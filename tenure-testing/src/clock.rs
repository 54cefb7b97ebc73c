use std::sync::Arc;
use tenure_core::{Clock, SystemClock};
use tokio::time::Instant;

/// Wall clock that advances with tokio time.
///
/// Under `start_paused` tests the wall clock jumps together with the paused
/// runtime clock, so lease expiry written into records lines up with the
/// participants' deadlines. Clones share the anchor; `with_offset` gives a
/// participant a skewed view of the same clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_ms: u64,
    origin: Instant,
    offset_ms: i64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now_millis())
    }

    pub fn starting_at(anchor_ms: u64) -> Self {
        Self {
            anchor_ms,
            origin: Instant::now(),
            offset_ms: 0,
        }
    }

    /// Same clock, read `offset_ms` ahead (or behind, if negative).
    pub fn with_offset(&self, offset_ms: i64) -> Self {
        Self {
            offset_ms,
            ..self.clone()
        }
    }

    pub fn shared(&self) -> Arc<dyn Clock> {
        Arc::new(self.clone())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        let now = self.anchor_ms + self.origin.elapsed().as_millis() as u64;
        now.saturating_add_signed(self.offset_ms)
    }
}
