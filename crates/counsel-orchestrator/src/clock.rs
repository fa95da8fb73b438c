use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of wall-clock time for schedule evaluation and deadlines.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by tokio's monotonic clock.
///
/// Reads as `origin` at construction and advances with `tokio::time::Instant`,
/// so under a paused runtime it moves exactly as far as tokio timers do.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl VirtualClock {
    /// Clock reading `origin` now and advancing with tokio time.
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.started.elapsed();
        chrono::Duration::from_std(elapsed)
            .map(|d| self.origin + d)
            .unwrap_or(self.origin)
    }
}
