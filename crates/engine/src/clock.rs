//! Wall-clock source.
//!
//! Timers run on `tokio::time`; wall-clock timestamps (execution records,
//! one-shot schedules, reminder due dates) come from a [`Clock`]. The default
//! [`SystemClock`] derives wall time from `tokio::time::Instant`, so a test
//! that pauses and advances tokio time moves both in lockstep.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock anchored to the tokio timer.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.started);
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.origin.checked_add_signed(d))
            .unwrap_or(self.origin)
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
