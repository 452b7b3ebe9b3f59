//! Heartbeat scheduling.
//!
//! A heartbeat posts the current lease claim every interval. Each explicit
//! lease or release post replaces the pending heartbeat, and the next one is
//! scheduled from its response. A failed delivery is retried once after the
//! shorter recovery interval; the retry itself follows the same rule.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Duration,
    recover: Duration,
    deadline: Option<Instant>,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration, recover: Duration) -> Self {
        Self {
            interval,
            recover,
            deadline: None,
        }
    }

    /// Next heartbeat after a successful post
    pub fn schedule_next(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    /// Retry after a failed post
    pub fn schedule_recovery(&mut self) {
        self.deadline = Some(Instant::now() + self.recover);
    }

    /// Drop the pending heartbeat; a post is about to go out
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until `deadline`, or forever when there is none
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
