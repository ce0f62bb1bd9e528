//! Ping/Pong liveness tracking
//!
//! A connection is unhealthy once a Ping has gone unanswered for longer than
//! the configured timeout. Lives on the loop thread only.

use std::time::{Duration, Instant};

pub(crate) struct KeepAliveTracker {
    timeout: Duration,
    /// Send time of the oldest unanswered Ping
    outstanding: Option<Instant>,
    last_pong: Option<Instant>,
}

impl KeepAliveTracker {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            outstanding: None,
            last_pong: None,
        }
    }

    /// Whether a new Ping should go out now
    ///
    /// Only one Ping is in flight at a time; its send time is what the
    /// timeout is measured from.
    pub(crate) fn should_ping(&self) -> bool {
        self.outstanding.is_none()
    }

    pub(crate) fn record_ping_sent(&mut self, at: Instant) {
        if self.outstanding.is_none() {
            self.outstanding = Some(at);
        }
    }

    pub(crate) fn record_pong_received(&mut self, at: Instant) {
        self.outstanding = None;
        self.last_pong = Some(at);
    }

    pub(crate) fn is_healthy(&self, now: Instant) -> bool {
        match self.outstanding {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) < self.timeout,
        }
    }

    pub(crate) fn time_since_last_pong(&self, now: Instant) -> Option<Duration> {
        self.last_pong.map(|at| now.saturating_duration_since(at))
    }
}
