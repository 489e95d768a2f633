//! Reconnect and polling limits.

use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Some(Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64())))
    }
}

/// Status polling used once the push channel is given up.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 60,
        }
    }
}
