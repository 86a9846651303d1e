use crate::config::RestartConfig;
use std::time::Duration;

/// Facts about an exit that decide whether it is retried
#[derive(Debug, Clone, Copy)]
pub struct ExitContext {
    /// The exit was requested through `stop()`
    pub manual_stop: bool,
    /// The analysis was still supposed to be running
    pub intended_running: bool,
    /// The output monitor saw the connection fail
    pub connection_error: bool,
}

/// Restart policy for infrastructure-level failures
///
/// Only exits caused by a detected connection failure are retried. An exit
/// without one points at the analysis' own logic and is left for a human.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Delay before the first restart
    pub initial_delay: Duration,
    /// Upper bound of the exponential backoff
    pub max_delay: Duration,
}

impl RestartPolicy {
    /// Create a restart policy from configuration values
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn should_restart(&self, exit: &ExitContext) -> bool {
        exit.connection_error && exit.intended_running && !exit.manual_stop
    }

    /// Calculate the delay before the next restart attempt
    ///
    /// `initial * 2^attempts`, capped at `max_delay`.
    pub fn calculate_delay(&self, tracker: &RestartTracker) -> Duration {
        let factor = 2_u32.saturating_pow(tracker.attempts());
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}

/// Consecutive restart attempts of one analysis
///
/// Attempts accumulate across connection-error restarts and only go back to
/// zero once the analysis reports a successful connection.
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    attempts: u32,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scheduled restart
    pub fn record_restart(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget previous attempts after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(manual_stop: bool, intended_running: bool, connection_error: bool) -> ExitContext {
        ExitContext {
            manual_stop,
            intended_running,
            connection_error,
        }
    }

    #[test]
    fn test_only_connection_errors_restart() {
        let policy = RestartPolicy::default();

        assert!(policy.should_restart(&exit(false, true, true)));
        // Application failure without connection problem
        assert!(!policy.should_restart(&exit(false, true, false)));
        // Manual stop
        assert!(!policy.should_restart(&exit(true, true, true)));
        // Nobody wants it running
        assert!(!policy.should_restart(&exit(false, false, true)));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RestartPolicy::from_config(&RestartConfig {
            initial_delay_ms: 250,
            max_delay_ms: 1_000,
        });

        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RestartPolicy::from_config(&RestartConfig {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
        });
        let mut tracker = RestartTracker::new();

        let mut delays = Vec::new();
        for _ in 0..6 {
            delays.push(policy.calculate_delay(&tracker).as_secs());
            tracker.record_restart();
        }
        // 5 * 2^4 = 80, capped at 60
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        // Huge exponents saturate instead of overflowing
        for _ in 0..200 {
            tracker.record_restart();
        }
        assert_eq!(policy.calculate_delay(&tracker), Duration::from_secs(60));
    }

    #[test]
    fn test_tracker_record_and_reset() {
        let mut tracker = RestartTracker::new();
        assert_eq!(tracker.attempts(), 0);

        tracker.record_restart();
        tracker.record_restart();
        assert_eq!(tracker.attempts(), 2);

        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
    }

    #[test]
    fn test_calculate_delay_follows_attempts() {
        let policy = RestartPolicy::from_config(&RestartConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        });
        let mut tracker = RestartTracker::new();

        assert_eq!(policy.calculate_delay(&tracker), Duration::from_secs(1));
        tracker.record_restart();
        assert_eq!(policy.calculate_delay(&tracker), Duration::from_secs(2));
        tracker.record_restart();
        assert_eq!(policy.calculate_delay(&tracker), Duration::from_secs(4));
    }
}
