// Reconnect backoff — pure delay schedule, no clocks, no I/O

use std::time::Duration;

/// Exponent clamp so `2^attempt` can never overflow the millisecond math.
const MAX_EXPONENT: u32 = 16;

/// Decision for the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttempt {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Attempt budget spent; stop auto-retrying and surface the exhausted
    /// state. Recoverable only by an explicit caller-initiated connect.
    GiveUp,
}

/// Exponential backoff schedule: `min(base * 2^attempt, cap)` with a hard
/// attempt budget.
///
/// Attempt counting is the caller's job: reset to 0 on a successful
/// connection, bump by 1 on every failed or dropped attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl BackoffSchedule {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 2u64.pow(attempt.min(MAX_EXPONENT));
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.cap.as_millis() as u64))
    }

    /// Whether to retry after `attempt` failures, and how long to wait.
    pub fn next_attempt(&self, attempt: u32) -> NextAttempt {
        if attempt >= self.max_attempts {
            NextAttempt::GiveUp
        } else {
            NextAttempt::Retry(self.delay_for(attempt))
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_uses_base_delay() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_delays_double_until_cap() {
        let schedule =
            BackoffSchedule::new(Duration::from_millis(500), Duration::from_secs(30), 10);
        assert_eq!(schedule.delay_for(1), Duration::from_millis(1000));
        assert_eq!(schedule.delay_for(2), Duration::from_millis(2000));
        assert_eq!(schedule.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_sequence_is_non_decreasing_and_capped() {
        let schedule = BackoffSchedule::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = schedule.delay_for(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let schedule = BackoffSchedule::new(Duration::from_secs(5), Duration::from_secs(60), u32::MAX);
        assert_eq!(schedule.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_gives_up_after_budget() {
        let schedule = BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(1), 3);
        assert!(matches!(schedule.next_attempt(0), NextAttempt::Retry(_)));
        assert!(matches!(schedule.next_attempt(2), NextAttempt::Retry(_)));
        assert_eq!(schedule.next_attempt(3), NextAttempt::GiveUp);
        assert_eq!(schedule.next_attempt(4), NextAttempt::GiveUp);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let schedule = BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(1), 0);
        assert_eq!(schedule.next_attempt(0), NextAttempt::GiveUp);
    }
}
