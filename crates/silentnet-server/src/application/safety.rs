//! Per-connection tally of protocol violations.

use tracing::warn;

/// Strikes allowed at threshold 0; the configured threshold (1..=5) is
/// subtracted from this.
const STRIKE_BUDGET: u32 = 10;

/// Counts malformed, unauthorized and unreadable messages on one session.
///
/// The count only ever grows: valid traffic between violations does not
/// earn anything back.
#[derive(Debug, Default)]
pub struct SafetyCounter {
    strikes: u32,
}

impl SafetyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one violation and returns `true` when the session must be
    /// closed, i.e. once the count exceeds `10 - safety_threshold`.
    pub fn strike(&mut self, safety_threshold: u8, reason: &str) -> bool {
        self.strikes += 1;
        let allowed = STRIKE_BUDGET.saturating_sub(u32::from(safety_threshold));
        warn!(strikes = self.strikes, allowed, reason, "unsafe message");
        self.strikes > allowed
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strike_threshold_five_disconnects_on_sixth() {
        // Arrange
        let mut counter = SafetyCounter::new();

        // Act
        let verdicts: Vec<bool> = (0..6).map(|_| counter.strike(5, "test")).collect();

        // Assert
        assert_eq!(verdicts, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn test_strike_threshold_one_allows_nine() {
        let mut counter = SafetyCounter::new();
        for _ in 0..9 {
            assert!(!counter.strike(1, "test"));
        }
        assert!(counter.strike(1, "test"));
        assert_eq!(counter.strikes(), 10);
    }

    #[test]
    fn test_strike_uses_threshold_current_at_call_time() {
        let mut counter = SafetyCounter::new();
        for _ in 0..6 {
            counter.strike(1, "test");
        }
        // Tightened mid-session: 7 > 10 - 5.
        assert!(counter.strike(5, "test"));
    }
}
