use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::RelayId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintableError {
    StreamReset,
    ProtocolAnomaly,
    ConsensusFlagged,
}

impl fmt::Display for FingerprintableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FingerprintableError::StreamReset => "stream reset",
            FingerprintableError::ProtocolAnomaly => "protocol anomaly",
            FingerprintableError::ConsensusFlagged => "consensus-flagged guard",
        };
        f.write_str(name)
    }
}

/// A container's pinned entry guard and its recent fingerprintable failures.
#[derive(Debug, Clone)]
pub struct GuardPin {
    guard: RelayId,
    failures: VecDeque<Instant>,
}

impl GuardPin {
    pub fn new(guard: RelayId) -> Self {
        Self {
            guard,
            failures: VecDeque::new(),
        }
    }

    pub fn guard(&self) -> &RelayId {
        &self.guard
    }

    /// Records one failure and reports whether `threshold` failures now fall
    /// inside `window`. The history is cleared when it does, so a burst
    /// triggers at most one rotation.
    pub fn record_failure(&mut self, now: Instant, window: Duration, threshold: u32) -> bool {
        self.expire(now, window);
        self.failures.push_back(now);
        if self.failures.len() >= threshold as usize {
            self.failures.clear();
            return true;
        }
        false
    }

    #[cfg(test)]
    fn failures_in_window(&mut self, now: Instant, window: Duration) -> usize {
        self.expire(now, window);
        self.failures.len()
    }

    /// Pins `guard` and forgets all failures recorded against the old one.
    pub fn repin(&mut self, guard: RelayId) -> RelayId {
        self.failures.clear();
        std::mem::replace(&mut self.guard, guard)
    }

    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(600);

    #[test]
    fn threshold_reached_exactly_on_kth_failure() {
        let start = Instant::now();
        let mut pin = GuardPin::new(RelayId::new("guard-1"));
        assert!(!pin.record_failure(start, WINDOW, 3));
        assert!(!pin.record_failure(start + Duration::from_secs(1), WINDOW, 3));
        assert!(pin.record_failure(start + Duration::from_secs(2), WINDOW, 3));
        assert!(!pin.record_failure(start + Duration::from_secs(3), WINDOW, 3));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let start = Instant::now();
        let mut pin = GuardPin::new(RelayId::new("guard-1"));
        pin.record_failure(start, WINDOW, 3);
        pin.record_failure(start + Duration::from_secs(10), WINDOW, 3);
        let later = start + WINDOW + Duration::from_secs(5);
        assert!(!pin.record_failure(later, WINDOW, 3));
        assert_eq!(pin.failures_in_window(later, WINDOW), 2);
    }

    #[test]
    fn repin_clears_history() {
        let start = Instant::now();
        let mut pin = GuardPin::new(RelayId::new("guard-1"));
        pin.record_failure(start, WINDOW, 3);
        pin.record_failure(start, WINDOW, 3);
        let old = pin.repin(RelayId::new("guard-2"));
        assert_eq!(old.as_str(), "guard-1");
        assert_eq!(pin.guard().as_str(), "guard-2");
        assert!(!pin.record_failure(start, WINDOW, 3));
    }
}
