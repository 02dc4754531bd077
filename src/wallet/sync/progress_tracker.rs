//! Progress tracking for gap-limit address recovery.
//!
//! `RecoveryTracker` owns the termination rule of a recovery run. It knows the
//! start index, the lookahead, the highest used index seen so far (observed or
//! hinted) and how far scanning has progressed. From that it computes the
//! exclusive scan limit: with a frontier `u` the run must classify every index
//! up to `u + lookahead` and never go past it; with no usage at all it scans
//! exactly `lookahead` indices from the start.

use tracing::info;

/// Indices between two progress log lines.
const LOG_INTERVAL: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    start_index: u64,
    lookahead: u64,
    /// Last used index known before the run (cached state)
    hint: Option<u64>,
    /// Highest used index observed or already known to the store
    highest_observed: Option<u64>,
    /// Exclusive end of the classified range
    scanned_through: u64,
    batches: usize,
    used_found: usize,
    last_logged_index: u64,
}

impl RecoveryTracker {
    pub fn new(start_index: u64, lookahead: u64, hint: Option<u64>) -> Self {
        Self {
            start_index,
            lookahead,
            hint,
            highest_observed: None,
            scanned_through: start_index,
            batches: 0,
            used_found: 0,
            last_logged_index: start_index,
        }
    }

    /// Highest used index known so far, hint included.
    pub fn frontier(&self) -> Option<u64> {
        match (self.hint, self.highest_observed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Exclusive upper bound of indices this run may classify.
    pub fn limit(&self) -> u64 {
        match self.frontier() {
            Some(used) if used.saturating_add(1) >= self.start_index => {
                used.saturating_add(self.lookahead).saturating_add(1)
            }
            _ => self.start_index.saturating_add(self.lookahead),
        }
    }

    pub fn scanned_through(&self) -> u64 {
        self.scanned_through
    }

    pub fn is_complete(&self) -> bool {
        self.scanned_through >= self.limit()
    }

    /// Record a used index. `newly_found` is false for indices the store already knew.
    pub fn record_used(&mut self, index: u64, newly_found: bool) {
        self.highest_observed = Some(self.highest_observed.map_or(index, |h| h.max(index)));
        if newly_found {
            self.used_found += 1;
        }
    }

    /// Record that every index below `end` has been classified.
    pub fn record_batch(&mut self, end: u64) {
        self.scanned_through = self.scanned_through.max(end);
        self.batches += 1;
    }

    /// Log progress at regular intervals or when forced
    pub fn log_progress(&mut self, force: bool) {
        let since_last_log = self.scanned_through.saturating_sub(self.last_logged_index);
        if force || since_last_log >= LOG_INTERVAL {
            info!(
                "Recovery progress: scanned {}..{}, {} used addresses found, highest used {:?}",
                self.start_index,
                self.scanned_through,
                self.used_found,
                self.frontier()
            );
            self.last_logged_index = self.scanned_through;
        }
    }

    pub fn get_stats(&self) -> RecoveryStats {
        RecoveryStats {
            start_index: self.start_index,
            scanned_through: self.scanned_through,
            highest_used_index: self.frontier(),
            batches: self.batches,
            used_found: self.used_found,
        }
    }
}

/// Statistics about one recovery run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    pub start_index: u64,
    pub scanned_through: u64,
    pub highest_used_index: Option<u64>,
    pub batches: usize,
    pub used_found: usize,
}

impl RecoveryStats {
    /// Get a human-readable summary of the recovery statistics
    pub fn summary(&self) -> String {
        format!(
            "Recovered {}..{} in {} batches: {} new used addresses, highest used {}",
            self.start_index,
            self.scanned_through,
            self.batches,
            self.used_found,
            match self.highest_used_index {
                Some(index) => index.to_string(),
                None => "none".to_string(),
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_without_usage_is_one_lookahead_from_start() {
        let tracker = RecoveryTracker::new(0, 20, None);
        assert_eq!(tracker.limit(), 20);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn limit_follows_frontier() {
        let mut tracker = RecoveryTracker::new(0, 20, None);
        tracker.record_used(7, true);
        assert_eq!(tracker.frontier(), Some(7));
        assert_eq!(tracker.limit(), 28);

        tracker.record_batch(28);
        assert!(tracker.is_complete());
    }

    #[test]
    fn hint_extends_limit_past_start() {
        let tracker = RecoveryTracker::new(15_000, 25_000, Some(40_000));
        assert_eq!(tracker.limit(), 65_001);
    }

    #[test]
    fn stale_hint_below_start_is_ignored_for_limit() {
        let tracker = RecoveryTracker::new(5_000, 100, Some(10));
        assert_eq!(tracker.limit(), 5_100);
    }

    #[test]
    fn stats_summary_mentions_highest() {
        let mut tracker = RecoveryTracker::new(0, 10, None);
        tracker.record_used(3, true);
        tracker.record_batch(10);
        let stats = tracker.get_stats();
        assert_eq!(stats.used_found, 1);
        assert!(stats.summary().contains("highest used 3"));
    }
}
