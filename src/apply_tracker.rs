//! Tracks which action indices of the current message have been applied, so
//! re-parses and re-renders never re-apply a mutation. The epoch counter makes
//! resets observable: async work started before a reset compares epochs on
//! completion and discards its result when they differ.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct ApplyTracker {
    applied: HashSet<usize>,
    epoch: u64,
}

impl ApplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Clear applied marks and invalidate all in-flight work.
    pub fn reset(&mut self) {
        self.applied.clear();
        self.epoch += 1;
    }

    pub fn is_applied(&self, index: usize) -> bool {
        self.applied.contains(&index)
    }

    pub fn mark_applied(&mut self, index: usize) {
        self.applied.insert(index);
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_is_idempotent() {
        let mut tracker = ApplyTracker::new();
        tracker.mark_applied(3);
        tracker.mark_applied(3);
        assert!(tracker.is_applied(3));
        assert_eq!(tracker.applied_count(), 1);
    }

    #[test]
    fn reset_clears_marks_and_bumps_epoch() {
        let mut tracker = ApplyTracker::new();
        tracker.mark_applied(0);
        let epoch = tracker.epoch();

        tracker.reset();

        assert!(!tracker.is_applied(0));
        assert_eq!(tracker.applied_count(), 0);
        assert_eq!(tracker.epoch(), epoch + 1);
    }
}
