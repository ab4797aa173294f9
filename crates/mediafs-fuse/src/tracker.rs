//! Live-node registry used to catch kernel handles that no longer refer to
//! a tracked node. Lives inside the tree lock.

use crate::node::Ino;
use std::collections::HashSet;

/// Set of live inodes, or nothing when disabled.
#[derive(Debug, Default)]
pub struct NodeTracker {
    enabled: bool,
    live: HashSet<Ino>,
}

impl NodeTracker {
    /// Creates a tracker; a disabled one records nothing.
    pub fn new(enabled: bool) -> Self {
        NodeTracker {
            enabled,
            live: HashSet::new(),
        }
    }

    /// Registers a newly created node.
    pub fn track(&mut self, ino: Ino) {
        if self.enabled && !self.live.insert(ino) {
            tracing::error!("node tracker: inode {} tracked twice", ino);
        }
    }

    /// Unregisters a destroyed node.
    pub fn untrack(&mut self, ino: Ino) {
        if self.enabled && !self.live.remove(&ino) {
            tracing::error!("node tracker: inode {} untracked but was not live", ino);
        }
    }

    /// Returns false when tracking is on and `ino` is not live.
    pub fn check_tracked(&self, ino: Ino) -> bool {
        !self.enabled || self.live.contains(&ino)
    }

    /// Number of live nodes recorded.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_untrack() {
        let mut tracker = NodeTracker::new(true);
        tracker.track(7);
        assert!(tracker.check_tracked(7));
        assert_eq!(tracker.live_count(), 1);
        tracker.untrack(7);
        assert!(!tracker.check_tracked(7));
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_disabled_tracker_accepts_everything() {
        let mut tracker = NodeTracker::new(false);
        tracker.track(3);
        assert!(tracker.check_tracked(3));
        assert!(tracker.check_tracked(999));
        assert_eq!(tracker.live_count(), 0);
    }
}
