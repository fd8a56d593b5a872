//! LETHE - Read epochs
//!
//! Readers pin the current epoch before they consult the LSM index. Marking
//! a blob file obsolete advances the epoch, so a file obsoleted at epoch E
//! can be reclaimed once every pin taken at or before E has been released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct EpochTracker {
    current: AtomicU64,
    /// Epoch -> number of live pins.
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl EpochTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the current epoch until the guard is dropped.
    pub fn pin(&self) -> EpochGuard<'_> {
        let mut pins = self.pins.lock();
        let epoch = self.current.load(Ordering::SeqCst);
        *pins.entry(epoch).or_insert(0) += 1;
        EpochGuard {
            tracker: self,
            epoch,
        }
    }

    /// Close the current epoch and return it.
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    /// True if no reader pinned at or before `epoch` is still active.
    pub fn is_reclaimable(&self, epoch: u64) -> bool {
        let pins = self.pins.lock();
        match pins.keys().next() {
            Some(&oldest) => oldest > epoch,
            None => true,
        }
    }

    fn unpin(&self, epoch: u64) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&epoch);
            }
        }
    }
}

/// Active read pin; see [`EpochTracker::pin`].
#[derive(Debug)]
pub struct EpochGuard<'a> {
    tracker: &'a EpochTracker,
    epoch: u64,
}

impl EpochGuard<'_> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.tracker.unpin(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_blocks_reclaim_of_later_obsolete() {
        let tracker = EpochTracker::new();
        let guard = tracker.pin();
        let obsoleted_at = tracker.advance();
        assert_eq!(guard.epoch(), obsoleted_at);
        assert!(!tracker.is_reclaimable(obsoleted_at));
        drop(guard);
        assert!(tracker.is_reclaimable(obsoleted_at));
    }

    #[test]
    fn test_new_pins_do_not_block_older_epochs() {
        let tracker = EpochTracker::new();
        let obsoleted_at = tracker.advance();
        let _late = tracker.pin();
        assert!(tracker.is_reclaimable(obsoleted_at));
    }

    #[test]
    fn test_nested_pins_same_epoch() {
        let tracker = EpochTracker::new();
        let a = tracker.pin();
        let b = tracker.pin();
        let epoch = tracker.advance();
        drop(a);
        assert!(!tracker.is_reclaimable(epoch));
        drop(b);
        assert!(tracker.is_reclaimable(epoch));
    }
}
