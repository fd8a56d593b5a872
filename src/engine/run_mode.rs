//! LETHE - Run mode controller

use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::RunMode;

/// Engine-wide [`RunMode`], switchable at any time from any thread.
#[derive(Debug)]
pub struct RunModeController {
    mode: AtomicU8,
}

impl RunModeController {
    pub fn new(initial: RunMode) -> Self {
        Self {
            mode: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> RunMode {
        // Only valid discriminants are ever stored.
        RunMode::from_u8(self.mode.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Switch modes and return the previous one.
    pub fn set(&self, mode: RunMode) -> RunMode {
        let previous = RunMode::from_u8(self.mode.swap(mode as u8, Ordering::AcqRel))
            .unwrap_or_default();
        if previous != mode {
            log::info!("blob run mode {:?} -> {:?}", previous, mode);
        }
        previous
    }

    pub fn is_fallback(&self) -> bool {
        self.get() == RunMode::Fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_modes() {
        let controller = RunModeController::new(RunMode::Normal);
        assert!(controller.get().allows_blob_writes());
        assert_eq!(controller.set(RunMode::Fallback), RunMode::Normal);
        assert!(controller.is_fallback());
        assert_eq!(controller.set(RunMode::ReadOnly), RunMode::Fallback);
        assert!(!controller.get().allows_blob_writes());
    }
}
