//! Process-wide scheduling signals.
//!
//! Only the read stage writes these; every scheduler reads them between
//! steps. Sets are swapped as immutable snapshots so a scheduling decision
//! always sees a consistent pair.
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;

#[derive(Debug, Default)]
pub struct Signals {
    /// Versions to drop at the next scheduling point. Grows monotonically.
    cancel: ArcSwap<HashSet<u64>>,
    /// Versions rotating on the task FIFOs until resumed.
    pause: ArcSwap<HashSet<u64>>,
    /// Versions strictly below this are treated as cancelled.
    stop: AtomicU64,
    /// Raised once on stdin EOF; feedback producers stop re-injecting.
    shutdown: AtomicBool,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one control line's scheduling sets:
    /// cancel accumulates, pause accumulates minus cancel and resume.
    pub fn update(&self, cancel: &[u64], pause: &[u64], resume: &[u64]) {
        if !cancel.is_empty() {
            let mut next: HashSet<u64> = (**self.cancel.load()).clone();
            next.extend(cancel.iter().copied());
            self.cancel.store(Arc::new(next));
        }
        if !cancel.is_empty() || !pause.is_empty() || !resume.is_empty() {
            let mut next: HashSet<u64> = (**self.pause.load()).clone();
            next.extend(pause.iter().copied());
            for version in cancel.iter().chain(resume) {
                next.remove(version);
            }
            self.pause.store(Arc::new(next));
        }
    }

    /// Raises the stop watermark; versions below it are dropped everywhere.
    pub fn halt_below(&self, version: u64) {
        self.stop.fetch_max(version, Ordering::Relaxed);
    }

    pub fn cancelled(&self, version: u64) -> bool {
        version < self.stop.load(Ordering::Relaxed) || self.cancel.load().contains(&version)
    }

    pub fn paused(&self, version: u64) -> bool {
        self.pause.load().contains(&version)
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_accumulates() {
        let signals = Signals::new();
        signals.update(&[1], &[], &[]);
        signals.update(&[2], &[], &[]);
        assert!(signals.cancelled(1));
        assert!(signals.cancelled(2));
        assert!(!signals.cancelled(3));
    }

    #[test]
    fn test_pause_and_resume() {
        let signals = Signals::new();
        signals.update(&[], &[4], &[]);
        assert!(signals.paused(4));
        signals.update(&[], &[], &[4]);
        assert!(!signals.paused(4));
    }

    #[test]
    fn test_cancel_implies_unpause() {
        let signals = Signals::new();
        signals.update(&[], &[4], &[]);
        signals.update(&[4], &[], &[]);
        assert!(!signals.paused(4));
        assert!(signals.cancelled(4));
    }

    #[test]
    fn test_pause_minus_cancel_in_one_update() {
        let signals = Signals::new();
        // a line can pause and cancel in the same message; cancel wins
        signals.update(&[7], &[7], &[]);
        assert!(!signals.paused(7));
        assert!(signals.cancelled(7));
    }

    #[test]
    fn test_stop_watermark() {
        let signals = Signals::new();
        signals.halt_below(10);
        assert!(signals.cancelled(9));
        assert!(!signals.cancelled(10));
        // watermark never lowers
        signals.halt_below(5);
        assert!(signals.cancelled(9));
    }

    #[test]
    fn test_shutdown_flag() {
        let signals = Signals::new();
        assert!(!signals.is_shut_down());
        signals.shut_down();
        assert!(signals.is_shut_down());
    }
}
