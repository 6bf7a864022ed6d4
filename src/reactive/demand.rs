use std::sync::atomic::{AtomicU64, Ordering};

/// Demand value that means "no limit". Once reached it is never decremented.
pub const UNBOUNDED: u64 = u64::MAX;

/// Outstanding pull-credits granted to a producer but not yet fulfilled.
///
/// The counter is shared between the thread that requests (subscription side) and the thread
/// that delivers (transport side). It saturates at [`UNBOUNDED`] and never goes below zero: a
/// delivery without credit is reported to the caller instead of wrapping.
#[derive(Debug, Default)]
pub struct DemandCounter {
    outstanding: AtomicU64,
}

impl DemandCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current outstanding credit.
    pub fn current(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Add `n` credits, saturating at [`UNBOUNDED`]. Returns the credit held *before* the add,
    /// so a caller that sees zero knows it is the one that has to start draining.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n);
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Consume one credit for a delivery. Returns `false` when there was no credit to consume.
    pub fn try_take(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
                0 => None,
                UNBOUNDED => Some(UNBOUNDED),
                n => Some(n - 1),
            })
            .is_ok()
    }

    /// Record that `emitted` elements were delivered against the credit and return what is left.
    /// `emitted` is capped at the current credit.
    pub fn produced(&self, emitted: u64) -> u64 {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current - emitted.min(current);
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move from zero to `n` credits, failing if any credit is still outstanding.
    ///
    /// Two parties racing to refill an exhausted counter use this so only one of them issues the
    /// corresponding upstream request.
    pub fn refill_if_empty(&self, n: u64) -> bool {
        self.outstanding
            .compare_exchange(0, n, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop all outstanding credit, returning what was held.
    pub fn clear(&self) -> u64 {
        self.outstanding.swap(0, Ordering::AcqRel)
    }
}
