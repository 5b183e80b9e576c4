//! Bounded budget for in-flight background activations.
//!
//! The budget hands out RAII tokens. A token released on drop returns its
//! slot no matter which thread drops it; acquisition happens only on the
//! owning worker, so no compare-and-swap loop is needed there.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counting budget of concurrent activations. Resizable at runtime; the
/// limit may shrink below the in-flight count, in which case new acquires
/// fail until outstanding tokens drain.
#[derive(Debug)]
pub struct ActivationBudget {
    limit: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ActivationBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight())
    }

    /// Take one slot. Fails when the budget is exhausted.
    pub fn acquire(&self) -> Option<ActivationToken> {
        if self.in_flight() >= self.limit {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(ActivationToken {
            in_flight: Some(self.in_flight.clone()),
        })
    }
}

/// One slot of an `ActivationBudget`.
///
/// Movable, not clonable. The slot is returned on `release` or on drop,
/// whichever comes first; releasing twice is a no-op. Moving the token into
/// a sequencer transfers the slot with it.
#[derive(Debug)]
pub struct ActivationToken {
    in_flight: Option<Arc<AtomicUsize>>,
}

impl ActivationToken {
    pub fn valid(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn release(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let previous = in_flight.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "activation token released below zero");
        }
    }
}

impl Drop for ActivationToken {
    fn drop(&mut self) {
        self.release();
    }
}
