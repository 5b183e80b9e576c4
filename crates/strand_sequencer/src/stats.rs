//! Background-activation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-processor counters for sequencer background activation. Names are
/// stable; operators alert on them.
#[derive(Debug, Default)]
pub struct SequencerStats {
    background_sequencer_reactivations_scheduled: AtomicU64,
    background_sequencer_reactivations_completed: AtomicU64,
    sequencer_reactivations_for_metadata_update: AtomicU64,
    metadata_updates_without_sequencer_reactivation: AtomicU64,
}

impl SequencerStats {
    pub fn bump_scheduled(&self, count: u64) {
        self.background_sequencer_reactivations_scheduled
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn bump_completed(&self, count: u64) {
        self.background_sequencer_reactivations_completed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn bump_reactivations_for_metadata_update(&self) {
        self.sequencer_reactivations_for_metadata_update
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_metadata_updates_without_reactivation(&self) {
        self.metadata_updates_without_sequencer_reactivation
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scheduled: self
                .background_sequencer_reactivations_scheduled
                .load(Ordering::Relaxed),
            completed: self
                .background_sequencer_reactivations_completed
                .load(Ordering::Relaxed),
            reactivations_for_metadata_update: self
                .sequencer_reactivations_for_metadata_update
                .load(Ordering::Relaxed),
            metadata_updates_without_reactivation: self
                .metadata_updates_without_sequencer_reactivation
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scheduled: u64,
    pub completed: u64,
    pub reactivations_for_metadata_update: u64,
    pub metadata_updates_without_reactivation: u64,
}
