//! Background sequencer reconciliation for the strand distributed log.
//!
//! When cluster topology, per-log attributes or nodeset-selection inputs
//! change, each log's running sequencer may need a cheap epoch-store update
//! or a full reactivation (epoch bump and new storage set). The
//! `SequencerBackgroundActivator` decides which, per log, and drives it to
//! completion. In-flight work is bounded by a token budget so the epoch
//! store is never stampeded, the queue pump yields after a time slice so
//! the worker is never monopolised, and a fixpoint check on the nodeset
//! selector keeps an unstable selector from reactivating a log forever.
//!
//! Higher layers interact through two entry points only:
//! [`worker::request_schedule`] when something relevant changed, and
//! [`worker::request_notify_completion`] when a downstream operation
//! finished. Both hop onto the processor's designated worker; all activator
//! state is confined there.

pub mod activator;
pub mod budget;
pub mod config;
pub mod epoch_store;
pub mod metadata;
pub mod sequencer;
pub mod stats;
pub mod types;
pub mod worker;

pub use activator::{ActivatorSnapshot, SequencerBackgroundActivator};
pub use budget::{ActivationBudget, ActivationToken};
pub use config::{ClusterConfig, ConfigHandle, LogAttributes, NodesConfiguration, Settings};
pub use epoch_store::{
    EpochStore, EpochStoreResult, InMemoryEpochStore, MetaDataUpdate, WriteNodeId,
};
pub use metadata::{
    update_metadata_if_needed, EpochMetaData, NodeSetParams, NodeSetSelector,
    RendezvousNodeSetSelector, StorageSet, UpdateOptions, UpdateResult,
};
pub use sequencer::{AllSequencers, EpochSequencerOptions, Sequencer, SequencerState};
pub use stats::{SequencerStats, StatsSnapshot};
pub use types::{Epoch, LogId, NodeId, Status, EPOCH_INVALID, EPOCH_MAX};
pub use worker::{request_notify_completion, request_schedule, request_snapshot, Processor};
