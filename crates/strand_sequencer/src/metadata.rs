//! Epoch metadata and nodeset selection.
//!
//! `EpochMetaData` is the per-epoch record stored in the epoch store and,
//! eventually, in the log's metadata log: the storage set an epoch writes
//! to, its replication factor, and the selection parameters the nodeset was
//! derived from. `update_metadata_if_needed` recomputes a candidate record
//! against the current configuration and reports whether anything changed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, LogAttributes, NodesConfiguration};
use crate::types::{Epoch, LogId, NodeId, Status, EPOCH_INVALID};

/// Sorted set of storage nodes an epoch writes to.
pub type StorageSet = Vec<NodeId>;

/// Parameters the nodeset was selected from. Stored alongside the nodeset
/// so a selector re-run can tell "same inputs" from "same output".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSetParams {
    pub seed: u64,
    pub target_size: usize,
    /// Storage-set serialization format the record was written with.
    pub format_version: u8,
}

impl std::fmt::Display for NodeSetParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(seed={},size={},fmt={})",
            self.seed, self.target_size, self.format_version
        )
    }
}

/// Per-epoch configuration for one log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochMetaData {
    pub epoch: Epoch,
    pub nodeset: StorageSet,
    pub replication_factor: usize,
    pub nodeset_params: NodeSetParams,
    /// Set once the record has been persisted into the log's metadata log.
    /// Reprovisioning must wait for it.
    pub written_in_metadata_log: bool,
    pub disabled: bool,
}

impl EpochMetaData {
    pub fn new(epoch: Epoch, nodeset: StorageSet, replication_factor: usize) -> Self {
        Self {
            epoch,
            nodeset,
            replication_factor,
            nodeset_params: NodeSetParams::default(),
            written_in_metadata_log: false,
            disabled: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.epoch == EPOCH_INVALID || self.nodeset.is_empty()
    }
}

impl std::fmt::Display for EpochMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} nodeset={:?} r={} params={}{}]",
            self.epoch,
            self.nodeset,
            self.replication_factor,
            self.nodeset_params,
            if self.written_in_metadata_log { "" } else { " unwritten" },
        )
    }
}

/// Policy flags for `update_metadata_if_needed`.
#[derive(Clone, Copy, Debug)]
pub struct UpdateOptions {
    pub use_new_storage_set_format: bool,
    pub provision_if_empty: bool,
    pub update_if_exists: bool,
    pub force_update: bool,
}

/// Result of considering a metadata update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateResult {
    Unchanged,
    Updated { only_nodeset_params_changed: bool },
    Failed(Status),
}

/// Chooses the storage set for a log out of the current storage membership.
///
/// Implementations must be deterministic in their inputs: the activator
/// re-runs the selector on a freshly selected candidate and cancels the
/// update if the second run is not a fixpoint.
pub trait NodeSetSelector: Send + Sync + 'static {
    fn select(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        nodes: &NodesConfiguration,
        seed: u64,
    ) -> Result<StorageSet, Status>;
}

/// Default selector: rendezvous hashing of `(log, seed, node)` over the
/// storage membership, keeping the highest-scoring nodes.
#[derive(Debug, Default)]
pub struct RendezvousNodeSetSelector;

impl NodeSetSelector for RendezvousNodeSetSelector {
    fn select(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        nodes: &NodesConfiguration,
        seed: u64,
    ) -> Result<StorageSet, Status> {
        if attrs.replication_factor == 0 {
            return Err(Status::Failed);
        }
        if nodes.storage_nodes.len() < attrs.replication_factor {
            return Err(Status::Failed);
        }

        let size = target_nodeset_size(attrs).min(nodes.storage_nodes.len());
        let mut scored: Vec<(u64, NodeId)> = nodes
            .storage_nodes
            .iter()
            .map(|&node| (placement_score(log_id, seed, node), node))
            .collect();
        scored.sort_unstable_by(|a, b| b.cmp(a));
        scored.truncate(size);

        let mut nodeset: StorageSet = scored.into_iter().map(|(_, node)| node).collect();
        nodeset.sort_unstable();
        Ok(nodeset)
    }
}

pub fn target_nodeset_size(attrs: &LogAttributes) -> usize {
    attrs
        .nodeset_size
        .unwrap_or(attrs.replication_factor)
        .max(attrs.replication_factor)
}

fn placement_score(log_id: LogId, seed: u64, node: NodeId) -> u64 {
    let mut hasher = DefaultHasher::new();
    (log_id.0, seed, node).hash(&mut hasher);
    hasher.finish()
}

/// Recompute `metadata` against the current configuration.
///
/// The caller passes a candidate record (typically the sequencer's current
/// metadata with the epoch already bumped); on `Updated` the candidate has
/// been rewritten in place. `only_nodeset_params_changed` distinguishes a
/// cheap params-only epoch-store write from a change that needs a full
/// sequencer reactivation.
pub fn update_metadata_if_needed(
    log_id: LogId,
    metadata: &mut EpochMetaData,
    cluster: &ClusterConfig,
    nodes: &NodesConfiguration,
    selector: &dyn NodeSetSelector,
    options: &UpdateOptions,
) -> UpdateResult {
    let Some(attrs) = cluster.log_attributes(log_id) else {
        return UpdateResult::Failed(Status::NotFound);
    };

    if metadata.is_empty() {
        if !options.provision_if_empty {
            return UpdateResult::Failed(Status::Empty);
        }
    } else if !options.update_if_exists {
        return UpdateResult::Unchanged;
    }

    let seed = attrs.nodeset_seed.unwrap_or(0);
    let nodeset = match selector.select(log_id, attrs, nodes, seed) {
        Ok(nodeset) => nodeset,
        Err(status) => return UpdateResult::Failed(status),
    };
    let params = NodeSetParams {
        seed,
        target_size: target_nodeset_size(attrs),
        format_version: options.use_new_storage_set_format as u8,
    };

    let nodeset_changed = nodeset != metadata.nodeset
        || attrs.replication_factor != metadata.replication_factor
        || metadata.is_empty();
    let params_changed = params != metadata.nodeset_params;

    if nodeset_changed || options.force_update {
        metadata.nodeset = nodeset;
        metadata.replication_factor = attrs.replication_factor;
        metadata.nodeset_params = params;
        // A new nodeset has not been written to the metadata log yet.
        metadata.written_in_metadata_log = false;
        return UpdateResult::Updated {
            only_nodeset_params_changed: false,
        };
    }

    if params_changed {
        metadata.nodeset_params = params;
        return UpdateResult::Updated {
            only_nodeset_params_changed: true,
        };
    }

    UpdateResult::Unchanged
}
