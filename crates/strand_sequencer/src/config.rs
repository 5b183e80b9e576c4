//! Configuration snapshots consumed by the background activator.
//!
//! Three independently versioned snapshots: the cluster configuration
//! (per-log attributes plus cluster-wide flags), the nodes configuration
//! (sequencer and storage membership), and the worker settings. Snapshots
//! are immutable once published; `ConfigHandle` swaps whole `Arc`s so
//! readers never observe a half-updated view.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{LogId, NodeId};

/// Per-log attributes from the logs configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAttributes {
    pub replication_factor: usize,
    /// Target nodeset size; defaults to the replication factor when unset.
    pub nodeset_size: Option<usize>,
    /// Seed fed to the nodeset selector. Changing it reshuffles the nodeset.
    pub nodeset_seed: Option<u64>,
    /// Sliding-window size for the log's epoch sequencers.
    pub max_writes_in_flight: usize,
    pub tail_optimized: bool,
}

impl LogAttributes {
    pub fn with_replication(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            nodeset_size: None,
            nodeset_seed: None,
            max_writes_in_flight: 256,
            tail_optimized: false,
        }
    }
}

/// Cluster configuration snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u64,
    pub my_node_id: NodeId,
    /// When set, sequencers keep the epoch store up to date themselves and
    /// the activator may issue metadata updates and reactivations.
    pub sequencers_provision_epoch_store: bool,
    pub logs: BTreeMap<LogId, LogAttributes>,
}

impl ClusterConfig {
    pub fn log_attributes(&self, log_id: LogId) -> Option<&LogAttributes> {
        self.logs.get(&log_id)
    }
}

/// Cluster membership snapshot: which nodes may sequence and which store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodesConfiguration {
    pub version: u64,
    pub sequencer_nodes: BTreeSet<NodeId>,
    pub storage_nodes: BTreeSet<NodeId>,
}

impl NodesConfiguration {
    pub fn is_sequencing_enabled(&self, node_id: NodeId) -> bool {
        self.sequencer_nodes.contains(&node_id)
    }
}

/// Worker settings re-read on every queue pump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Budget limit for concurrent background activations per worker.
    pub max_sequencer_background_activations_in_flight: usize,
    /// Default retry-timer interval after a transient failure.
    pub sequencer_background_activation_retry_interval: Duration,
    /// Passed through to nodeset-selection; flipping it triggers a
    /// params-only metadata update.
    pub epoch_metadata_use_new_storage_set_format: bool,
    /// Grace given to a draining epoch before it is reaped; part of the
    /// immutable epoch-sequencer options.
    pub sequencer_draining_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_sequencer_background_activations_in_flight: 16,
            sequencer_background_activation_retry_interval: Duration::from_secs(10),
            epoch_metadata_use_new_storage_set_format: false,
            sequencer_draining_grace: Duration::from_secs(1),
        }
    }
}

/// Shared handle publishing the three snapshots to all workers.
#[derive(Debug)]
pub struct ConfigHandle {
    cluster: RwLock<Arc<ClusterConfig>>,
    nodes: RwLock<Arc<NodesConfiguration>>,
    settings: RwLock<Arc<Settings>>,
}

impl ConfigHandle {
    pub fn new(cluster: ClusterConfig, nodes: NodesConfiguration, settings: Settings) -> Self {
        Self {
            cluster: RwLock::new(Arc::new(cluster)),
            nodes: RwLock::new(Arc::new(nodes)),
            settings: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn cluster(&self) -> Arc<ClusterConfig> {
        self.cluster.read().unwrap().clone()
    }

    pub fn nodes(&self) -> Arc<NodesConfiguration> {
        self.nodes.read().unwrap().clone()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.read().unwrap().clone()
    }

    pub fn set_cluster(&self, cluster: ClusterConfig) {
        *self.cluster.write().unwrap() = Arc::new(cluster);
    }

    pub fn set_nodes(&self, nodes: NodesConfiguration) {
        *self.nodes.write().unwrap() = Arc::new(nodes);
    }

    pub fn set_settings(&self, settings: Settings) {
        *self.settings.write().unwrap() = Arc::new(settings);
    }

    /// Apply an in-place edit to the cluster config, bumping its version.
    pub fn update_cluster(&self, edit: impl FnOnce(&mut ClusterConfig)) {
        let mut next = (*self.cluster()).clone();
        edit(&mut next);
        next.version += 1;
        self.set_cluster(next);
    }

    /// Apply an in-place edit to the settings.
    pub fn update_settings(&self, edit: impl FnOnce(&mut Settings)) {
        let mut next = (*self.settings()).clone();
        edit(&mut next);
        self.set_settings(next);
    }
}
