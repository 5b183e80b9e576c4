//! Shared helpers for integration tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_sequencer::{
    request_snapshot, update_metadata_if_needed, ActivatorSnapshot, ClusterConfig, ConfigHandle,
    Epoch, EpochMetaData, InMemoryEpochStore, LogAttributes, LogId, NodeId, NodeSetSelector,
    NodesConfiguration, Processor, Sequencer, Settings, StatsSnapshot, StorageSet, UpdateOptions,
    UpdateResult,
};

/// Upper bound for every polling wait in the suite.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn attrs(replication_factor: usize) -> LogAttributes {
    LogAttributes::with_replication(replication_factor)
}

pub struct TestClusterBuilder {
    worker_count: usize,
    my_node_id: NodeId,
    sequencer_nodes: Vec<NodeId>,
    storage_nodes: Vec<NodeId>,
    provision_epoch_store: bool,
    settings: Settings,
    logs: Vec<(LogId, LogAttributes)>,
    selector: Option<Arc<dyn NodeSetSelector>>,
}

impl TestClusterBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn log(mut self, log_id: LogId, attrs: LogAttributes) -> Self {
        self.logs.push((log_id, attrs));
        self
    }

    pub fn selector(mut self, selector: Arc<dyn NodeSetSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn storage_nodes(mut self, nodes: &[NodeId]) -> Self {
        self.storage_nodes = nodes.to_vec();
        self
    }

    pub fn provision_epoch_store(mut self, enabled: bool) -> Self {
        self.provision_epoch_store = enabled;
        self
    }

    pub fn build(self) -> TestCluster {
        init_tracing();
        let cluster = ClusterConfig {
            version: 1,
            my_node_id: self.my_node_id,
            sequencers_provision_epoch_store: self.provision_epoch_store,
            logs: self.logs.into_iter().collect(),
        };
        let nodes = NodesConfiguration {
            version: 1,
            sequencer_nodes: self.sequencer_nodes.iter().copied().collect(),
            storage_nodes: self.storage_nodes.iter().copied().collect(),
        };
        let config = Arc::new(ConfigHandle::new(cluster, nodes, self.settings));
        let store = Arc::new(InMemoryEpochStore::new());
        let processor = match self.selector {
            Some(selector) => {
                Processor::with_selector(self.worker_count, config.clone(), store.clone(), selector)
            }
            None => Processor::new(self.worker_count, config.clone(), store.clone()),
        }
        .expect("processor construction");
        TestCluster {
            processor,
            store,
            config,
        }
    }
}

pub struct TestCluster {
    pub processor: Arc<Processor>,
    pub store: Arc<InMemoryEpochStore>,
    pub config: Arc<ConfigHandle>,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder {
            worker_count: 4,
            my_node_id: 1,
            sequencer_nodes: vec![1, 2],
            storage_nodes: vec![1, 2, 3, 4],
            provision_epoch_store: true,
            settings: Settings::default(),
            logs: Vec::new(),
            selector: None,
        }
    }

    /// Register an active sequencer whose metadata matches the current
    /// configuration, with the same record installed in the epoch store.
    pub fn add_active_log(&self, log_id: LogId, epoch: Epoch) -> Arc<Sequencer> {
        self.add_log_with_written_flag(log_id, epoch, true)
    }

    /// Same, but the record has not reached the metadata log yet.
    pub fn add_active_log_unwritten(&self, log_id: LogId, epoch: Epoch) -> Arc<Sequencer> {
        self.add_log_with_written_flag(log_id, epoch, false)
    }

    fn add_log_with_written_flag(
        &self,
        log_id: LogId,
        epoch: Epoch,
        written: bool,
    ) -> Arc<Sequencer> {
        let cluster = self.config.cluster();
        let nodes = self.config.nodes();
        let settings = self.config.settings();
        let options = UpdateOptions {
            use_new_storage_set_format: settings.epoch_metadata_use_new_storage_set_format,
            provision_if_empty: true,
            update_if_exists: true,
            force_update: false,
        };

        let mut metadata = EpochMetaData::new(epoch, vec![], 0);
        let result = update_metadata_if_needed(
            log_id,
            &mut metadata,
            &cluster,
            &nodes,
            self.processor.nodeset_selector().as_ref(),
            &options,
        );
        assert!(
            matches!(result, UpdateResult::Updated { .. }),
            "provisioning metadata for {log_id}: {result:?}"
        );
        metadata.written_in_metadata_log = written;

        self.store.provision(log_id, metadata.clone());
        self.processor
            .all_sequencers()
            .insert_active(log_id, metadata)
            .expect("sequencer registration")
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.processor.stats().snapshot()
    }

    pub async fn snapshot(&self) -> ActivatorSnapshot {
        request_snapshot(&self.processor)
            .await
            .expect("activator snapshot")
    }

    pub async fn wait_for_stats(&self, what: &str, check: impl Fn(StatsSnapshot) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let stats = self.stats();
            if check(stats) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {what}; stats: {stats:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_snapshot(&self, what: &str, check: impl Fn(ActivatorSnapshot) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let snapshot = self.snapshot().await;
            if check(snapshot) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {what}; snapshot: {snapshot:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the pending queue is drained and no operation is in
    /// flight.
    pub async fn wait_idle(&self) {
        self.wait_for_snapshot("activator to go idle", |s| s.queued == 0 && s.in_flight == 0)
            .await;
    }

    /// Remove `node` from the sequencer membership.
    pub fn drop_sequencer_node(&self, node: NodeId) {
        let current = self.config.nodes();
        let mut sequencer_nodes: BTreeSet<NodeId> = current.sequencer_nodes.clone();
        sequencer_nodes.remove(&node);
        self.config.set_nodes(NodesConfiguration {
            version: current.version + 1,
            sequencer_nodes,
            storage_nodes: current.storage_nodes.clone(),
        });
    }

    /// Replace the storage membership wholesale.
    pub fn set_storage_nodes(&self, nodes: &[NodeId]) {
        let current = self.config.nodes();
        self.config.set_nodes(NodesConfiguration {
            version: current.version + 1,
            sequencer_nodes: current.sequencer_nodes.clone(),
            storage_nodes: nodes.iter().copied().collect(),
        });
    }
}

/// Selector that returns a different nodeset on every call. Used to drive
/// the unstable-selector cancellation path.
pub struct RotatingSelector {
    sets: Vec<StorageSet>,
    calls: AtomicUsize,
}

impl RotatingSelector {
    pub fn new(sets: Vec<StorageSet>) -> Self {
        assert!(!sets.is_empty());
        Self {
            sets,
            calls: AtomicUsize::new(0),
        }
    }
}

impl NodeSetSelector for RotatingSelector {
    fn select(
        &self,
        _log_id: LogId,
        _attrs: &LogAttributes,
        _nodes: &NodesConfiguration,
        _seed: u64,
    ) -> Result<StorageSet, strand_sequencer::Status> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.sets[call % self.sets.len()].clone())
    }
}

/// Selector that burns wall-clock time on every call, to push a pump past
/// its time slice.
pub struct SlowSelector<S> {
    pub inner: S,
    pub delay: Duration,
}

impl<S: NodeSetSelector> NodeSetSelector for SlowSelector<S> {
    fn select(
        &self,
        log_id: LogId,
        attrs: &LogAttributes,
        nodes: &NodesConfiguration,
        seed: u64,
    ) -> Result<StorageSet, strand_sequencer::Status> {
        std::thread::sleep(self.delay);
        self.inner.select(log_id, attrs, nodes, seed)
    }
}
