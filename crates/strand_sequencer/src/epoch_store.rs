//! Epoch store: the strongly consistent source of truth for per-log epoch
//! metadata.
//!
//! Writes are conditional on the epoch: a caller proposing epoch `e` only
//! succeeds while the store still holds `e - 1`. A racing activation that
//! moved the store past the candidate surfaces as `Aborted`, carrying the
//! authoritative record so the caller can notice it was preempted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::metadata::{EpochMetaData, NodeSetParams};
use crate::types::{Epoch, LogId, NodeId, Status};

/// Which node id to record as the writer of the epoch-store entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteNodeId {
    /// Keep whatever node wrote the record last.
    KeepLast,
    /// Record the calling node.
    My(NodeId),
}

/// A conditional write against one log's record.
#[derive(Clone, Debug)]
pub enum MetaDataUpdate {
    /// Replace the nodeset-selection params without touching the nodeset.
    /// `epoch` is the candidate (current + 1) the caller derived them for.
    NodeSetParams { epoch: Epoch, params: NodeSetParams },
    /// Install new metadata for the next epoch, as done by a sequencer
    /// (re)activation. `acceptable_epoch`, when set, makes the write
    /// conditional: it only applies if the store would hand out exactly
    /// that epoch.
    Activation {
        acceptable_epoch: Option<Epoch>,
        metadata: EpochMetaData,
    },
}

/// Provenance of the record a result carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaProperties {
    pub last_writer: Option<NodeId>,
}

/// Outcome of a `create_or_update_metadata` call.
#[derive(Clone, Debug)]
pub struct EpochStoreResult {
    pub status: Status,
    pub log_id: LogId,
    /// The store's record after the call: the updated record on `Ok`, the
    /// authoritative record on `Aborted`/`Uptodate`.
    pub info: Option<EpochMetaData>,
    pub meta_props: Option<MetaProperties>,
}

impl EpochStoreResult {
    fn new(status: Status, log_id: LogId, info: Option<EpochMetaData>) -> Self {
        Self {
            status,
            log_id,
            info,
            meta_props: None,
        }
    }
}

#[async_trait]
pub trait EpochStore: Send + Sync {
    async fn create_or_update_metadata(
        &self,
        log_id: LogId,
        update: MetaDataUpdate,
        write_node_id: WriteNodeId,
    ) -> EpochStoreResult;

    /// Human-readable identity for log messages.
    fn identify(&self) -> String;
}

/// In-process epoch store used by tests and embedded single-node setups.
///
/// Failure injection (`fail_next`) and a write gate (`set_writes_blocked`)
/// exist so callers can exercise the activator's retry, preemption and
/// backpressure paths deterministically.
#[derive(Debug, Default)]
pub struct InMemoryEpochStore {
    records: Mutex<BTreeMap<LogId, EpochMetaData>>,
    fail_next: Mutex<Option<Status>>,
    writes_blocked: Mutex<bool>,
    unblocked: Notify,
    write_count: AtomicU64,
}

impl InMemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a record unconditionally, bypassing epoch checks.
    pub fn provision(&self, log_id: LogId, metadata: EpochMetaData) {
        self.records.lock().unwrap().insert(log_id, metadata);
    }

    pub fn metadata(&self, log_id: LogId) -> Option<EpochMetaData> {
        self.records.lock().unwrap().get(&log_id).cloned()
    }

    /// Move a record's epoch, as a foreign sequencer activation would.
    pub fn set_epoch(&self, log_id: LogId, epoch: Epoch) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&log_id) {
            record.epoch = epoch;
        }
    }

    /// The next `create_or_update_metadata` call returns `status` without
    /// touching the record.
    pub fn fail_next(&self, status: Status) {
        *self.fail_next.lock().unwrap() = Some(status);
    }

    /// Park incoming writes until unblocked. Useful for holding activations
    /// in flight while asserting budget occupancy.
    pub fn set_writes_blocked(&self, blocked: bool) {
        *self.writes_blocked.lock().unwrap() = blocked;
        if !blocked {
            self.unblocked.notify_waiters();
        }
    }

    /// Number of successful record mutations.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    async fn wait_until_unblocked(&self) {
        loop {
            let unblocked = self.unblocked.notified();
            if !*self.writes_blocked.lock().unwrap() {
                return;
            }
            unblocked.await;
        }
    }
}

#[async_trait]
impl EpochStore for InMemoryEpochStore {
    async fn create_or_update_metadata(
        &self,
        log_id: LogId,
        update: MetaDataUpdate,
        _write_node_id: WriteNodeId,
    ) -> EpochStoreResult {
        self.wait_until_unblocked().await;

        if let Some(status) = self.fail_next.lock().unwrap().take() {
            let info = self.metadata(log_id);
            return EpochStoreResult::new(status, log_id, info);
        }

        let mut records = self.records.lock().unwrap();
        match update {
            MetaDataUpdate::NodeSetParams { epoch, params } => {
                let Some(record) = records.get_mut(&log_id) else {
                    return EpochStoreResult::new(Status::NotFound, log_id, None);
                };
                if record.epoch.next() != epoch {
                    // The candidate is stale; someone activated past us.
                    let info = record.clone();
                    return EpochStoreResult::new(Status::Aborted, log_id, Some(info));
                }
                if record.nodeset_params == params {
                    let info = record.clone();
                    return EpochStoreResult::new(Status::Uptodate, log_id, Some(info));
                }
                record.nodeset_params = params;
                self.write_count.fetch_add(1, Ordering::Relaxed);
                EpochStoreResult::new(Status::Ok, log_id, Some(record.clone()))
            }
            MetaDataUpdate::Activation {
                acceptable_epoch,
                metadata,
            } => {
                if let Some(acceptable) = acceptable_epoch {
                    if let Some(record) = records.get(&log_id) {
                        if record.epoch.next() != acceptable {
                            let info = record.clone();
                            return EpochStoreResult::new(Status::Aborted, log_id, Some(info));
                        }
                    }
                }
                let mut installed = metadata;
                if let Some(acceptable) = acceptable_epoch {
                    installed.epoch = acceptable;
                }
                records.insert(log_id, installed.clone());
                self.write_count.fetch_add(1, Ordering::Relaxed);
                EpochStoreResult::new(Status::Ok, log_id, Some(installed))
            }
        }
    }

    fn identify(&self) -> String {
        "in-memory".to_string()
    }
}
