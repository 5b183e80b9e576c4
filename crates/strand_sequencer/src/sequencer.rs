//! Sequencer objects and the per-processor registry.
//!
//! A `Sequencer` is the per-log authority handing out sequence numbers for
//! the current epoch. The background activator only ever inspects it and
//! asks the registry to reactivate it; it never creates one. The initial
//! activation on startup happens elsewhere and registers the sequencer via
//! `AllSequencers::insert_active`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use crate::budget::ActivationToken;
use crate::config::{ClusterConfig, ConfigHandle, LogAttributes, Settings};
use crate::epoch_store::{EpochStore, MetaDataUpdate, WriteNodeId};
use crate::metadata::{EpochMetaData, NodeSetParams};
use crate::types::{Epoch, LogId, Status};
use crate::worker::{request_notify_completion, Processor};

/// Observable sequencer lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    /// Created but never activated.
    Unavailable,
    /// An activation is running; it will re-trigger reconciliation when it
    /// completes.
    Activating,
    Active,
    /// A newer epoch exists elsewhere; this sequencer stopped sequencing.
    Preempted,
    /// Deactivated because this node is no longer a sequencer node.
    Deactivated,
}

/// Options fixed for the lifetime of one epoch sequencer. Changing any of
/// them requires a reactivation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochSequencerOptions {
    pub window_size: usize,
    pub tail_optimized: bool,
    pub draining_grace: Duration,
}

impl EpochSequencerOptions {
    pub fn from_config(attrs: &LogAttributes, settings: &Settings) -> Self {
        Self {
            window_size: attrs.max_writes_in_flight,
            tail_optimized: attrs.tail_optimized,
            draining_grace: settings.sequencer_draining_grace,
        }
    }
}

#[derive(Debug)]
struct SequencerInner {
    state: SequencerState,
    metadata: Option<Arc<EpochMetaData>>,
    options: Option<EpochSequencerOptions>,
    preempted_by: Option<Epoch>,
}

/// Per-log sequencer handle.
#[derive(Debug)]
pub struct Sequencer {
    log_id: LogId,
    inner: Mutex<SequencerInner>,
    /// Slot for the background activator's in-flight token. Written only
    /// from the activator's worker; holding a token means a background
    /// operation for this log is outstanding.
    background_token: Mutex<Option<ActivationToken>>,
}

impl Sequencer {
    fn new(log_id: LogId) -> Self {
        Self {
            log_id,
            inner: Mutex::new(SequencerInner {
                state: SequencerState::Unavailable,
                metadata: None,
                options: None,
                preempted_by: None,
            }),
            background_token: Mutex::new(None),
        }
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn state(&self) -> SequencerState {
        self.inner.lock().unwrap().state
    }

    pub fn current_metadata(&self) -> Option<Arc<EpochMetaData>> {
        self.inner.lock().unwrap().metadata.clone()
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.inner
            .lock()
            .unwrap()
            .metadata
            .as_ref()
            .map(|metadata| metadata.epoch)
    }

    /// State and metadata read under one lock, so a reactivation racing the
    /// reader cannot produce an `Active` state paired with stale metadata.
    pub fn state_and_metadata(&self) -> (SequencerState, Option<Arc<EpochMetaData>>) {
        let inner = self.inner.lock().unwrap();
        (inner.state, inner.metadata.clone())
    }

    pub fn options(&self) -> Option<EpochSequencerOptions> {
        self.inner.lock().unwrap().options.clone()
    }

    pub fn preempted_by(&self) -> Option<Epoch> {
        self.inner.lock().unwrap().preempted_by
    }

    /// React to a configuration change. A node that lost its sequencing
    /// membership deactivates its sequencers on the spot.
    pub fn note_configuration_changed(&self, _config: &ClusterConfig, is_sequencer_node: bool) {
        if is_sequencer_node {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if matches!(
            inner.state,
            SequencerState::Active | SequencerState::Activating
        ) {
            inner.state = SequencerState::Deactivated;
            tracing::info!(
                log = %self.log_id,
                "deactivating sequencer; this node is no longer a sequencer node"
            );
        }
    }

    /// Install `params` into the current epoch's metadata. Fails when the
    /// epoch moved or the sequencer stopped being active, both of which mean
    /// a reactivation got there first.
    pub fn set_nodeset_params_in_current_epoch(&self, epoch: Epoch, params: NodeSetParams) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SequencerState::Active {
            return false;
        }
        let Some(metadata) = inner.metadata.as_ref() else {
            return false;
        };
        if metadata.epoch != epoch {
            return false;
        }
        let mut updated = (**metadata).clone();
        updated.nodeset_params = params;
        inner.metadata = Some(Arc::new(updated));
        true
    }

    /// Mark the current metadata as persisted in the log's metadata log.
    /// The metadata-log writer calls this and then re-schedules the log.
    pub fn note_written_in_metadata_log(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(metadata) = inner.metadata.as_ref() {
            if !metadata.written_in_metadata_log {
                let mut updated = (**metadata).clone();
                updated.written_in_metadata_log = true;
                inner.metadata = Some(Arc::new(updated));
            }
        }
    }

    pub(crate) fn note_preempted(&self, preempted_by: Epoch) {
        let mut inner = self.inner.lock().unwrap();
        inner.preempted_by = Some(inner.preempted_by.map_or(preempted_by, |existing| {
            existing.max(preempted_by)
        }));
        if matches!(
            inner.state,
            SequencerState::Active | SequencerState::Activating
        ) {
            inner.state = SequencerState::Preempted;
        }
    }

    pub(crate) fn install_epoch(
        &self,
        metadata: Arc<EpochMetaData>,
        options: EpochSequencerOptions,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SequencerState::Active;
        inner.metadata = Some(metadata);
        inner.options = Some(options);
    }

    fn begin_activation(&self) -> Result<(), Status> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SequencerState::Activating => Err(Status::InProgress),
            SequencerState::Active => {
                inner.state = SequencerState::Activating;
                Ok(())
            }
            _ => Err(Status::NoSequencer),
        }
    }

    /// Roll back a failed activation; the previous epoch keeps running.
    fn abort_activation(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SequencerState::Activating {
            inner.state = SequencerState::Active;
        }
    }

    fn complete_activation(&self, metadata: Arc<EpochMetaData>, options: EpochSequencerOptions) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SequencerState::Activating {
            inner.state = SequencerState::Active;
            inner.metadata = Some(metadata);
            inner.options = Some(options);
        }
    }

    pub fn has_background_token(&self) -> bool {
        self.background_token.lock().unwrap().is_some()
    }

    pub(crate) fn store_background_token(&self, token: ActivationToken) {
        let mut slot = self.background_token.lock().unwrap();
        debug_assert!(slot.is_none(), "background activation token overwritten");
        *slot = Some(token);
    }

    pub(crate) fn take_background_token(&self) -> Option<ActivationToken> {
        self.background_token.lock().unwrap().take()
    }
}

/// Registry of all sequencers owned by one processor.
pub struct AllSequencers {
    sequencers: RwLock<BTreeMap<LogId, Arc<Sequencer>>>,
    epoch_store: Arc<dyn EpochStore>,
    config: Arc<ConfigHandle>,
    processor: OnceLock<Weak<Processor>>,
    fail_next_activation: Mutex<Option<Status>>,
}

impl AllSequencers {
    pub fn new(epoch_store: Arc<dyn EpochStore>, config: Arc<ConfigHandle>) -> Self {
        Self {
            sequencers: RwLock::new(BTreeMap::new()),
            epoch_store,
            config,
            processor: OnceLock::new(),
            fail_next_activation: Mutex::new(None),
        }
    }

    pub(crate) fn attach_processor(&self, processor: Weak<Processor>) {
        let _ = self.processor.set(processor);
    }

    fn processor(&self) -> Option<Arc<Processor>> {
        self.processor.get().and_then(Weak::upgrade)
    }

    pub fn epoch_store(&self) -> &Arc<dyn EpochStore> {
        &self.epoch_store
    }

    pub fn find_sequencer(&self, log_id: LogId) -> Option<Arc<Sequencer>> {
        self.sequencers.read().unwrap().get(&log_id).cloned()
    }

    /// Register an already-activated sequencer, as the startup activation
    /// path does. Options are derived from the current configuration.
    pub fn insert_active(
        &self,
        log_id: LogId,
        metadata: EpochMetaData,
    ) -> Result<Arc<Sequencer>, Status> {
        let cluster = self.config.cluster();
        let settings = self.config.settings();
        let attrs = cluster.log_attributes(log_id).ok_or(Status::NotFound)?;
        let sequencer = Arc::new(Sequencer::new(log_id));
        sequencer.install_epoch(
            Arc::new(metadata),
            EpochSequencerOptions::from_config(attrs, &settings),
        );
        self.sequencers
            .write()
            .unwrap()
            .insert(log_id, sequencer.clone());
        Ok(sequencer)
    }

    /// Make the next `activate_sequencer` call fail with `status`.
    pub fn fail_next_activation(&self, status: Status) {
        *self.fail_next_activation.lock().unwrap() = Some(status);
    }

    /// Kick off a sequencer reactivation: flip the sequencer to
    /// `Activating` and run the conditional epoch-store write in the
    /// background. Completion is reported through the activator's
    /// notification path regardless of who asked for the activation.
    pub fn activate_sequencer(
        &self,
        log_id: LogId,
        reason: &'static str,
        acceptable_epoch: Option<Epoch>,
        new_metadata: Option<EpochMetaData>,
    ) -> Result<(), Status> {
        if let Some(status) = self.fail_next_activation.lock().unwrap().take() {
            return Err(status);
        }

        let sequencer = self.find_sequencer(log_id).ok_or(Status::NotFound)?;
        let current = sequencer.current_metadata().ok_or(Status::NoSequencer)?;
        let Some(processor) = self.processor() else {
            return Err(Status::Shutdown);
        };
        sequencer.begin_activation()?;

        let target = new_metadata.unwrap_or_else(|| {
            let mut next = (*current).clone();
            next.epoch = next.epoch.next();
            next
        });

        let registry = processor.all_sequencers().clone();
        let store = self.epoch_store.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let result = store
                .create_or_update_metadata(
                    log_id,
                    MetaDataUpdate::Activation {
                        acceptable_epoch,
                        metadata: target,
                    },
                    WriteNodeId::KeepLast,
                )
                .await;

            match result.status {
                Status::Ok | Status::Uptodate => {
                    let cluster = config.cluster();
                    let settings = config.settings();
                    match (cluster.log_attributes(log_id), result.info.clone()) {
                        (Some(attrs), Some(mut installed)) => {
                            // The epoch store is authoritative; the metadata
                            // log catches up outside this path.
                            installed.written_in_metadata_log = true;
                            let epoch = installed.epoch;
                            sequencer.complete_activation(
                                Arc::new(installed),
                                EpochSequencerOptions::from_config(attrs, &settings),
                            );
                            tracing::info!(
                                log = %log_id,
                                %epoch,
                                reason,
                                "sequencer activated"
                            );
                        }
                        _ => {
                            sequencer.abort_activation();
                            tracing::warn!(
                                log = %log_id,
                                reason,
                                "activation finished but the log or record vanished"
                            );
                        }
                    }
                }
                Status::Aborted => match result.info.as_ref() {
                    Some(info) => {
                        registry.note_preemption(
                            log_id,
                            Epoch(info.epoch.0.saturating_sub(1)),
                            reason,
                        );
                    }
                    None => sequencer.abort_activation(),
                },
                _ => sequencer.abort_activation(),
            }

            if result.status != Status::Shutdown && result.status != Status::Failed {
                request_notify_completion(&processor, log_id, result.status);
            }
        });

        Ok(())
    }

    /// Record that a newer epoch exists for `log_id`; the local sequencer
    /// yields.
    pub fn note_preemption(&self, log_id: LogId, preempted_by: Epoch, context: &'static str) {
        let Some(sequencer) = self.find_sequencer(log_id) else {
            return;
        };
        sequencer.note_preempted(preempted_by);
        tracing::info!(
            log = %log_id,
            %preempted_by,
            context,
            "sequencer preempted by a newer epoch"
        );
    }
}

impl std::fmt::Debug for AllSequencers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllSequencers")
            .field("epoch_store", &self.epoch_store.identify())
            .finish()
    }
}
