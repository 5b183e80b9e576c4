//! Background sequencer activator.
//!
//! A per-worker control loop that lazily reconciles each log's running
//! sequencer with the current configuration. Reconciliation is staged:
//! 1. schedule puts the log into the pending queue (dedup on insert)
//! 2. the pump drains the queue under a bounded in-flight budget
//! 3. per log, decide: nothing / params-only epoch-store write / full
//!    reactivation with an epoch bump
//! 4. async completions come back through the worker mailbox, release the
//!    budget slot and re-enqueue the log for a (cheap) re-check
//!
//! All state here is confined to the owning worker; nothing in this module
//! takes a lock for its own fields.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::budget::{ActivationBudget, ActivationToken};
use crate::epoch_store::{MetaDataUpdate, WriteNodeId};
use crate::metadata::{
    update_metadata_if_needed, EpochMetaData, NodeSetParams, UpdateOptions, UpdateResult,
};
use crate::sequencer::{EpochSequencerOptions, Sequencer, SequencerState};
use crate::types::{Epoch, LogId, Status, EPOCH_MAX};
use crate::worker::{request_notify_completion, Processor, WorkerRequest};

/// Soft bound on one pump invocation before yielding back to the worker.
const PUMP_TIME_SLICE: Duration = Duration::from_millis(2);
/// Re-arm delay used when the pump yields mid-queue.
const PUMP_YIELD_DELAY: Duration = Duration::from_millis(5);

/// Window and budget for failure-path logging.
const LOG_WINDOW: Duration = Duration::from_secs(10);

/// What happened to one log during a pump iteration.
enum LogOutcome {
    /// Finished with this log for now; release the slot.
    Done,
    /// An async operation owns the slot; the completion re-enqueues.
    InFlight,
    /// Transient failure; keep the log queued and retry on the timer.
    Retry,
}

/// Result of planning the epoch-store side of a reconciliation.
enum MetaDataPlan {
    /// Metadata already matches the configuration (or the update could not
    /// be computed and must not be retried).
    NoUpdate,
    /// Write this candidate; `only_params` selects the cheap path.
    Update {
        candidate: EpochMetaData,
        only_params: bool,
    },
    /// Nodeset selection is unstable; drop every pending change for this
    /// log, including an options-driven reactivation.
    CancelAll,
}

/// Transient statuses worth a timed retry; everything else either resolved
/// itself or will be retried by a later event.
pub(crate) fn should_retry(status: Status) -> bool {
    matches!(
        status,
        Status::Failed | Status::NoBufs | Status::TooMany | Status::NotConn | Status::Access
    )
}

/// Windowed log suppressor for failure storms.
struct RateLimiter {
    window: Duration,
    budget: u32,
    window_start: Option<Instant>,
    emitted: u32,
}

impl RateLimiter {
    fn new(window: Duration, budget: u32) -> Self {
        Self {
            window,
            budget,
            window_start: None,
            emitted: 0,
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {
                if self.emitted < self.budget {
                    self.emitted += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                self.window_start = Some(now);
                self.emitted = 1;
                true
            }
        }
    }
}

/// One-shot, re-armable deferral of queue processing. Arming spawns a sleep
/// that posts back to the owning worker; a generation counter drops fires
/// that raced a cancel.
struct RetryTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl RetryTimer {
    fn new() -> Self {
        Self {
            generation: 0,
            handle: None,
        }
    }

    fn arm(&mut self, processor: &Arc<Processor>, timeout: Duration) {
        self.cancel();
        let generation = self.generation;
        let processor = processor.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let worker = processor.background_worker_index();
            let _ = processor.post_important(worker, WorkerRequest::RetryTimerFired { generation });
        }));
    }

    fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn matches(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }
}

/// Counts visible through the debug snapshot request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivatorSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    pub limit: usize,
}

/// The per-worker activator instance. Constructed lazily by the worker on
/// first request delivery; lives for the worker's lifetime.
pub struct SequencerBackgroundActivator {
    queue: BTreeSet<LogId>,
    budget: ActivationBudget,
    retry_timer: RetryTimer,
    options_changed_log: RateLimiter,
    metadata_update_log: RateLimiter,
    update_failed_log: RateLimiter,
    recheck_incomplete_log: RateLimiter,
}

impl SequencerBackgroundActivator {
    pub fn new(processor: &Arc<Processor>) -> Self {
        let settings = processor.config().settings();
        Self {
            queue: BTreeSet::new(),
            budget: ActivationBudget::new(
                settings.max_sequencer_background_activations_in_flight,
            ),
            retry_timer: RetryTimer::new(),
            options_changed_log: RateLimiter::new(LOG_WINDOW, 10),
            metadata_update_log: RateLimiter::new(LOG_WINDOW, 10),
            update_failed_log: RateLimiter::new(LOG_WINDOW, 2),
            recheck_incomplete_log: RateLimiter::new(LOG_WINDOW, 2),
        }
    }

    /// Queue the given logs for reconciliation. Inserting an already queued
    /// log is a no-op and does not count as scheduled.
    pub fn schedule(&mut self, processor: &Arc<Processor>, log_ids: Vec<LogId>) {
        let mut num_scheduled = 0u64;
        for log_id in log_ids {
            // Metadata logs don't interact with the epoch store, so this
            // state machine cannot activate them; callers filter them out.
            debug_assert!(!log_id.is_metadata());
            if self.queue.insert(log_id) {
                num_scheduled += 1;
            }
        }
        if num_scheduled > 0 {
            processor.stats().bump_scheduled(num_scheduled);
        }
        self.maybe_process_queue(processor);
    }

    /// A downstream operation for `log_id` finished. Reclaim the budget
    /// slot if we issued it and re-check the log; the re-check is cheap
    /// when nothing changed while the operation was in flight.
    pub fn notify_completion(&mut self, processor: &Arc<Processor>, log_id: LogId, _status: Status) {
        if log_id.is_metadata() {
            return;
        }
        let Some(sequencer) = processor.all_sequencers().find_sequencer(log_id) else {
            return;
        };

        let had_token = sequencer.take_background_token().is_some();
        let inserted = self.queue.insert(log_id);

        if had_token && !inserted {
            processor.stats().bump_completed(1);
        }
        if !had_token && inserted {
            processor.stats().bump_scheduled(1);
        }

        self.maybe_process_queue(processor);
    }

    pub fn on_retry_timer(&mut self, processor: &Arc<Processor>, generation: u64) {
        if self.retry_timer.matches(generation) {
            self.maybe_process_queue(processor);
        }
    }

    pub fn snapshot(&self) -> ActivatorSnapshot {
        ActivatorSnapshot {
            queued: self.queue.len(),
            in_flight: self.budget.in_flight(),
            limit: self.budget.limit(),
        }
    }

    /// Drain the queue while there is budget, yielding after a time slice
    /// so one pump cannot monopolise the worker.
    fn maybe_process_queue(&mut self, processor: &Arc<Processor>) {
        self.retry_timer.cancel();

        let settings = processor.config().settings();
        let limit = settings.max_sequencer_background_activations_in_flight;
        if self.budget.limit() != limit {
            self.budget.set_limit(limit);
        }

        let start = Instant::now();
        let mut made_progress = false;

        while !self.queue.is_empty() && self.budget.available() > 0 {
            if made_progress && start.elapsed() > PUMP_TIME_SLICE {
                // Taking a while; yield and resume shortly.
                self.retry_timer.arm(processor, PUMP_YIELD_DELAY);
                break;
            }
            made_progress = true;

            let Some(&log_id) = self.queue.first() else {
                break;
            };
            let Some(token) = self.budget.acquire() else {
                break;
            };

            match self.process_one_log(processor, log_id, token) {
                LogOutcome::Done => {
                    self.queue.remove(&log_id);
                    processor.stats().bump_completed(1);
                }
                LogOutcome::InFlight => {
                    self.queue.remove(&log_id);
                }
                LogOutcome::Retry => {
                    self.retry_timer.arm(
                        processor,
                        settings.sequencer_background_activation_retry_interval,
                    );
                    break;
                }
            }
        }
    }

    /// One reconciliation attempt for one log, with a token already taken
    /// out of the budget. On `InFlight` the token has been moved into the
    /// sequencer; on every other outcome it is released here.
    fn process_one_log(
        &mut self,
        processor: &Arc<Processor>,
        log_id: LogId,
        token: ActivationToken,
    ) -> LogOutcome {
        let Some(sequencer) = processor.all_sequencers().find_sequencer(log_id) else {
            // No sequencer for that log, we're done with this one.
            return LogOutcome::Done;
        };

        if sequencer.has_background_token() {
            // Something is already in flight for this log; its completion
            // will run the check again.
            return LogOutcome::Done;
        }

        let cluster = processor.config().cluster();
        let nodes = processor.config().nodes();
        let is_sequencer_node = nodes.is_sequencing_enabled(cluster.my_node_id);

        sequencer.note_configuration_changed(&cluster, is_sequencer_node);
        if !is_sequencer_node {
            // The call above deactivated the sequencer; nothing to do.
            return LogOutcome::Done;
        }

        match self.reprovision_or_reactivate(processor, log_id, &sequencer) {
            Ok(()) => {
                debug_assert!(!sequencer.has_background_token());
                sequencer.store_background_token(token);
                LogOutcome::InFlight
            }
            Err(Status::Uptodate) => LogOutcome::Done,
            Err(status) => {
                let retry = should_retry(status);
                if status != Status::InProgress && status != Status::NoSequencer {
                    if self.recheck_incomplete_log.allow() {
                        tracing::info!(
                            log = %log_id,
                            %status,
                            retry,
                            "metadata re-check for log did not complete"
                        );
                    }
                }
                if retry {
                    LogOutcome::Retry
                } else {
                    LogOutcome::Done
                }
            }
        }
    }

    /// The reconciliation decision for an active sequencer. `Ok` means an
    /// asynchronous operation was started and owns the in-flight slot.
    fn reprovision_or_reactivate(
        &mut self,
        processor: &Arc<Processor>,
        log_id: LogId,
        sequencer: &Arc<Sequencer>,
    ) -> Result<(), Status> {
        debug_assert!(!log_id.is_metadata());

        // State and metadata must come from one consistent read: a
        // reactivation between the two would pair ACTIVE with metadata of
        // a different epoch.
        let metadata = match sequencer.state_and_metadata() {
            (SequencerState::Active, Some(metadata)) => metadata,
            (SequencerState::Activating, _) => return Err(Status::InProgress),
            _ => return Err(Status::NoSequencer),
        };
        if metadata.is_empty() || metadata.disabled {
            debug_assert!(false, "active sequencer with unusable metadata");
            return Err(Status::Internal);
        }

        let cluster = processor.config().cluster();
        let nodes = processor.config().nodes();
        let settings = processor.config().settings();

        let Some(attrs) = cluster.log_attributes(log_id) else {
            return Err(Status::NotFound);
        };

        let current_epoch = metadata.epoch;
        debug_assert!(current_epoch.is_valid());
        if current_epoch.0 >= EPOCH_MAX.0 - 2 {
            // Ran out of epoch numbers; cannot reactivate.
            return Err(Status::TooBig);
        }

        let Some(current_options) = sequencer.options() else {
            return Err(Status::NoSequencer);
        };
        let new_options = EpochSequencerOptions::from_config(attrs, &settings);

        let mut need_reactivation = false;
        let mut need_epoch_metadata_update = false;
        let mut new_metadata: Option<EpochMetaData> = None;

        if new_options != current_options {
            need_reactivation = true;
            if self.options_changed_log.allow() {
                tracing::info!(
                    log = %log_id,
                    epoch = %current_epoch,
                    current = ?current_options,
                    new = ?new_options,
                    "reactivating sequencer because its options changed"
                );
            }
        }

        if cluster.sequencers_provision_epoch_store {
            match self.plan_metadata_update(processor, log_id, &metadata, current_epoch)? {
                MetaDataPlan::NoUpdate => {}
                MetaDataPlan::Update {
                    candidate,
                    only_params,
                } => {
                    need_epoch_metadata_update = true;
                    if !only_params {
                        need_reactivation = true;
                    }
                    new_metadata = Some(candidate);
                }
                MetaDataPlan::CancelAll => {
                    need_reactivation = false;
                    need_epoch_metadata_update = false;
                }
            }
        }

        if need_reactivation {
            processor.stats().bump_reactivations_for_metadata_update();
            processor
                .all_sequencers()
                .activate_sequencer(
                    log_id,
                    "background reconfiguration",
                    Some(current_epoch.next()),
                    new_metadata,
                )
                .map_err(|status| {
                    debug_assert!(
                        matches!(
                            status,
                            Status::NotFound
                                | Status::NoBufs
                                | Status::InProgress
                                | Status::Failed
                                | Status::TooMany
                                | Status::SysLimit
                        ),
                        "unexpected activation failure: {status}"
                    );
                    status
                })?;
            return Ok(());
        }

        if need_epoch_metadata_update {
            processor.stats().bump_metadata_updates_without_reactivation();
            let Some(candidate) = new_metadata else {
                debug_assert!(false, "params update planned without a candidate");
                return Err(Status::Internal);
            };
            dispatch_params_update(
                processor,
                log_id,
                sequencer,
                current_epoch,
                candidate.nodeset_params,
            );
            return Ok(());
        }

        Err(Status::Uptodate)
    }

    /// Decide whether the epoch store needs a new record for this log, and
    /// verify the freshly selected candidate is a fixpoint of the selector.
    fn plan_metadata_update(
        &mut self,
        processor: &Arc<Processor>,
        log_id: LogId,
        metadata: &EpochMetaData,
        current_epoch: Epoch,
    ) -> Result<MetaDataPlan, Status> {
        if !metadata.written_in_metadata_log {
            // Reprovisioning has to wait until the current record reaches
            // the metadata log; the writer re-schedules this log after.
            return Err(Status::InProgress);
        }

        let cluster = processor.config().cluster();
        let nodes = processor.config().nodes();
        let settings = processor.config().settings();
        let selector = processor.nodeset_selector();
        let update_options = UpdateOptions {
            use_new_storage_set_format: settings.epoch_metadata_use_new_storage_set_format,
            provision_if_empty: false,
            update_if_exists: true,
            force_update: false,
        };

        // Copy the sequencer's metadata and bump the epoch. The result
        // should equal the record in the epoch store, unless this sequencer
        // was preempted, which the conditional write will notice.
        let mut candidate = metadata.clone();
        debug_assert!(candidate.epoch < EPOCH_MAX);
        candidate.epoch = candidate.epoch.next();

        let result = update_metadata_if_needed(
            log_id,
            &mut candidate,
            &cluster,
            &nodes,
            selector.as_ref(),
            &update_options,
        );
        let only_params = match result {
            UpdateResult::Failed(status) => {
                // Unexpected; don't update and don't retry.
                if self.update_failed_log.allow() {
                    tracing::error!(
                        log = %log_id,
                        %status,
                        "failed to consider updating epoch metadata"
                    );
                }
                return Ok(MetaDataPlan::NoUpdate);
            }
            UpdateResult::Unchanged => return Ok(MetaDataPlan::NoUpdate),
            UpdateResult::Updated {
                only_nodeset_params_changed,
            } => only_nodeset_params_changed,
        };

        if !only_params {
            if self.metadata_update_log.allow() {
                tracing::info!(
                    log = %log_id,
                    epoch = %current_epoch,
                    old = %metadata,
                    new = %candidate,
                    "reactivating sequencer to update epoch metadata"
                );
            }
        } else if self.metadata_update_log.allow() {
            tracing::info!(
                log = %log_id,
                epoch = %current_epoch,
                old = %metadata.nodeset_params,
                new = %candidate.nodeset_params,
                "updating nodeset params in the epoch store without changing the nodeset"
            );
        }

        // The selector must be satisfied with the fresh candidate, or an
        // unstable selector would reactivate this log forever.
        let mut recheck = candidate.clone();
        let second = update_metadata_if_needed(
            log_id,
            &mut recheck,
            &cluster,
            &nodes,
            selector.as_ref(),
            &update_options,
        );
        if second != UpdateResult::Unchanged {
            if self.update_failed_log.allow() {
                tracing::error!(
                    log = %log_id,
                    epoch = %current_epoch,
                    candidate = %candidate,
                    second_result = ?second,
                    "nodeset selector wants to update metadata twice in a row; cancelling the update"
                );
            }
            return Ok(MetaDataPlan::CancelAll);
        }

        Ok(MetaDataPlan::Update {
            candidate,
            only_params,
        })
    }
}

/// Issue the params-only epoch-store write for one log.
///
/// Runs outside the worker: the spawned task captures only shared handles
/// and plain values and reports back through the notification request, so
/// activator state is never touched off-worker.
fn dispatch_params_update(
    processor: &Arc<Processor>,
    log_id: LogId,
    sequencer: &Arc<Sequencer>,
    current_epoch: Epoch,
    params: NodeSetParams,
) {
    let registry = processor.all_sequencers().clone();
    let store = registry.epoch_store().clone();
    let sequencer = sequencer.clone();
    let processor = processor.clone();

    tokio::spawn(async move {
        let result = store
            .create_or_update_metadata(
                log_id,
                MetaDataUpdate::NodeSetParams {
                    epoch: current_epoch.next(),
                    params,
                },
                WriteNodeId::KeepLast,
            )
            .await;

        match result.status {
            Status::Ok | Status::Uptodate => {
                if !sequencer.set_nodeset_params_in_current_epoch(current_epoch, params) {
                    tracing::info!(
                        log = %log_id,
                        epoch = %current_epoch,
                        %params,
                        "lost the race updating nodeset params; a reactivation got there first"
                    );
                }
            }
            Status::Aborted => {
                // The epoch moved past our candidate: preempted.
                debug_assert!(result.info.is_some());
                if let Some(info) = result.info.as_ref() {
                    registry.note_preemption(
                        log_id,
                        Epoch(info.epoch.0.saturating_sub(1)),
                        "updating nodeset params",
                    );
                }
            }
            _ => {}
        }

        if result.status != Status::Shutdown && result.status != Status::Failed {
            request_notify_completion(&processor, log_id, result.status);
        }
    });
}
