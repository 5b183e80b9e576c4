//! Processor, worker tasks and the request bridge.
//!
//! A `Processor` owns a fixed set of workers, each a tokio task draining an
//! unbounded mailbox. The background activator is pinned to one worker per
//! processor (a fixed salt reduced modulo the worker count) and constructed
//! lazily inside that worker on first delivery; callers from any thread go
//! through `request_schedule` / `request_notify_completion` and never touch
//! the activator directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::activator::{ActivatorSnapshot, SequencerBackgroundActivator};
use crate::config::ConfigHandle;
use crate::epoch_store::EpochStore;
use crate::metadata::{NodeSetSelector, RendezvousNodeSetSelector};
use crate::sequencer::AllSequencers;
use crate::stats::SequencerStats;
use crate::types::{LogId, Status};

/// Salt pinning the activator to one deterministic worker per processor.
const BACKGROUND_WORKER_SALT: u64 = 0x6e15_e5bb_c656_3518;

/// Requests delivered to a worker's mailbox.
#[derive(Debug)]
pub enum WorkerRequest {
    Schedule(Vec<LogId>),
    NotifyCompletion(LogId, Status),
    RetryTimerFired { generation: u64 },
    Snapshot(oneshot::Sender<ActivatorSnapshot>),
    Shutdown,
}

/// Why a request could not be posted.
#[derive(Debug, PartialEq, Eq)]
pub enum PostError {
    Shutdown,
    InvalidWorker,
}

pub struct Processor {
    workers: Vec<mpsc::UnboundedSender<WorkerRequest>>,
    all_sequencers: Arc<AllSequencers>,
    config: Arc<ConfigHandle>,
    stats: Arc<SequencerStats>,
    nodeset_selector: Arc<dyn NodeSetSelector>,
    shutting_down: AtomicBool,
}

impl Processor {
    pub fn new(
        worker_count: usize,
        config: Arc<ConfigHandle>,
        epoch_store: Arc<dyn EpochStore>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::with_selector(
            worker_count,
            config,
            epoch_store,
            Arc::new(RendezvousNodeSetSelector),
        )
    }

    pub fn with_selector(
        worker_count: usize,
        config: Arc<ConfigHandle>,
        epoch_store: Arc<dyn EpochStore>,
        nodeset_selector: Arc<dyn NodeSetSelector>,
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(worker_count > 0, "processor needs at least one worker");

        let mut senders = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let all_sequencers = Arc::new(AllSequencers::new(epoch_store, config.clone()));
        let processor = Arc::new(Self {
            workers: senders,
            all_sequencers: all_sequencers.clone(),
            config,
            stats: Arc::new(SequencerStats::default()),
            nodeset_selector,
            shutting_down: AtomicBool::new(false),
        });
        all_sequencers.attach_processor(Arc::downgrade(&processor));

        for (index, rx) in receivers.into_iter().enumerate() {
            tokio::spawn(worker_main(index, processor.clone(), rx));
        }
        Ok(processor)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<SequencerStats> {
        &self.stats
    }

    pub fn all_sequencers(&self) -> &Arc<AllSequencers> {
        &self.all_sequencers
    }

    pub fn nodeset_selector(&self) -> &Arc<dyn NodeSetSelector> {
        &self.nodeset_selector
    }

    /// The worker the background activator lives on.
    pub fn background_worker_index(&self) -> usize {
        (BACKGROUND_WORKER_SALT % self.workers.len() as u64) as usize
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting requests and wind the workers down.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for tx in &self.workers {
            let _ = tx.send(WorkerRequest::Shutdown);
        }
    }

    pub(crate) fn post_important(
        &self,
        worker: usize,
        request: WorkerRequest,
    ) -> Result<(), PostError> {
        if self.is_shutting_down() {
            return Err(PostError::Shutdown);
        }
        self.workers
            .get(worker)
            .ok_or(PostError::InvalidWorker)?
            .send(request)
            .map_err(|_| PostError::Shutdown)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("workers", &self.workers.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

async fn worker_main(
    index: usize,
    processor: Arc<Processor>,
    mut rx: mpsc::UnboundedReceiver<WorkerRequest>,
) {
    let mut activator: Option<SequencerBackgroundActivator> = None;

    while let Some(request) = rx.recv().await {
        if matches!(request, WorkerRequest::Shutdown) {
            break;
        }
        let activator =
            activator.get_or_insert_with(|| SequencerBackgroundActivator::new(&processor));
        match request {
            WorkerRequest::Schedule(log_ids) => activator.schedule(&processor, log_ids),
            WorkerRequest::NotifyCompletion(log_id, status) => {
                activator.notify_completion(&processor, log_id, status)
            }
            WorkerRequest::RetryTimerFired { generation } => {
                activator.on_retry_timer(&processor, generation)
            }
            WorkerRequest::Snapshot(reply) => {
                let _ = reply.send(activator.snapshot());
            }
            WorkerRequest::Shutdown => break,
        }
    }
    tracing::debug!(worker = index, "worker loop exited");
}

/// Queue logs for background reconciliation from any thread.
pub fn request_schedule(processor: &Arc<Processor>, log_ids: Vec<LogId>) {
    debug_assert!(!log_ids.is_empty());
    debug_assert!(log_ids.iter().all(|log_id| !log_id.is_metadata()));
    let worker = processor.background_worker_index();
    if let Err(err) = processor.post_important(worker, WorkerRequest::Schedule(log_ids)) {
        debug_assert!(
            processor.is_shutting_down(),
            "posting schedule failed outside shutdown: {err:?}"
        );
        tracing::debug!(error = ?err, "dropped schedule request during shutdown");
    }
}

/// Report a downstream completion back to the activator from any thread.
pub fn request_notify_completion(processor: &Arc<Processor>, log_id: LogId, status: Status) {
    let worker = processor.background_worker_index();
    if let Err(err) =
        processor.post_important(worker, WorkerRequest::NotifyCompletion(log_id, status))
    {
        debug_assert!(
            processor.is_shutting_down(),
            "posting completion failed outside shutdown: {err:?}"
        );
        tracing::debug!(error = ?err, "dropped completion notification during shutdown");
    }
}

/// Fetch the activator's queue/budget counts. Returns `None` once the
/// processor is shutting down.
pub async fn request_snapshot(processor: &Arc<Processor>) -> Option<ActivatorSnapshot> {
    let (tx, rx) = oneshot::channel();
    let worker = processor.background_worker_index();
    processor
        .post_important(worker, WorkerRequest::Snapshot(tx))
        .ok()?;
    rx.await.ok()
}
