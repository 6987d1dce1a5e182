// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! The Blob Manager orchestrator.
//!
//! Owns the manager's task tree and all shared in-memory state. Children are
//! spawned through a supervisor; a child returning an error is fatal, the
//! "I am replaced" barrier or an explicit halt tears the whole tree down.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use futures::FutureExt as _;
use granite_core::{
    keys, records, Epoch, KeyRange, ManagerId, RangeMap, SeqNo, WorkerId,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch, Notify},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::ClusterController,
    config::BlobManagerConfig,
    manager::assignment::RangeAssignment,
    metrics::ManagerMetricSet,
    object_store::ObjectStore,
    store::{KvStore, StoreError, StoreTransaction},
    worker::{BlobWorkerHandle, WorkerServiceFactory},
};

pub(crate) mod assignment;
pub(crate) mod client_ranges;
pub(crate) mod prune;
pub(crate) mod recovery;
pub(crate) mod split;
pub(crate) mod workers;

/// Per-worker load accounting; assignment placement is by granule count.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WorkerStats {
    pub granules_assigned: i64,
}

/// All mutable manager state.
///
/// INV: the lock is never held across an await, so every suspension point
/// observes the maps in a consistent state.
pub(crate) struct ManagerState {
    pub next_seq: SeqNo,
    /// Tiles the normal range; [`WorkerId::NIL`] means declared but not yet
    /// placed.
    pub worker_assignments: RangeMap<WorkerId>,
    /// Ranges currently declared active by users, coalesced.
    pub known_blob_ranges: RangeMap<bool>,
    pub workers_by_id: HashMap<WorkerId, BlobWorkerHandle>,
    pub worker_stats: HashMap<WorkerId, WorkerStats>,
    /// Stable addresses of living workers; no address may ever be shared by
    /// two live worker identities.
    pub worker_addresses: HashSet<String>,
    /// Addresses with a recruitment currently in flight.
    pub recruiting_addresses: HashSet<String>,
    /// Recently-killed ids, kept so concurrent worker-list scans cannot
    /// resurrect a worker mid-teardown.
    pub dead_workers: HashSet<WorkerId>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            next_seq: 1,
            worker_assignments: RangeMap::new(KeyRange::normal(), WorkerId::NIL),
            known_blob_ranges: RangeMap::new(KeyRange::normal(), false),
            workers_by_id: HashMap::new(),
            worker_stats: HashMap::new(),
            worker_addresses: HashSet::new(),
            recruiting_addresses: HashSet::new(),
            dead_workers: HashSet::new(),
        }
    }
}

/// The single-consumer queue feeding the assignment engine.
///
/// Any task may enqueue; only the engine dequeues, and the order items are
/// enqueued is the order they receive sequence numbers.
pub(crate) struct AssignmentQueue {
    tx: mpsc::UnboundedSender<RangeAssignment>,
    pending: AtomicUsize,
    empty: Notify,
}

impl AssignmentQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<RangeAssignment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: AtomicUsize::new(0),
                empty: Notify::new(),
            },
            rx,
        )
    }

    pub fn send(&self, assignment: RangeAssignment) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(assignment).is_err() {
            // Manager is tearing down; nobody will drain the queue.
            tracing::debug!("assignment queue closed, dropping item");
        }
    }

    /// Called by the engine after an item is fully processed.
    pub(crate) fn mark_processed(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.empty.notify_waiters();
        }
    }

    /// Resolves once every enqueued item has been processed.
    pub async fn on_empty(&self) {
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.empty.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// An in-flight assign request that a later revoke can cancel by exact
/// range match.
pub(crate) struct InFlightAssign {
    pub token: CancellationToken,
    pub task_id: u64,
}

type SupervisedTask = (&'static str, BoxFuture<'static, anyhow::Result<()>>);

pub(crate) struct BlobManagerInner {
    pub id: ManagerId,
    pub epoch: Epoch,
    pub dc: Option<String>,
    pub config: BlobManagerConfig,
    pub store: Arc<dyn KvStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub cluster: Arc<dyn ClusterController>,
    pub worker_factory: Arc<dyn WorkerServiceFactory>,
    pub metrics: ManagerMetricSet,

    pub state: Mutex<ManagerState>,
    pub rng: Mutex<StdRng>,

    pub ranges_to_assign: AssignmentQueue,
    pub assigns_in_progress: Mutex<HashMap<KeyRange, InFlightAssign>>,
    next_assign_task_id: AtomicU64,

    /// First write wins; any component may fire it.
    replaced: CancellationToken,
    /// Cancels the whole task tree on exit, replaced or not.
    shutdown: CancellationToken,
    pub lock_check_requested: Notify,
    /// Fired once initial recovery has acknowledged existing workers.
    pub start_recruiting: Notify,
    pub restart_recruiting: Notify,
    /// Fired whenever a worker joins the directory.
    pub found_workers: Notify,
    pub recruiting_count: watch::Sender<usize>,
    done_recovering: watch::Sender<bool>,
    task_tx: mpsc::UnboundedSender<SupervisedTask>,
}

impl BlobManagerInner {
    /// Stamps the next action affecting a worker. `(epoch, seq)` pairs from
    /// one manager are strictly increasing.
    pub fn allocate_seq(&self) -> SeqNo {
        let mut state = self.state.lock().expect("manager state lock");
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    pub fn next_assign_task_id(&self) -> u64 {
        self.next_assign_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publishes "I am replaced"; idempotent.
    pub fn signal_replaced(&self) {
        if !self.replaced.is_cancelled() {
            tracing::info!(epoch = self.epoch, "blob manager observed replacement");
            self.replaced.cancel();
        }
    }

    pub fn is_replaced(&self) -> bool {
        self.replaced.is_cancelled()
    }

    pub async fn await_replaced(&self) {
        self.replaced.cancelled().await;
    }

    pub fn mark_recovered(&self) {
        let _ = self.done_recovering.send(true);
    }

    /// Resolves once recovery has published the initial assignment map.
    pub async fn recovered(&self) {
        let mut rx = self.done_recovering.subscribe();
        // wait_for returns immediately if already true.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn trigger_recruiting(&self) {
        self.restart_recruiting.notify_one();
    }

    /// Hands a task to the supervisor; an `Err` return is fatal for the
    /// whole manager.
    pub fn spawn_supervised(
        &self,
        name: &'static str,
        task: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        if self.task_tx.send((name, task.boxed())).is_err() {
            tracing::debug!(task = name, "supervisor gone, dropping task");
        }
    }

    pub fn random_in_range(&self, upper: usize) -> usize {
        self.rng
            .lock()
            .expect("manager rng lock")
            .gen_range(0..upper)
    }
}

/// Failure modes of a manager-lock check.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LockCheckError {
    #[error("a higher epoch holds the manager lock")]
    Replaced,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Verifies this manager still owns the epoch key and adds it to the
/// transaction's read-conflict set, so any mutation racing a newer manager
/// aborts one of the two.
pub(crate) async fn check_manager_lock(
    tr: &mut dyn StoreTransaction,
    inner: &BlobManagerInner,
) -> Result<(), LockCheckError> {
    let value = tr
        .get(keys::BLOB_MANAGER_EPOCH_KEY)
        .await?
        .ok_or_else(|| StoreError::Internal("manager epoch key missing".into()))?;
    let current = records::decode_epoch(&value)
        .map_err(|err| StoreError::Internal(format!("bad epoch value: {err}")))?;
    if current != inner.epoch {
        assert!(
            current > inner.epoch,
            "epoch key moved backwards: {} < {}",
            current,
            inner.epoch
        );
        tracing::info!(
            epoch = inner.epoch,
            observed = current,
            "found newer epoch in lock check"
        );
        inner.signal_replaced();
        return Err(LockCheckError::Replaced);
    }
    tr.add_read_conflict(&KeyRange::single(keys::BLOB_MANAGER_EPOCH_KEY));
    Ok(())
}

/// Waits for a lock-check request (assignment conflict or suspected
/// takeover) and re-reads the epoch key; exits once a higher epoch is seen.
async fn do_lock_checks(inner: Arc<BlobManagerInner>) -> anyhow::Result<()> {
    loop {
        inner.lock_check_requested.notified().await;
        // Settle briefly; a burst of conflicts should cost one check.
        tokio::time::sleep(inner.config.lock_check_settle).await;

        let mut tr = inner.store.transaction();
        loop {
            let checked = check_manager_lock(tr.as_mut(), &inner).await;
            match checked {
                Ok(()) => {
                    tracing::debug!(epoch = inner.epoch, "lock still held after conflict");
                    break;
                }
                Err(LockCheckError::Replaced) => return Ok(()),
                Err(LockCheckError::Store(error)) => tr.on_error(error).await?,
            }
        }
    }
}

/// Fault-injection helper: periodically revokes and reassigns one random
/// granule. Each granule is moved at most once.
async fn chaos_range_mover(inner: Arc<BlobManagerInner>) -> anyhow::Result<()> {
    let mut already_moved: HashSet<KeyRange> = HashSet::new();
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;

        let picked = {
            let state = inner.state.lock().expect("manager state lock");
            if state.workers_by_id.len() <= 1 {
                None
            } else {
                let ranges = state.worker_assignments.ranges();
                let candidates: Vec<KeyRange> = ranges
                    .into_iter()
                    .filter(|(range, worker)| {
                        !worker.is_nil() && !already_moved.contains(range)
                    })
                    .map(|(range, _)| range)
                    .collect();
                (!candidates.is_empty())
                    .then(|| candidates[inner.random_in_range(candidates.len())].clone())
            }
        };

        if let Some(range) = picked {
            tracing::info!(%range, "chaos range mover moving granule");
            already_moved.insert(range.clone());
            inner
                .ranges_to_assign
                .send(RangeAssignment::revoke(range.clone(), None, false));
            inner
                .ranges_to_assign
                .send(RangeAssignment::assign(range, None));
        }
    }
}

enum ManagerCommand {
    /// Stop the manager.
    Halt { ack: oneshot::Sender<()> },
    /// Halt and deregister every blob worker, then stop the manager.
    HaltGranules { ack: oneshot::Sender<()> },
}

/// Cloneable handle for halting a running manager.
#[derive(Clone)]
pub struct BlobManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl BlobManagerHandle {
    /// Requests a manager stop; resolves once the request is being honored.
    pub async fn halt(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ManagerCommand::Halt { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Tears the whole blob tier down: halts and deregisters every worker,
    /// then stops the manager.
    pub async fn halt_granules(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ManagerCommand::HaltGranules { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

/// A Blob Manager incarnation for one epoch.
pub struct BlobManager {
    inner: Arc<BlobManagerInner>,
    assignment_rx: mpsc::UnboundedReceiver<RangeAssignment>,
    task_rx: mpsc::UnboundedReceiver<SupervisedTask>,
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
}

impl BlobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BlobManagerConfig,
        epoch: Epoch,
        id: ManagerId,
        dc: Option<String>,
        store: Arc<dyn KvStore>,
        object_store: Arc<dyn ObjectStore>,
        cluster: Arc<dyn ClusterController>,
        worker_factory: Arc<dyn WorkerServiceFactory>,
        metrics: ManagerMetricSet,
    ) -> Self {
        Self::with_rng(
            config,
            epoch,
            id,
            dc,
            store,
            object_store,
            cluster,
            worker_factory,
            metrics,
            StdRng::from_entropy(),
        )
    }

    /// Like [`Self::new`] but with an injected rng, so fault-injection runs
    /// replay deterministically.
    #[allow(clippy::too_many_arguments)]
    pub fn with_rng(
        config: BlobManagerConfig,
        epoch: Epoch,
        id: ManagerId,
        dc: Option<String>,
        store: Arc<dyn KvStore>,
        object_store: Arc<dyn ObjectStore>,
        cluster: Arc<dyn ClusterController>,
        worker_factory: Arc<dyn WorkerServiceFactory>,
        metrics: ManagerMetricSet,
        rng: StdRng,
    ) -> Self {
        assert!(epoch > 0, "epochs start at 1");
        let (ranges_to_assign, assignment_rx) = AssignmentQueue::new();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BlobManagerInner {
            id,
            epoch,
            dc,
            config,
            store,
            object_store,
            cluster,
            worker_factory,
            metrics,
            state: Mutex::new(ManagerState::new()),
            rng: Mutex::new(rng),
            ranges_to_assign,
            assigns_in_progress: Mutex::new(HashMap::new()),
            next_assign_task_id: AtomicU64::new(0),
            replaced: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            lock_check_requested: Notify::new(),
            start_recruiting: Notify::new(),
            restart_recruiting: Notify::new(),
            found_workers: Notify::new(),
            recruiting_count: watch::Sender::new(0),
            done_recovering: watch::Sender::new(false),
            task_tx,
        });
        Self {
            inner,
            assignment_rx,
            task_rx,
            command_tx,
            command_rx,
        }
    }

    pub fn handle(&self) -> BlobManagerHandle {
        BlobManagerHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Runs the manager until it is replaced, halted, or a child fails.
    #[tracing::instrument(skip_all, fields(epoch = self.inner.epoch, id = %self.inner.id))]
    pub async fn run(self) -> anyhow::Result<()> {
        let BlobManager {
            inner,
            assignment_rx,
            task_rx,
            command_tx: _command_tx,
            mut command_rx,
        } = self;

        tracing::info!("blob manager starting");
        inner.metrics.current_epoch.set(inner.epoch as i64);

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(task_rx, inner.shutdown.clone(), fatal_tx));

        // The recruiter starts early but waits until recovery has
        // acknowledged the existing workers.
        inner.spawn_supervised(
            "blob_worker_recruiter",
            workers::blob_worker_recruiter(inner.clone()),
        );

        // The previous incarnation's state must be reconstructed before any
        // normal work starts.
        recovery::recover_blob_manager(inner.clone()).await?;

        inner.spawn_supervised("lock_checks", do_lock_checks(inner.clone()));
        inner.spawn_supervised(
            "monitor_client_ranges",
            client_ranges::monitor_client_ranges(inner.clone()),
        );
        inner.spawn_supervised(
            "range_assigner",
            assignment::range_assigner(inner.clone(), assignment_rx),
        );
        inner.spawn_supervised("monitor_prune_keys", prune::monitor_prune_keys(inner.clone()));
        if inner.config.chaos_range_mover {
            inner.spawn_supervised("chaos_range_mover", chaos_range_mover(inner.clone()));
        }

        let mut fatal: Option<anyhow::Error> = None;
        loop {
            select! {
                _ = inner.await_replaced() => {
                    tracing::info!("blob manager exiting: replaced");
                    break;
                }
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Halt { ack }) => {
                        tracing::info!("blob manager halted by request");
                        let _ = ack.send(());
                        break;
                    }
                    Some(ManagerCommand::HaltGranules { ack }) => {
                        tracing::info!("halting all blob granules by request");
                        if let Err(error) = workers::halt_blob_granules(&inner).await {
                            tracing::warn!(?error, "failed to halt all blob workers");
                        }
                        let _ = ack.send(());
                        break;
                    }
                    None => {}
                },
                error = fatal_rx.recv() => {
                    if let Some(error) = error {
                        tracing::error!(?error, "blob manager child task failed");
                        fatal = Some(error);
                        break;
                    }
                }
            }
        }

        inner.shutdown.cancel();
        let _ = supervisor.await;
        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

async fn supervise(
    mut task_rx: mpsc::UnboundedReceiver<SupervisedTask>,
    shutdown: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
) {
    let mut tasks: JoinSet<(&'static str, anyhow::Result<()>)> = JoinSet::new();
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            task = task_rx.recv() => match task {
                Some((name, task)) => {
                    tasks.spawn(async move { (name, task.await) });
                }
                None => break,
            },
            Some(result) = tasks.join_next(), if !tasks.is_empty() => match result {
                Ok((name, Ok(()))) => tracing::debug!(task = name, "manager task finished"),
                Ok((name, Err(error))) => {
                    let _ = fatal_tx.send(error.context(name));
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    let _ = fatal_tx.send(
                        anyhow::Error::from(join_error).context("manager task panicked"),
                    );
                }
            },
        }
    }
    tasks.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assignment_queue_on_empty_tracks_processing() {
        let (queue, mut rx) = AssignmentQueue::new();

        // Empty from the start.
        queue.on_empty().await;

        queue.send(RangeAssignment::assign(
            KeyRange::new(&b"a"[..], &b"b"[..]),
            None,
        ));
        let waiter = {
            let queue = &queue;
            async move {
                queue.on_empty().await;
            }
        };
        tokio::pin!(waiter);
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        let _item = rx.recv().await.unwrap();
        queue.mark_processed();
        waiter.await;
    }

    #[test]
    fn seq_allocation_is_strictly_increasing() {
        let state = Mutex::new(ManagerState::new());
        let mut last = 0;
        for _ in 0..10 {
            let mut guard = state.lock().unwrap();
            let seq = guard.next_seq;
            guard.next_seq += 1;
            drop(guard);
            assert!(seq > last || last == 0);
            last = seq;
        }
    }
}
