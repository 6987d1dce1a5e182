// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory fakes for driving the manager in tests: a
//! transactional store over a `BTreeMap`, blob workers that honor the
//! `(epoch, seq)` fencing rules, a cluster controller handing out
//! candidates, and an object store that just tracks paths.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use granite_core::{
    keys,
    records::{self, PruneIntent, WorkerListEntry},
    Epoch, GranuleId, KeyRange, ManagerId, SeqNo, Uid, Version, WorkerId,
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::{CandidateWorker, ClusterController},
    config::BlobManagerConfig,
    manager::{BlobManager, BlobManagerHandle},
    metrics::ManagerMetricSet,
    object_store::{ObjectStore, ObjectStoreError},
    store::{
        KvStore, RangeReadResult, SplitTarget, StorageMetrics, StoreError, StoreResult,
        StoreTransaction,
    },
    worker::{
        AssignRangeRequest, AssignedRange, BlobWorkerClient, BlobWorkerHandle,
        GranuleStatusReport, GranuleStatusStream, RevokeRangeRequest, WorkerError,
        WorkerServiceFactory,
    },
};

// ---------------------------------------------------------------------------
// In-memory transactional store

#[derive(Debug, Default)]
struct MemState {
    data: BTreeMap<Bytes, Bytes>,
    version: u64,
}

#[derive(Debug, Default)]
struct MemStoreShared {
    state: StdMutex<MemState>,
    changed: Notify,
    estimates: StdMutex<Vec<(KeyRange, StorageMetrics)>>,
    split_points: StdMutex<Vec<(KeyRange, Vec<Bytes>)>>,
}

/// An in-memory [`KvStore`]: serializable by construction (commits apply
/// atomically under one lock), with watches driven by commit notifications.
#[derive(Debug, Default)]
pub struct MemStore {
    shared: Arc<MemStoreShared>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writes one committed row directly, outside any transaction.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let mut state = self.shared.state.lock().expect("mem store lock");
        state.data.insert(key.into(), value.into());
        state.version += 1;
        drop(state);
        self.shared.changed.notify_waiters();
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let state = self.shared.state.lock().expect("mem store lock");
        state.data.get(key).cloned()
    }

    /// All committed rows under `prefix`.
    pub fn snapshot_subspace(&self, prefix: &[u8]) -> Vec<(Bytes, Bytes)> {
        let span = keys::subspace_range(prefix);
        let state = self.shared.state.lock().expect("mem store lock");
        state
            .data
            .range(span.begin.clone()..span.end.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn set_estimate(&self, range: KeyRange, metrics: StorageMetrics) {
        let mut estimates = self.shared.estimates.lock().expect("mem store lock");
        estimates.retain(|(r, _)| *r != range);
        estimates.push((range, metrics));
    }

    pub fn set_split_points(&self, range: KeyRange, points: Vec<Bytes>) {
        let mut split_points = self.shared.split_points.lock().expect("mem store lock");
        split_points.retain(|(r, _)| *r != range);
        split_points.push((range, points));
    }
}

#[derive(Debug, Clone)]
enum MemOp {
    Set(Bytes, Bytes),
    SetVersionstamped(Bytes, Bytes),
    Clear(Bytes),
    ClearRange(KeyRange),
}

struct MemTransaction {
    shared: Arc<MemStoreShared>,
    ops: Vec<MemOp>,
}

impl MemTransaction {
    fn effective_rows(&self, range: &KeyRange) -> BTreeMap<Bytes, Bytes> {
        let state = self.shared.state.lock().expect("mem store lock");
        let mut rows: BTreeMap<Bytes, Bytes> = state
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(state);
        for op in &self.ops {
            match op {
                MemOp::Set(key, value) | MemOp::SetVersionstamped(key, value) => {
                    if range.contains(key) {
                        rows.insert(key.clone(), value.clone());
                    }
                }
                MemOp::Clear(key) => {
                    rows.remove(key);
                }
                MemOp::ClearRange(cleared) => {
                    rows.retain(|key, _| !cleared.contains(key));
                }
            }
        }
        rows
    }
}

#[async_trait]
impl StoreTransaction for MemTransaction {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let rows = self.effective_rows(&KeyRange::single(Bytes::copy_from_slice(key)));
        Ok(rows.get(key).cloned())
    }

    async fn get_range(
        &mut self,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
    ) -> StoreResult<RangeReadResult> {
        let rows = self.effective_rows(range);
        let total = rows.len();
        let collected: Vec<(Bytes, Bytes)> = if reverse {
            rows.into_iter().rev().take(limit).collect()
        } else {
            rows.into_iter().take(limit).collect()
        };
        Ok(RangeReadResult {
            more: total > collected.len(),
            rows: collected,
        })
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(MemOp::Set(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        ));
    }

    fn set_versionstamped_value(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(MemOp::SetVersionstamped(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        ));
    }

    fn clear(&mut self, key: &[u8]) {
        self.ops.push(MemOp::Clear(Bytes::copy_from_slice(key)));
    }

    fn clear_range(&mut self, range: &KeyRange) {
        self.ops.push(MemOp::ClearRange(range.clone()));
    }

    fn add_read_conflict(&mut self, _range: &KeyRange) {
        // Commits are serialized under one lock; conflicts cannot happen.
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let mut state = self.shared.state.lock().expect("mem store lock");
        state.version += 1;
        let version = state.version;
        for op in self.ops.drain(..) {
            match op {
                MemOp::Set(key, value) => {
                    state.data.insert(key, value);
                }
                MemOp::SetVersionstamped(key, value) => {
                    let mut stamped = Vec::with_capacity(value.len() + 10);
                    stamped.extend_from_slice(&value);
                    stamped.extend_from_slice(&version.to_be_bytes());
                    stamped.extend_from_slice(&[0, 0]);
                    state.data.insert(key, Bytes::from(stamped));
                }
                MemOp::Clear(key) => {
                    state.data.remove(&key);
                }
                MemOp::ClearRange(range) => {
                    state.data.retain(|key, _| !range.contains(key));
                }
            }
        }
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn on_error(&mut self, error: StoreError) -> StoreResult<()> {
        if error.is_retryable() {
            self.ops.clear();
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(())
        } else {
            Err(error)
        }
    }
}

#[async_trait]
impl KvStore for MemStore {
    fn transaction(&self) -> Box<dyn StoreTransaction> {
        Box::new(MemTransaction {
            shared: self.shared.clone(),
            ops: Vec::new(),
        })
    }

    async fn watch(&self, key: &[u8]) -> StoreResult<()> {
        let initial = self.get(key);
        loop {
            let notified = self.shared.changed.notified();
            if self.get(key) != initial {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn estimate_storage_metrics(&self, range: &KeyRange) -> StoreResult<StorageMetrics> {
        let estimates = self.shared.estimates.lock().expect("mem store lock");
        Ok(estimates
            .iter()
            .find(|(r, _)| r == range)
            .map(|(_, metrics)| *metrics)
            .unwrap_or_default())
    }

    async fn split_storage_metrics(
        &self,
        range: &KeyRange,
        _target: SplitTarget,
        _estimated: StorageMetrics,
    ) -> StoreResult<Vec<Bytes>> {
        let split_points = self.shared.split_points.lock().expect("mem store lock");
        Ok(split_points
            .iter()
            .find(|(r, _)| r == range)
            .map(|(_, points)| points.clone())
            .unwrap_or_else(|| vec![range.begin.clone(), range.end.clone()]))
    }
}

// ---------------------------------------------------------------------------
// In-memory object store

#[derive(Debug, Default)]
pub struct MemObjectStore {
    blobs: StdMutex<BTreeSet<String>>,
}

impl MemObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: impl Into<String>) {
        self.blobs.lock().expect("object store lock").insert(path.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.lock().expect("object store lock").contains(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs
            .lock()
            .expect("object store lock")
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn delete_file(&self, path: &str) -> Result<(), ObjectStoreError> {
        // Deleting a missing blob succeeds, matching real backends.
        self.blobs.lock().expect("object store lock").remove(path);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake blob workers

#[derive(Debug, Clone)]
struct OwnedRange {
    range: KeyRange,
    epoch: Epoch,
    seq: SeqNo,
}

#[derive(Debug, Default)]
struct FakeWorkerState {
    max_manager_epoch: Epoch,
    owned: Vec<OwnedRange>,
    status_streams: Vec<mpsc::UnboundedSender<Result<GranuleStatusReport, WorkerError>>>,
}

/// A blob worker that tracks assignments and enforces the `(epoch, seq)`
/// fencing rules a real worker would.
#[derive(Debug)]
pub struct FakeBlobWorker {
    entry: WorkerListEntry,
    state: StdMutex<FakeWorkerState>,
    failure: CancellationToken,
    halted: AtomicBool,
}

impl FakeBlobWorker {
    pub fn new(id_byte: u8, address: &str, dc: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            entry: WorkerListEntry {
                id: Uid::from_bytes([id_byte; 16]),
                address: address.to_string(),
                dc: dc.map(str::to_string),
            },
            state: StdMutex::new(FakeWorkerState::default()),
            failure: CancellationToken::new(),
            halted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.entry.id
    }

    pub fn entry(&self) -> &WorkerListEntry {
        &self.entry
    }

    /// Pre-loads an assignment, as if accepted from a previous manager.
    pub fn seed_assignment(&self, range: KeyRange, epoch: Epoch, seq: SeqNo) {
        let mut state = self.state.lock().expect("fake worker lock");
        state.owned.push(OwnedRange { range, epoch, seq });
    }

    /// The ranges this worker currently believes it owns, in key order.
    pub fn owned_ranges(&self) -> Vec<(KeyRange, Epoch, SeqNo)> {
        let state = self.state.lock().expect("fake worker lock");
        let mut owned: Vec<_> = state
            .owned
            .iter()
            .map(|o| (o.range.clone(), o.epoch, o.seq))
            .collect();
        owned.sort_by(|a, b| a.0.begin.cmp(&b.0.begin));
        owned
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Trips the failure detector and drops every status stream.
    pub fn trigger_failure(&self) {
        let mut state = self.state.lock().expect("fake worker lock");
        state.status_streams.clear();
        drop(state);
        self.failure.cancel();
    }

    /// Emits a status report on every open status stream.
    pub fn push_status(&self, report: GranuleStatusReport) {
        let state = self.state.lock().expect("fake worker lock");
        for stream in &state.status_streams {
            let _ = stream.send(Ok(report.clone()));
        }
    }

    fn check_alive(&self) -> Result<(), WorkerError> {
        if self.failure.is_cancelled() {
            Err(WorkerError::ConnectionFailed)
        } else {
            Ok(())
        }
    }

    fn observe_epoch(state: &mut FakeWorkerState, epoch: Epoch) -> Result<(), WorkerError> {
        if epoch < state.max_manager_epoch {
            return Err(WorkerError::ManagerReplaced);
        }
        state.max_manager_epoch = epoch;
        Ok(())
    }
}

#[async_trait]
impl BlobWorkerClient for FakeBlobWorker {
    async fn assign_range(&self, request: AssignRangeRequest) -> Result<(), WorkerError> {
        self.check_alive()?;
        let mut state = self.state.lock().expect("fake worker lock");
        Self::observe_epoch(&mut state, request.epoch)?;
        let newer_exists = state.owned.iter().any(|owned| {
            owned.range.intersects(&request.range)
                && (owned.epoch, owned.seq) >= (request.epoch, request.seq)
        });
        if newer_exists {
            return Err(WorkerError::AssignmentConflict);
        }
        state.owned.retain(|owned| !owned.range.intersects(&request.range));
        state.owned.push(OwnedRange {
            range: request.range,
            epoch: request.epoch,
            seq: request.seq,
        });
        Ok(())
    }

    async fn revoke_range(&self, request: RevokeRangeRequest) -> Result<(), WorkerError> {
        self.check_alive()?;
        let mut state = self.state.lock().expect("fake worker lock");
        Self::observe_epoch(&mut state, request.epoch)?;
        state.owned.retain(|owned| {
            !(owned.range.intersects(&request.range)
                && (owned.epoch, owned.seq) < (request.epoch, request.seq))
        });
        Ok(())
    }

    async fn granule_status_stream(
        &self,
        epoch: Epoch,
    ) -> Result<GranuleStatusStream, WorkerError> {
        self.check_alive()?;
        let mut state = self.state.lock().expect("fake worker lock");
        Self::observe_epoch(&mut state, epoch)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.status_streams.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn granule_assignments(&self, epoch: Epoch) -> Result<Vec<AssignedRange>, WorkerError> {
        self.check_alive()?;
        let mut state = self.state.lock().expect("fake worker lock");
        Self::observe_epoch(&mut state, epoch)?;
        Ok(state
            .owned
            .iter()
            .map(|owned| AssignedRange {
                range: owned.range.clone(),
                epoch_assigned: owned.epoch,
                seq_assigned: owned.seq,
            })
            .collect())
    }

    async fn halt(&self, epoch: Epoch, _manager_id: ManagerId) -> Result<(), WorkerError> {
        self.check_alive()?;
        let mut state = self.state.lock().expect("fake worker lock");
        Self::observe_epoch(&mut state, epoch)?;
        drop(state);
        self.halted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_failure(&self) {
        self.failure.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Fake cluster controller

#[derive(Debug, Default)]
struct FakeClusterState {
    candidates: VecDeque<Arc<FakeBlobWorker>>,
    by_address: HashMap<String, Arc<FakeBlobWorker>>,
}

/// Hands out [`FakeBlobWorker`]s as recruitment candidates and reconnects
/// them from persisted registrations.
#[derive(Debug)]
pub struct FakeCluster {
    store: Arc<MemStore>,
    state: StdMutex<FakeClusterState>,
}

impl FakeCluster {
    pub fn new(store: Arc<MemStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: StdMutex::new(FakeClusterState::default()),
        })
    }

    /// Offers a worker for recruitment.
    pub fn add_candidate(&self, worker: Arc<FakeBlobWorker>) {
        let mut state = self.state.lock().expect("fake cluster lock");
        state
            .by_address
            .insert(worker.entry.address.clone(), worker.clone());
        state.candidates.push_back(worker);
    }

    /// Registers an already-running worker, as the previous manager's
    /// recruitment would have: reachable and present in the worker list.
    pub fn register_existing(&self, worker: Arc<FakeBlobWorker>) {
        self.store.put(
            keys::worker_list_key_for(worker.id()),
            records::encode_value(&worker.entry),
        );
        let mut state = self.state.lock().expect("fake cluster lock");
        state
            .by_address
            .insert(worker.entry.address.clone(), worker);
    }
}

#[async_trait]
impl ClusterController for FakeCluster {
    async fn recruit_blob_worker(
        &self,
        exclude_addresses: &[String],
    ) -> Result<CandidateWorker, WorkerError> {
        let candidate = {
            let mut state = self.state.lock().expect("fake cluster lock");
            let position = state
                .candidates
                .iter()
                .position(|worker| !exclude_addresses.contains(&worker.entry.address));
            position.and_then(|index| state.candidates.remove(index))
        };
        match candidate {
            Some(worker) => Ok(CandidateWorker {
                address: worker.entry.address.clone(),
                dc: worker.entry.dc.clone(),
            }),
            None => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(WorkerError::Timeout)
            }
        }
    }

    async fn initialize_blob_worker(
        &self,
        candidate: &CandidateWorker,
        _interface_id: WorkerId,
    ) -> Result<BlobWorkerHandle, WorkerError> {
        let worker = {
            let state = self.state.lock().expect("fake cluster lock");
            state
                .by_address
                .get(&candidate.address)
                .cloned()
                .ok_or(WorkerError::RecruitmentFailed)?
        };
        worker.check_alive().map_err(|_| WorkerError::RecruitmentFailed)?;
        // A real worker registers itself while initializing.
        self.store.put(
            keys::worker_list_key_for(worker.id()),
            records::encode_value(&worker.entry),
        );
        Ok(BlobWorkerHandle {
            entry: worker.entry.clone(),
            client: worker,
        })
    }
}

#[async_trait]
impl WorkerServiceFactory for FakeCluster {
    async fn connect(
        &self,
        entry: &WorkerListEntry,
    ) -> Result<Arc<dyn BlobWorkerClient>, WorkerError> {
        let state = self.state.lock().expect("fake cluster lock");
        state
            .by_address
            .get(&entry.address)
            .cloned()
            .map(|worker| worker as Arc<dyn BlobWorkerClient>)
            .ok_or(WorkerError::ConnectionFailed)
    }
}

// ---------------------------------------------------------------------------
// Store seeding helpers

pub fn key(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

pub fn range(begin: &str, end: &str) -> KeyRange {
    KeyRange::new(key(begin), key(end))
}

/// Writes the manager epoch key.
pub fn seed_epoch(store: &MemStore, epoch: Epoch) {
    store.put(
        Bytes::copy_from_slice(keys::BLOB_MANAGER_EPOCH_KEY),
        records::encode_epoch(epoch),
    );
}

/// Declares a client blob range active and bumps the change key.
pub fn declare_client_range(store: &MemStore, range: &KeyRange) {
    store.put(
        keys::blob_range_key_for(&range.begin),
        Bytes::from_static(records::BLOB_RANGE_ACTIVE),
    );
    store.put(keys::blob_range_key_for(&range.end), Bytes::new());
    bump_change_key(store, keys::BLOB_RANGE_CHANGE_KEY);
}

/// Writes a prune intent row and bumps the prune change key.
pub fn write_prune_intent(store: &MemStore, range: &KeyRange, intent: PruneIntent) {
    store.put(
        keys::prune_intent_key_for(&range.begin),
        records::encode_value(&intent),
    );
    store.put(keys::prune_intent_key_for(&range.end), Bytes::new());
    bump_change_key(store, keys::PRUNE_CHANGE_KEY);
}

fn bump_change_key(store: &MemStore, change_key: &[u8]) {
    let next = store
        .get(change_key)
        .and_then(|value| records::decode_value::<u64>(&value).ok())
        .unwrap_or(0)
        + 1;
    store.put(Bytes::copy_from_slice(change_key), records::encode_value(&next));
}

/// Writes a granule history entry.
pub fn write_history_entry(
    store: &MemStore,
    range: &KeyRange,
    start_version: Version,
    value: &records::GranuleHistoryValue,
) {
    store.put(
        keys::granule_history_key_for(range, start_version),
        records::encode_value(value),
    );
}

/// Writes a granule file inventory row and creates the matching blob.
pub fn write_file_row(
    store: &MemStore,
    objects: &MemObjectStore,
    granule: GranuleId,
    kind: u8,
    version: Version,
    path: &str,
) {
    objects.insert(path);
    store.put(
        keys::granule_file_key_for(granule, kind, version),
        records::encode_value(&records::GranuleFileRecord {
            path: path.to_string(),
            length: 1024,
        }),
    );
}

/// Writes granule mapping boundary rows: each boundary except the last is
/// mapped to `owner`, the last row terminates the span.
pub fn write_granule_mapping(store: &MemStore, boundaries: &[Bytes], owner: WorkerId) {
    for boundary in &boundaries[..boundaries.len() - 1] {
        store.put(
            keys::granule_mapping_key_for(boundary),
            records::encode_value(&owner),
        );
    }
    store.put(
        keys::granule_mapping_key_for(&boundaries[boundaries.len() - 1]),
        Bytes::new(),
    );
}

/// Writes the split metadata a previous manager would have left behind.
pub fn write_in_progress_split(
    store: &MemStore,
    parent: GranuleId,
    boundaries: &[Bytes],
    epoch: Epoch,
    seq: SeqNo,
) {
    store.put(
        keys::split_boundary_key_for(parent, keys::SPLIT_BOUNDARY_SENTINEL),
        records::encode_value(&records::SplitBoundaryValue { epoch, seq }),
    );
    for boundary in boundaries {
        store.put(keys::split_boundary_key_for(parent, boundary), Bytes::new());
    }
}

/// Writes a granule lock row.
pub fn write_granule_lock(store: &MemStore, range: &KeyRange, lock: &records::GranuleLock) {
    store.put(keys::granule_lock_key_for(range), records::encode_value(lock));
}

// ---------------------------------------------------------------------------
// Full-manager fixture

/// A running manager wired to the in-memory fabric.
pub struct ManagerFixture {
    pub store: Arc<MemStore>,
    pub objects: Arc<MemObjectStore>,
    pub cluster: Arc<FakeCluster>,
    pub handle: BlobManagerHandle,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl ManagerFixture {
    /// Seeds the epoch key and starts a manager with the test config.
    pub fn start(
        epoch: Epoch,
        store: Arc<MemStore>,
        objects: Arc<MemObjectStore>,
        cluster: Arc<FakeCluster>,
    ) -> Self {
        seed_epoch(&store, epoch);
        let manager = BlobManager::with_rng(
            BlobManagerConfig::default_for_test(),
            epoch,
            Uid::from_bytes([0xee; 16]),
            None,
            store.clone(),
            objects.clone(),
            cluster.clone(),
            cluster.clone(),
            ManagerMetricSet::new_for_test(),
            StdRng::seed_from_u64(epoch),
        );
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());
        Self {
            store,
            objects,
            cluster,
            handle,
            task,
        }
    }

    /// Halts the manager and returns its exit result.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.handle.halt().await;
        self.task.await.expect("manager task must not panic")
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
