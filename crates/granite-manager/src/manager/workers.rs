// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blob worker lifecycle: discovery, recruitment, monitoring, and teardown.

use std::sync::Arc;

use futures::StreamExt as _;
use granite_core::{
    keys, records, records::WorkerListEntry, Epoch, KeyRange, RangeMap, SeqNo, Uid, WorkerId,
};
use tokio::select;

use crate::{
    cluster::CandidateWorker,
    manager::{
        assignment::RangeAssignment, check_manager_lock, split, BlobManagerInner, LockCheckError,
        WorkerStats,
    },
    store::StoreResult,
    worker::{BlobWorkerHandle, WorkerError},
};

/// Reads every persisted worker registration.
pub(crate) async fn read_worker_list(
    inner: &BlobManagerInner,
) -> StoreResult<Vec<WorkerListEntry>> {
    let subspace = keys::subspace_range(keys::WORKER_LIST_PREFIX);
    let mut tr = inner.store.transaction();
    let mut entries = Vec::new();
    let mut begin = subspace.begin.clone();
    loop {
        let attempt = tr
            .get_range(
                &KeyRange::new(begin.clone(), subspace.end.clone()),
                inner.config.scan_row_limit,
                false,
            )
            .await;
        let page = match attempt {
            Ok(page) => page,
            Err(error) => {
                tr.on_error(error).await?;
                entries.clear();
                begin = subspace.begin.clone();
                continue;
            }
        };
        for (_, value) in &page.rows {
            match records::decode_value::<WorkerListEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(error) => tracing::warn!(?error, "skipping malformed worker registration"),
            }
        }
        if !page.more {
            return Ok(entries);
        }
        let last = page.rows.last().expect("a page with more rows is non-empty");
        begin = KeyRange::single(last.0.clone()).end;
    }
}

enum AbsorbOutcome {
    Added,
    AlreadyKnown,
    /// Same stable address (or wrong data center) under an unknown
    /// identity; the impostor gets torn down.
    Duplicate,
}

/// Adds a worker to the directory and starts monitoring it, enforcing the
/// one-live-worker-per-address invariant.
pub(crate) fn absorb_worker(inner: &Arc<BlobManagerInner>, handle: BlobWorkerHandle) -> bool {
    let id = handle.id();
    let outcome = {
        let mut state = inner.state.lock().expect("manager state lock");
        if state.dead_workers.contains(&id) {
            // Mid-teardown; a scan must not resurrect it.
            return false;
        }
        if !state.worker_addresses.contains(handle.address()) && handle.entry.dc == inner.dc {
            state.worker_addresses.insert(handle.address().to_string());
            state.workers_by_id.insert(id, handle.clone());
            state.worker_stats.insert(id, WorkerStats::default());
            inner
                .metrics
                .live_workers
                .set(state.workers_by_id.len() as i64);
            AbsorbOutcome::Added
        } else if !state.workers_by_id.contains_key(&id) {
            AbsorbOutcome::Duplicate
        } else {
            AbsorbOutcome::AlreadyKnown
        }
    };

    match outcome {
        AbsorbOutcome::Added => {
            tracing::info!(worker = %id, address = handle.address(), "blob worker joined");
            inner.spawn_supervised(
                "monitor_blob_worker",
                monitor_blob_worker(inner.clone(), handle),
            );
            inner.found_workers.notify_waiters();
            true
        }
        AbsorbOutcome::Duplicate => {
            tracing::warn!(
                worker = %id,
                address = handle.address(),
                "tearing down worker with duplicate address"
            );
            inner.spawn_supervised(
                "kill_blob_worker",
                kill_blob_worker(inner.clone(), handle, false),
            );
            false
        }
        AbsorbOutcome::AlreadyKnown => false,
    }
}

/// Periodically scans the persisted worker list, absorbing registrations
/// this manager has not seen and tearing down duplicates. The previous
/// manager's workers arrive through the first scan.
pub(crate) async fn check_blob_worker_list(
    inner: Arc<BlobManagerInner>,
    mut ready: Option<tokio::sync::oneshot::Sender<()>>,
) -> anyhow::Result<()> {
    loop {
        let entries = read_worker_list(&inner).await?;
        for entry in entries {
            let already_tracked = {
                let state = inner.state.lock().expect("manager state lock");
                state.workers_by_id.contains_key(&entry.id)
                    || state.dead_workers.contains(&entry.id)
            };
            if already_tracked {
                continue;
            }
            let connected = inner.worker_factory.connect(&entry).await;
            match connected {
                Ok(client) => {
                    absorb_worker(&inner, BlobWorkerHandle { entry, client });
                }
                Err(error) => {
                    tracing::debug!(?error, worker = %entry.id, "cannot reach listed worker");
                }
            }
        }
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
        {
            let state = inner.state.lock().expect("manager state lock");
            if !state.workers_by_id.is_empty() {
                inner.found_workers.notify_waiters();
            }
        }
        tokio::time::sleep(inner.config.worker_list_fetch_interval).await;
    }
}

enum MonitorOutcome {
    Replaced,
    WorkerFailed,
}

/// Watches one worker: races its failure detector against the status
/// stream, and tears the worker down when either says it is gone.
pub(crate) async fn monitor_blob_worker(
    inner: Arc<BlobManagerInner>,
    handle: BlobWorkerHandle,
) -> anyhow::Result<()> {
    let client = handle.client.clone();
    let outcome = select! {
        _ = client.wait_failure() => {
            tracing::info!(worker = %handle.id(), "blob worker failed");
            MonitorOutcome::WorkerFailed
        }
        status = monitor_blob_worker_status(&inner, &handle) => status?,
    };

    match outcome {
        MonitorOutcome::Replaced => {
            // The manager is on its way out; nothing to tear down.
            assert!(inner.is_replaced());
            Ok(())
        }
        MonitorOutcome::WorkerFailed => kill_blob_worker(inner, handle, true).await,
    }
}

/// Consumes one worker's granule status stream, spawning a split evaluation
/// for every fresh split request on a granule this manager still maps to
/// that worker.
async fn monitor_blob_worker_status(
    inner: &Arc<BlobManagerInner>,
    handle: &BlobWorkerHandle,
) -> anyhow::Result<MonitorOutcome> {
    // The first splits must observe the recovered assignment map.
    inner.recovered().await;

    let mut last_seen: RangeMap<(Epoch, SeqNo)> = RangeMap::new(KeyRange::normal(), (0, 0));
    let mut backoff = inner.config.stream_backoff_min;

    loop {
        let error = match handle.client.granule_status_stream(inner.epoch).await {
            Ok(mut stream) => loop {
                match stream.next().await {
                    Some(Ok(report)) => {
                        backoff = inner.config.stream_backoff_min;

                        if report.epoch > inner.epoch {
                            tracing::info!(
                                worker = %handle.id(),
                                epoch = report.epoch,
                                "worker reports a newer manager"
                            );
                            inner.signal_replaced();
                            return Ok(MonitorOutcome::Replaced);
                        }

                        let owned = {
                            let state = inner.state.lock().expect("manager state lock");
                            let (entry, owner) =
                                state.worker_assignments.containing(&report.range.begin);
                            entry == report.range && *owner == handle.id()
                        };
                        if !owned {
                            // A revoke may already be in flight; stale view.
                            tracing::debug!(
                                worker = %handle.id(),
                                range = %report.range,
                                "ignoring status for a granule the worker no longer owns"
                            );
                            continue;
                        }

                        let (seen_range, seen_stamp) = {
                            let (range, stamp) = last_seen.containing(&report.range.begin);
                            (range, *stamp)
                        };
                        if seen_range == report.range
                            && seen_stamp == (report.epoch, report.seq)
                        {
                            tracing::debug!(
                                range = %report.range,
                                "ignoring repeated granule status"
                            );
                            continue;
                        }

                        if report.do_split {
                            last_seen.insert(&report.range, (report.epoch, report.seq));
                            inner.spawn_supervised(
                                "maybe_split_range",
                                split::maybe_split_range(
                                    inner.clone(),
                                    handle.id(),
                                    report.range,
                                    report.granule_id,
                                    report.start_version,
                                    report.latest_version,
                                    report.write_hot_split,
                                ),
                            );
                        }
                    }
                    Some(Err(error)) => break error,
                    // The stream never ends cleanly; treat it like a closed
                    // endpoint.
                    None => break WorkerError::EndpointClosed,
                }
            },
            Err(error) => error,
        };

        match error {
            WorkerError::ManagerReplaced => {
                inner.signal_replaced();
                return Ok(MonitorOutcome::Replaced);
            }
            error if error.is_transient() => {
                tracing::debug!(
                    ?error,
                    worker = %handle.id(),
                    "status stream hiccup, reconnecting"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.mul_f64(1.5).min(inner.config.stream_backoff_max);
            }
            WorkerError::EndpointClosed => return Ok(MonitorOutcome::WorkerFailed),
            error => {
                tracing::error!(
                    ?error,
                    worker = %handle.id(),
                    "unexpected error on worker status stream"
                );
                return Err(anyhow::Error::from(error).context("worker status monitoring failed"));
            }
        }
    }
}

/// Tears down one worker: quarantines it, deregisters it, takes back every
/// range it owned, and asks it to halt.
pub(crate) async fn kill_blob_worker(
    inner: Arc<BlobManagerInner>,
    handle: BlobWorkerHandle,
    registered: bool,
) -> anyhow::Result<()> {
    let id = handle.id();
    tracing::info!(worker = %id, registered, "killing blob worker");

    if registered {
        let mut state = inner.state.lock().expect("manager state lock");
        state.dead_workers.insert(id);
        state.worker_stats.remove(&id);
        state.workers_by_id.remove(&id);
        state.worker_addresses.remove(handle.address());
        inner
            .metrics
            .live_workers
            .set(state.workers_by_id.len() as i64);
        inner.metrics.workers_killed_total.inc();
    }

    let deregister = tokio::spawn(deregister_blob_worker(inner.clone(), id));

    // Snapshot first: enqueueing mutates the assignment map.
    let ranges_to_move: Vec<KeyRange> = {
        let state = inner.state.lock().expect("manager state lock");
        state
            .worker_assignments
            .ranges()
            .into_iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(range, _)| range)
            .collect()
    };
    for range in ranges_to_move {
        inner
            .ranges_to_assign
            .send(RangeAssignment::revoke(range.clone(), None, false));
        inner
            .ranges_to_assign
            .send(RangeAssignment::assign(range, None));
    }

    inner.spawn_supervised(
        "halt_blob_worker",
        halt_blob_worker(inner.clone(), handle.clone()),
    );

    deregister.await.map_err(anyhow::Error::from)??;
    inner.ranges_to_assign.on_empty().await;
    // Let the assigner process its final pop before the quarantine lifts.
    tokio::task::yield_now().await;

    inner.trigger_recruiting();
    if registered {
        let mut state = inner.state.lock().expect("manager state lock");
        state.dead_workers.remove(&id);
    }
    Ok(())
}

/// Removes a worker's persisted registration, fenced by the manager lock.
async fn deregister_blob_worker(inner: Arc<BlobManagerInner>, id: WorkerId) -> anyhow::Result<()> {
    let mut tr = inner.store.transaction();
    loop {
        let checked = check_manager_lock(tr.as_mut(), &inner).await;
        match checked {
            Ok(()) => {}
            Err(LockCheckError::Replaced) => return Ok(()),
            Err(LockCheckError::Store(error)) => {
                tr.on_error(error).await?;
                continue;
            }
        }
        let key = keys::worker_list_key_for(id);
        tr.add_read_conflict(&KeyRange::single(key.clone()));
        tr.clear(&key);
        let committed = tr.commit().await;
        match committed {
            Ok(()) => {
                tracing::debug!(worker = %id, "deregistered blob worker");
                return Ok(());
            }
            Err(error) => tr.on_error(error).await?,
        }
    }
}

/// Best-effort halt; the worker may already be gone.
async fn halt_blob_worker(inner: Arc<BlobManagerInner>, handle: BlobWorkerHandle) -> anyhow::Result<()> {
    match handle.client.halt(inner.epoch, inner.id).await {
        Ok(()) => {}
        Err(WorkerError::ManagerReplaced) => inner.signal_replaced(),
        Err(error) => {
            tracing::debug!(?error, worker = %handle.id(), "halt request failed");
        }
    }
    Ok(())
}

/// Recruits blob workers whenever there is capacity to place, excluding
/// every address that is live or already being recruited.
pub(crate) async fn blob_worker_recruiter(inner: Arc<BlobManagerInner>) -> anyhow::Result<()> {
    // Existing workers must be acknowledged first, or recovery would race
    // recruitment onto their addresses.
    inner.start_recruiting.notified().await;

    loop {
        let exclude: Vec<String> = {
            let state = inner.state.lock().expect("manager state lock");
            let mut exclude: Vec<String> = state
                .worker_addresses
                .iter()
                .chain(state.recruiting_addresses.iter())
                .cloned()
                .collect();
            exclude.sort();
            exclude
        };

        select! {
            candidate = inner.cluster.recruit_blob_worker(&exclude) => match candidate {
                Ok(candidate) => {
                    inner.spawn_supervised(
                        "initialize_blob_worker",
                        initialize_blob_worker(inner.clone(), candidate),
                    );
                }
                Err(WorkerError::Timeout) => {}
                Err(error) => {
                    tracing::debug!(?error, "recruitment request failed");
                }
            },
            _ = inner.restart_recruiting.notified() => {}
        }
        // Debounce so a burst of triggers costs one pass.
        tokio::time::sleep(inner.config.debounce_recruiting_delay).await;
    }
}

/// Asks one candidate process to start a blob worker.
async fn initialize_blob_worker(
    inner: Arc<BlobManagerInner>,
    candidate: CandidateWorker,
) -> anyhow::Result<()> {
    let skip = {
        let mut state = inner.state.lock().expect("manager state lock");
        if state.worker_addresses.contains(&candidate.address)
            || state.recruiting_addresses.contains(&candidate.address)
        {
            true
        } else {
            state.recruiting_addresses.insert(candidate.address.clone());
            false
        }
    };

    if !skip {
        inner.recruiting_count.send_modify(|count| *count += 1);
        let interface_id = {
            let mut rng = inner.rng.lock().expect("manager rng lock");
            Uid::random(&mut *rng)
        };
        tracing::info!(address = %candidate.address, "recruiting blob worker");

        match inner
            .cluster
            .initialize_blob_worker(&candidate, interface_id)
            .await
        {
            Ok(handle) => {
                inner.metrics.workers_recruited_total.inc();
                absorb_worker(&inner, handle);
            }
            Err(WorkerError::RecruitmentFailed | WorkerError::MaybeDelivered) => {
                tracing::debug!(
                    address = %candidate.address,
                    "recruitment declined, backing off"
                );
                tokio::time::sleep(inner.config.storage_recruitment_delay).await;
            }
            Err(error) => {
                return Err(
                    anyhow::Error::from(error).context("blob worker initialization failed")
                );
            }
        }

        {
            let mut state = inner.state.lock().expect("manager state lock");
            state.recruiting_addresses.remove(&candidate.address);
        }
        inner.recruiting_count.send_modify(|count| *count -= 1);
    }

    inner.trigger_recruiting();
    Ok(())
}

/// Halts and deregisters every registered worker; used by the explicit
/// tear-down request.
pub(crate) async fn halt_blob_granules(inner: &Arc<BlobManagerInner>) -> anyhow::Result<()> {
    let entries = read_worker_list(inner).await?;
    let mut deregisters = Vec::new();
    for entry in entries {
        let connected = inner.worker_factory.connect(&entry).await;
        match connected {
            Ok(client) => {
                let handle = BlobWorkerHandle {
                    entry: entry.clone(),
                    client,
                };
                inner.spawn_supervised(
                    "halt_blob_worker",
                    halt_blob_worker(inner.clone(), handle),
                );
            }
            Err(error) => {
                tracing::debug!(?error, worker = %entry.id, "cannot reach worker for halt");
            }
        }
        deregisters.push(deregister_blob_worker(inner.clone(), entry.id));
    }
    futures::future::try_join_all(deregisters).await?;
    Ok(())
}
