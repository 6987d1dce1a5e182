// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! The assignment engine.
//!
//! A single consumer drains the `rangesToAssign` queue, stamps every item
//! with the next sequence number, updates the in-memory assignment map, and
//! dispatches the request to a worker. Because one task does the stamping
//! and dispatching, any two operations on overlapping ranges are strictly
//! ordered by `(epoch, seq)` and workers can reject stale requests from this
//! manager or any prior one.

use std::{collections::HashMap, sync::Arc};

use granite_core::{KeyRange, SeqNo, WorkerId};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    manager::{BlobManagerInner, InFlightAssign, WorkerStats},
    metrics::{OUTCOME_CONFLICT, OUTCOME_OK, OUTCOME_RETRIED},
    worker::{AssignKind, AssignRangeRequest, RevokeRangeRequest, WorkerError},
};

/// One queued decision for the engine.
#[derive(Debug, Clone)]
pub(crate) struct RangeAssignment {
    pub range: KeyRange,
    /// Pins the request to a specific worker; `None` (or the nil id) lets
    /// the engine pick the least-loaded one.
    pub worker: Option<WorkerId>,
    pub detail: AssignmentDetail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignmentDetail {
    Assign { kind: AssignKind },
    Revoke { dispose: bool },
}

impl RangeAssignment {
    pub fn assign(range: KeyRange, worker: Option<WorkerId>) -> Self {
        Self {
            range,
            worker,
            detail: AssignmentDetail::Assign {
                kind: AssignKind::Normal,
            },
        }
    }

    /// A re-snapshot request pinned to the current owner.
    pub fn assign_continue(range: KeyRange, worker: WorkerId) -> Self {
        Self {
            range,
            worker: Some(worker),
            detail: AssignmentDetail::Assign {
                kind: AssignKind::Continue,
            },
        }
    }

    pub fn revoke(range: KeyRange, worker: Option<WorkerId>, dispose: bool) -> Self {
        Self {
            range,
            worker,
            detail: AssignmentDetail::Revoke { dispose },
        }
    }

    fn pinned_worker(&self) -> Option<WorkerId> {
        self.worker.filter(|worker| !worker.is_nil())
    }
}

/// The single consumer of the assignment queue.
pub(crate) async fn range_assigner(
    inner: Arc<BlobManagerInner>,
    mut rx: mpsc::UnboundedReceiver<RangeAssignment>,
) -> anyhow::Result<()> {
    while let Some(assignment) = rx.recv().await {
        handle_assignment(&inner, assignment).await;
        inner.ranges_to_assign.mark_processed();
    }
    Ok(())
}

async fn handle_assignment(inner: &Arc<BlobManagerInner>, assignment: RangeAssignment) {
    let seq = inner.allocate_seq();
    match assignment.detail {
        AssignmentDetail::Assign { kind } => {
            handle_assign(inner, assignment, kind, seq).await;
        }
        AssignmentDetail::Revoke { dispose } => handle_revoke(inner, assignment, dispose, seq),
    }
}

async fn handle_assign(
    inner: &Arc<BlobManagerInner>,
    assignment: RangeAssignment,
    kind: AssignKind,
    seq: SeqNo,
) {
    let skip = {
        let state = inner.state.lock().expect("manager state lock");
        let intersecting = state.worker_assignments.intersecting(&assignment.range);
        let mut skip = false;
        if kind == AssignKind::Continue {
            let pinned = assignment
                .pinned_worker()
                .expect("continue assignments always pin a worker");
            for (range, owner) in &intersecting {
                if *range != assignment.range || **owner != pinned {
                    // The assignment changed while a split evaluation was in
                    // flight; the stale continue is dropped silently.
                    skip = true;
                }
            }
        }
        assert_eq!(
            intersecting.len(),
            1,
            "assign target {} must cover exactly one assignment entry",
            assignment.range
        );
        skip
    };
    if skip {
        tracing::debug!(
            range = %assignment.range,
            seq,
            "dropping out-of-date continue assignment"
        );
        return;
    }

    let worker_id = match assignment.pinned_worker() {
        Some(worker) => worker,
        None => pick_worker_for_assign(inner).await,
    };

    {
        let mut state = inner.state.lock().expect("manager state lock");
        state
            .worker_assignments
            .insert(&assignment.range, worker_id);
        // A continue is not a new granule for the worker.
        if kind != AssignKind::Continue {
            if let Some(stats) = state.worker_stats.get_mut(&worker_id) {
                stats.granules_assigned += 1;
            }
        }
    }

    let token = CancellationToken::new();
    let task_id = inner.next_assign_task_id();
    {
        let mut in_flight = inner
            .assigns_in_progress
            .lock()
            .expect("assigns-in-progress lock");
        if let Some(previous) = in_flight.insert(
            assignment.range.clone(),
            InFlightAssign {
                token: token.clone(),
                task_id,
            },
        ) {
            previous.token.cancel();
        }
    }

    inner.spawn_supervised(
        "do_range_assignment",
        do_range_assignment(
            inner.clone(),
            assignment,
            kind,
            worker_id,
            seq,
            Some((token, task_id)),
        ),
    );
}

fn handle_revoke(
    inner: &Arc<BlobManagerInner>,
    assignment: RangeAssignment,
    dispose: bool,
    seq: SeqNo,
) {
    if let Some(worker) = assignment.pinned_worker() {
        // Revoke this exact range from this exact worker; recovery cleanup
        // and worker teardown come through here.
        {
            let mut state = inner.state.lock().expect("manager state lock");
            if let Some(stats) = state.worker_stats.get_mut(&worker) {
                stats.granules_assigned -= 1;
            }
        }
        inner.spawn_supervised(
            "do_range_assignment",
            do_range_assignment(
                inner.clone(),
                assignment.clone(),
                AssignKind::Normal,
                worker,
                seq,
                None,
            ),
        );
    } else {
        // Revoke from whoever owns each intersecting piece right now, then
        // mark the whole range unplaced. Disjoint pieces sharing one seq is
        // fine; they are part of the same logical change.
        let owners = {
            let mut state = inner.state.lock().expect("manager state lock");
            let mut owners = Vec::new();
            for (piece, owner) in state.worker_assignments.intersecting(&assignment.range) {
                let (entry, _) = state.worker_assignments.containing(&piece.begin);
                assert!(
                    assignment.range.contains_range(&entry),
                    "revoke of {} would truncate assignment entry {}",
                    assignment.range,
                    entry
                );
                owners.push(*owner);
            }
            for owner in &owners {
                if let Some(stats) = state.worker_stats.get_mut(owner) {
                    stats.granules_assigned -= 1;
                }
            }
            state
                .worker_assignments
                .insert(&assignment.range, WorkerId::NIL);
            owners
        };
        for owner in owners {
            inner.spawn_supervised(
                "do_range_assignment",
                do_range_assignment(
                    inner.clone(),
                    assignment.clone(),
                    AssignKind::Normal,
                    owner,
                    seq,
                    None,
                ),
            );
        }
    }

    // Any in-flight assign for this exact range is now moot.
    if let Some(previous) = inner
        .assigns_in_progress
        .lock()
        .expect("assigns-in-progress lock")
        .remove(&assignment.range)
    {
        previous.token.cancel();
    }
}

/// The minimal-load candidate set, in id order so seeded runs replay.
pub(crate) fn least_loaded_workers(stats: &HashMap<WorkerId, WorkerStats>) -> Vec<WorkerId> {
    let mut min_assigned = i64::MAX;
    let mut eligible = Vec::new();
    for (id, stats) in stats {
        if stats.granules_assigned < min_assigned {
            min_assigned = stats.granules_assigned;
            eligible.clear();
            eligible.push(*id);
        } else if stats.granules_assigned == min_assigned {
            eligible.push(*id);
        }
    }
    eligible.sort();
    eligible
}

/// Picks the worker with the fewest assigned granules, breaking ties
/// uniformly at random. Waits for workers when none are alive.
async fn pick_worker_for_assign(inner: &Arc<BlobManagerInner>) -> WorkerId {
    loop {
        let picked = {
            let state = inner.state.lock().expect("manager state lock");
            let eligible = least_loaded_workers(&state.worker_stats);
            (!eligible.is_empty()).then(|| eligible[inner.random_in_range(eligible.len())])
        };
        if let Some(worker) = picked {
            return worker;
        }
        tracing::debug!("no live workers, waiting before assigning granules");
        inner.trigger_recruiting();
        let found = inner.found_workers.notified();
        let mut recruiting_rx = inner.recruiting_count.subscribe();
        select! {
            _ = found => {}
            // The channel only closes at teardown, when this task is about
            // to be cancelled anyway.
            _ = recruiting_rx.changed() => {}
        }
    }
}

/// Sends one assign or revoke to one worker and resolves failures locally:
/// replacement and conflicts are signalled, everything else is re-enqueued
/// or dropped depending on the request.
async fn do_range_assignment(
    inner: Arc<BlobManagerInner>,
    assignment: RangeAssignment,
    kind: AssignKind,
    worker_id: WorkerId,
    seq: SeqNo,
    cancel: Option<(CancellationToken, u64)>,
) -> anyhow::Result<()> {
    let is_assign = matches!(assignment.detail, AssignmentDetail::Assign { .. });
    tracing::debug!(
        epoch = inner.epoch,
        seq,
        range = %assignment.range,
        worker = %worker_id,
        assign = is_assign,
        "dispatching range request"
    );

    let client = {
        let state = inner.state.lock().expect("manager state lock");
        state
            .workers_by_id
            .get(&worker_id)
            .map(|handle| handle.client.clone())
    };

    let result = match (&assignment.detail, client) {
        (AssignmentDetail::Assign { .. }, Some(client)) => {
            let request = AssignRangeRequest {
                range: assignment.range.clone(),
                epoch: inner.epoch,
                seq,
                kind,
            };
            let (token, _) = cancel.as_ref().expect("assigns carry a cancel token");
            select! {
                _ = token.cancelled() => {
                    tracing::debug!(range = %assignment.range, "assign cancelled by revoke");
                    remove_in_flight(&inner, &assignment.range, cancel.as_ref());
                    return Ok(());
                }
                result = client.assign_range(request) => result,
            }
        }
        // The chosen worker died between pick and dispatch; fall through to
        // the retry path so the range lands somewhere else.
        (AssignmentDetail::Assign { .. }, None) => Err(WorkerError::ConnectionFailed),
        (AssignmentDetail::Revoke { dispose }, Some(client)) => {
            let request = RevokeRangeRequest {
                range: assignment.range.clone(),
                epoch: inner.epoch,
                seq,
                dispose: *dispose,
            };
            client.revoke_range(request).await
        }
        // Revoking from a dead worker is trivially complete.
        (AssignmentDetail::Revoke { .. }, None) => Ok(()),
    };

    remove_in_flight(&inner, &assignment.range, cancel.as_ref());

    let counter = if is_assign {
        &inner.metrics.range_assignments_total
    } else {
        &inner.metrics.range_revokes_total
    };

    match result {
        Ok(()) => {
            counter.with_label_values(&[OUTCOME_OK]).inc();
        }
        Err(WorkerError::ManagerReplaced) => {
            inner.signal_replaced();
        }
        Err(WorkerError::AssignmentConflict) => {
            // Another owner or a newer manager exists. If this manager had
            // raced itself, the in-flight task would have been cancelled, so
            // suspect a takeover and verify the lock. Never retried.
            counter.with_label_values(&[OUTCOME_CONFLICT]).inc();
            tracing::debug!(
                range = %assignment.range,
                worker = %worker_id,
                "assignment conflict, requesting lock check"
            );
            inner.lock_check_requested.notify_one();
        }
        Err(error) => {
            counter.with_label_values(&[OUTCOME_RETRIED]).inc();
            if is_assign {
                tracing::debug!(
                    ?error,
                    range = %assignment.range,
                    worker = %worker_id,
                    "assign failed, requeueing"
                );
                // The request may have taken effect on the worker; revoke it
                // there before the range lands elsewhere.
                inner.ranges_to_assign.send(RangeAssignment::revoke(
                    assignment.range.clone(),
                    Some(worker_id),
                    false,
                ));
                inner
                    .ranges_to_assign
                    .send(RangeAssignment::assign(assignment.range, None));
            } else if let AssignmentDetail::Revoke { dispose: true } = assignment.detail {
                // Disposal must happen; retry wherever the owner is now.
                inner
                    .ranges_to_assign
                    .send(RangeAssignment::revoke(assignment.range, None, true));
            } else {
                tracing::debug!(
                    ?error,
                    range = %assignment.range,
                    "best-effort revoke failed, dropping"
                );
            }
        }
    }
    Ok(())
}

fn remove_in_flight(
    inner: &BlobManagerInner,
    range: &KeyRange,
    cancel: Option<&(CancellationToken, u64)>,
) {
    let Some((_, task_id)) = cancel else {
        return;
    };
    let mut in_flight = inner
        .assigns_in_progress
        .lock()
        .expect("assigns-in-progress lock");
    if in_flight
        .get(range)
        .is_some_and(|entry| entry.task_id == *task_id)
    {
        in_flight.remove(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(byte: u8) -> WorkerId {
        WorkerId::from_bytes([byte; 16])
    }

    #[test]
    fn least_loaded_prefers_minimum_and_collects_ties() {
        let mut stats = HashMap::new();
        stats.insert(worker(1), WorkerStats { granules_assigned: 3 });
        stats.insert(worker(2), WorkerStats { granules_assigned: 1 });
        stats.insert(worker(3), WorkerStats { granules_assigned: 1 });

        assert_eq!(least_loaded_workers(&stats), vec![worker(2), worker(3)]);
    }

    #[test]
    fn least_loaded_is_empty_without_workers() {
        assert!(least_loaded_workers(&HashMap::new()).is_empty());
    }
}
