// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Leader-takeover recovery.
//!
//! A new manager epoch reconstructs the assignment map from three
//! disagreeing sources: split metadata persisted by the previous manager,
//! live workers' own views of their assignments, and the store's granule
//! mapping. Conflicts are resolved by `(epoch, seq)` dominance; whatever
//! loses is explicitly revoked, whatever is unplaced is explicitly assigned.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use granite_core::{
    keys,
    records::{self, SplitBoundaryValue},
    Epoch, GranuleId, KeyRange, RangeMap, SeqNo, WorkerId,
};
use tokio::sync::oneshot;

use crate::{
    manager::{
        assignment::RangeAssignment, check_manager_lock, workers, BlobManagerInner, LockCheckError,
    },
    store::StoreResult,
};

/// An assignment claim: owner plus the `(epoch, seq)` backing the claim.
type Claim = (WorkerId, Epoch, SeqNo);

/// The unmapped claim.
const UNMAPPED: Claim = (WorkerId::NIL, 0, 0);

/// Merges one claim into `map`, enforcing `(epoch, seq)` dominance.
///
/// Claims use two special stamps: `(0, 0)` means the range is not mapped at
/// all, and `(0, 1)` is the store-mapping sentinel, which any live claim
/// dominates. When the mapping names a different worker than a dominant
/// live claim over exactly the same range, the entry is demoted to the nil
/// worker so the conflict is resolved by an explicit reassignment.
///
/// Claims that lose with a concrete owner are appended to `out_of_date` for
/// later revocation.
pub(crate) fn add_assignment(
    map: &mut RangeMap<Claim>,
    new_range: &KeyRange,
    new_id: WorkerId,
    new_epoch: Epoch,
    new_seq: SeqNo,
    mut out_of_date: Option<&mut Vec<(WorkerId, KeyRange)>>,
) {
    let pieces: Vec<(KeyRange, Claim)> = map
        .intersecting(new_range)
        .into_iter()
        .map(|(piece, claim)| (piece, *claim))
        .collect();

    let mut surviving: Vec<(KeyRange, Claim)> = Vec::new();
    let mut all_newer = true;
    for (piece, (old_id, old_epoch, old_seq)) in &pieces {
        let old_dominates =
            *old_epoch > new_epoch || (*old_epoch == new_epoch && *old_seq > new_seq);
        if old_dominates {
            let (full_entry, _) = map.containing(&piece.begin);
            if new_id != *old_id
                && !new_id.is_nil()
                && new_epoch == 0
                && new_seq == 1
                && full_entry == *new_range
            {
                // The granule mapping disagrees with the highest live
                // claim; demote so an explicit reassign settles ownership.
                surviving.push((piece.clone(), (WorkerId::NIL, *old_epoch, *old_seq)));
                all_newer = false;
            } else {
                surviving.push((piece.clone(), (*old_id, *old_epoch, *old_seq)));
            }
        } else {
            all_newer = false;
            if !new_id.is_nil() {
                // The one impossible ordering: two different workers can
                // never share one (epoch, seq) on the same granule.
                assert!(
                    *old_epoch != new_epoch || *old_seq != new_seq,
                    "conflicting owners {} and {} at ({}, {}) for {}",
                    old_id,
                    new_id,
                    new_epoch,
                    new_seq,
                    piece
                );
            }
            if let Some(out) = out_of_date.as_deref_mut() {
                let strictly_older =
                    *old_epoch < new_epoch || (*old_epoch == new_epoch && *old_seq < new_seq);
                if !old_id.is_nil() && strictly_older {
                    out.push((*old_id, piece.clone()));
                }
            }
        }
    }

    if !all_newer {
        // The claim supersedes something: insert it, then restore whatever
        // still dominates on top of it.
        map.insert(new_range, (new_id, new_epoch, new_seq));
        if !surviving.is_empty() {
            if let Some(out) = out_of_date.as_deref_mut() {
                if !new_id.is_nil() {
                    out.push((new_id, new_range.clone()));
                }
            }
            for (piece, claim) in surviving {
                map.insert(&piece, claim);
            }
        }
    } else if let Some(out) = out_of_date {
        // Entirely dominated: the claimant no longer owns any of this.
        if !new_id.is_nil() {
            out.push((new_id, new_range.clone()));
        }
    }
}

/// Pages through a whole subspace with the store retry contract.
async fn scan_subspace(
    inner: &BlobManagerInner,
    prefix: &[u8],
) -> StoreResult<Vec<(Bytes, Bytes)>> {
    let subspace = keys::subspace_range(prefix);
    let mut tr = inner.store.transaction();
    let mut rows = Vec::new();
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
                rows.clear();
                begin = subspace.begin.clone();
                continue;
            }
        };
        rows.extend(page.rows.iter().cloned());
        if !page.more {
            return Ok(rows);
        }
        let last = page.rows.last().expect("a page with more rows is non-empty");
        begin = KeyRange::single(last.0.clone()).end;
    }
}

/// Collects in-progress splits into an interval map stamped with each
/// split's `(epoch, seq)`.
async fn collect_in_progress_splits(
    inner: &BlobManagerInner,
) -> StoreResult<RangeMap<Claim>> {
    let mut in_progress = RangeMap::new(KeyRange::normal(), UNMAPPED);

    let rows = scan_subspace(inner, keys::SPLIT_BOUNDARY_PREFIX).await?;
    let mut per_parent: BTreeMap<GranuleId, (Option<SplitBoundaryValue>, Vec<Bytes>)> =
        BTreeMap::new();
    for (key, value) in &rows {
        let (parent, boundary) = match keys::decode_split_boundary_key(key) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(?error, "skipping malformed split boundary row");
                continue;
            }
        };
        let entry = per_parent.entry(parent).or_default();
        if boundary.as_ref() == keys::SPLIT_BOUNDARY_SENTINEL {
            match records::decode_value::<SplitBoundaryValue>(value) {
                Ok(stamp) => entry.0 = Some(stamp),
                Err(error) => tracing::warn!(?error, %parent, "bad split sentinel value"),
            }
        } else {
            entry.1.push(boundary);
        }
    }

    for (parent, (stamp, mut boundaries)) in per_parent {
        let Some(stamp) = stamp else {
            tracing::warn!(%parent, "split boundaries without a sentinel; skipping");
            continue;
        };
        assert!(stamp.epoch != 0 && stamp.seq != 0);
        boundaries.sort();
        tracing::debug!(
            %parent,
            epoch = stamp.epoch,
            seq = stamp.seq,
            children = boundaries.len().saturating_sub(1),
            "found in-progress split"
        );
        for window in boundaries.windows(2) {
            let child = KeyRange::new(window[0].clone(), window[1].clone());
            add_assignment(
                &mut in_progress,
                &child,
                WorkerId::NIL,
                stamp.epoch,
                stamp.seq,
                None,
            );
        }
    }
    Ok(in_progress)
}

/// Reconstructs the previous incarnation's state; runs once per epoch
/// before any normal work starts.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn recover_blob_manager(inner: Arc<BlobManagerInner>) -> anyhow::Result<()> {
    // Phase 1: discover living workers from the persisted list and start
    // monitoring them.
    let (ready_tx, ready_rx) = oneshot::channel();
    inner.spawn_supervised(
        "check_blob_worker_list",
        workers::check_blob_worker_list(inner.clone(), Some(ready_tx)),
    );
    ready_rx
        .await
        .map_err(|_| anyhow::anyhow!("worker list scan ended before recovery"))?;

    let starting_workers = {
        let state = inner.state.lock().expect("manager state lock");
        state
            .workers_by_id
            .values()
            .cloned()
            .collect::<Vec<_>>()
    };

    // Existing workers are acknowledged; recruitment may begin.
    inner.start_recruiting.notify_one();

    if inner.epoch == 1 {
        // First-ever incarnation: nothing to recover.
        tracing::info!("first manager epoch, skipping recovery");
        inner.mark_recovered();
        return Ok(());
    }

    // Phase 2: collect in-progress splits. This must happen before asking
    // workers, because workers clear split boundaries as they persist their
    // assignments.
    let in_progress_splits = collect_in_progress_splits(&inner).await?;

    // Phase 3: ask every starting worker for its assignment snapshot. A
    // worker's reply reflects everything it accepted from the old manager;
    // everything after the reply gets rejected by epoch fencing.
    let mut assignments = RangeMap::new(KeyRange::normal(), UNMAPPED);
    let mut out_of_date: Vec<(WorkerId, KeyRange)> = Vec::new();
    let mut reporting_workers = 0usize;
    for handle in &starting_workers {
        let reply = tokio::time::timeout(
            inner.config.worker_timeout,
            handle.client.granule_assignments(inner.epoch),
        )
        .await;
        match reply {
            Ok(Ok(owned)) => {
                reporting_workers += 1;
                {
                    let mut state = inner.state.lock().expect("manager state lock");
                    for assigned in &owned {
                        state.known_blob_ranges.insert(&assigned.range, true);
                    }
                    if let Some(stats) = state.worker_stats.get_mut(&handle.id()) {
                        stats.granules_assigned = owned.len() as i64;
                    }
                }
                for assigned in owned {
                    add_assignment(
                        &mut assignments,
                        &assigned.range,
                        handle.id(),
                        assigned.epoch_assigned,
                        assigned.seq_assigned,
                        Some(&mut out_of_date),
                    );
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(?error, worker = %handle.id(), "worker did not report assignments");
            }
            Err(_) => {
                tracing::warn!(worker = %handle.id(), "worker assignment request timed out");
            }
        }
    }
    tracing::debug!(
        reporting = reporting_workers,
        total = starting_workers.len(),
        "gathered worker assignment snapshots"
    );

    // Phase 4: fill gaps from the store's granule mapping. Workers have no
    // consistent cross-worker snapshot, so the mapping arbitrates ranges
    // nobody reclaimed; entries get the mapping sentinel stamp (0, 1).
    let mapping_rows = scan_subspace(&inner, keys::GRANULE_MAPPING_PREFIX).await?;
    for window in mapping_rows.windows(2) {
        let (row_key, row_value) = &window[0];
        if row_value.is_empty() {
            continue;
        }
        let begin = keys::decode_granule_mapping_key(row_key)
            .map_err(|err| anyhow::anyhow!("bad mapping key: {err}"))?;
        let end = keys::decode_granule_mapping_key(&window[1].0)
            .map_err(|err| anyhow::anyhow!("bad mapping key: {err}"))?;
        let owner: WorkerId = records::decode_value(row_value)
            .map_err(|err| anyhow::anyhow!("bad mapping value: {err}"))?;
        let range = KeyRange::new(begin, end);
        add_assignment(&mut assignments, &range, owner, 0, 1, None);
        let mut state = inner.state.lock().expect("manager state lock");
        state.known_blob_ranges.insert(&range, true);
    }

    // Phase 6: lay the in-progress splits on top; they postdate whatever
    // the mapping said about the parent range.
    let split_claims: Vec<(KeyRange, Claim)> = in_progress_splits
        .intersecting(&KeyRange::normal())
        .into_iter()
        .map(|(range, claim)| (range, *claim))
        .collect();
    for (range, (_, epoch, seq)) in split_claims {
        if epoch == 0 || seq == 0 {
            continue;
        }
        add_assignment(
            &mut assignments,
            &range,
            WorkerId::NIL,
            epoch,
            seq,
            Some(&mut out_of_date),
        );
    }

    // Phase 7: confirm the lock one more time before taking ownership of
    // every range.
    let mut tr = inner.store.transaction();
    loop {
        let checked = check_manager_lock(tr.as_mut(), &inner).await;
        match checked {
            Ok(()) => break,
            Err(LockCheckError::Replaced) => return Ok(()),
            Err(LockCheckError::Store(error)) => tr.on_error(error).await?,
        }
    }

    // Phase 8: reconcile with the workers still alive now; some may have
    // died since reporting.
    let ending_workers: std::collections::HashSet<WorkerId> = {
        let state = inner.state.lock().expect("manager state lock");
        state.workers_by_id.keys().copied().collect()
    };

    for (worker, range) in &out_of_date {
        tracing::debug!(%range, %worker, "revoking out-of-date assignment");
        inner
            .ranges_to_assign
            .send(RangeAssignment::revoke(range.clone(), Some(*worker), false));
    }

    let final_claims: Vec<(KeyRange, Claim)> = assignments
        .intersecting(&KeyRange::normal())
        .into_iter()
        .map(|(range, claim)| (range, *claim))
        .collect();

    let mut explicit_assignments = 0usize;
    let mut granules = 0usize;
    for (range, (worker, epoch, seq)) in final_claims {
        if epoch == 0 && seq == 0 {
            continue;
        }
        granules += 1;
        {
            let mut state = inner.state.lock().expect("manager state lock");
            state.worker_assignments.insert(&range, worker);
        }
        // A range already reclaimed by a live worker stays put; everything
        // else needs an explicit assign.
        if worker.is_nil() || epoch == 0 || !ending_workers.contains(&worker) {
            inner.ranges_to_assign.send(RangeAssignment::assign(
                range,
                (!worker.is_nil()).then_some(worker),
            ));
            explicit_assignments += 1;
        }
    }
    inner.metrics.assigned_granules.set(granules as i64);

    tracing::info!(
        granules,
        assigned = explicit_assignments,
        revoked = out_of_date.len(),
        "blob manager recovered"
    );
    inner.mark_recovered();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: &str, end: &str) -> KeyRange {
        KeyRange::new(
            Bytes::copy_from_slice(begin.as_bytes()),
            Bytes::copy_from_slice(end.as_bytes()),
        )
    }

    fn worker(byte: u8) -> WorkerId {
        WorkerId::from_bytes([byte; 16])
    }

    fn claims(map: &RangeMap<Claim>) -> Vec<(KeyRange, Claim)> {
        map.intersecting(&KeyRange::normal())
            .into_iter()
            .map(|(r, c)| (r, *c))
            .collect()
    }

    #[test]
    fn newer_claim_overwrites_and_revokes_older() {
        let mut map = RangeMap::new(KeyRange::normal(), UNMAPPED);
        let mut out_of_date = Vec::new();

        add_assignment(&mut map, &range("a", "m"), worker(1), 1, 5, Some(&mut out_of_date));
        add_assignment(&mut map, &range("a", "m"), worker(2), 2, 3, Some(&mut out_of_date));

        assert_eq!(out_of_date, vec![(worker(1), range("a", "m"))]);
        let got = claims(&map);
        assert!(got.contains(&(range("a", "m"), (worker(2), 2, 3))));
    }

    #[test]
    fn dominated_claim_is_dropped_and_marked_out_of_date() {
        let mut map = RangeMap::new(KeyRange::normal(), UNMAPPED);
        let mut out_of_date = Vec::new();

        add_assignment(&mut map, &range("a", "m"), worker(2), 2, 3, None);
        add_assignment(&mut map, &range("a", "m"), worker(1), 1, 9, Some(&mut out_of_date));

        assert_eq!(out_of_date, vec![(worker(1), range("a", "m"))]);
        assert!(claims(&map).contains(&(range("a", "m"), (worker(2), 2, 3))));
    }

    #[test]
    fn mapping_sentinel_disagreement_demotes_to_explicit_reassign() {
        let mut map = RangeMap::new(KeyRange::normal(), UNMAPPED);

        add_assignment(&mut map, &range("a", "m"), worker(1), 2, 5, None);
        // The store mapping claims a different owner for the same range.
        add_assignment(&mut map, &range("a", "m"), worker(2), 0, 1, None);

        assert!(claims(&map).contains(&(range("a", "m"), (WorkerId::NIL, 2, 5))));
    }

    #[test]
    fn mapping_sentinel_agreement_keeps_live_claim() {
        let mut map = RangeMap::new(KeyRange::normal(), UNMAPPED);

        add_assignment(&mut map, &range("a", "m"), worker(1), 2, 5, None);
        add_assignment(&mut map, &range("a", "m"), worker(1), 0, 1, None);

        assert!(claims(&map).contains(&(range("a", "m"), (worker(1), 2, 5))));
    }

    #[test]
    fn partial_overlap_keeps_dominant_pieces() {
        let mut map = RangeMap::new(KeyRange::normal(), UNMAPPED);
        let mut out_of_date = Vec::new();

        add_assignment(&mut map, &range("a", "z"), worker(1), 3, 1, None);
        // A smaller, older claim inside loses everywhere it overlaps.
        add_assignment(&mut map, &range("c", "f"), worker(2), 2, 8, Some(&mut out_of_date));

        assert_eq!(out_of_date, vec![(worker(2), range("c", "f"))]);
        let got = claims(&map);
        assert!(got.contains(&(range("a", "z"), (worker(1), 3, 1))));

        // And a newer claim inside wins just its piece.
        add_assignment(&mut map, &range("c", "f"), worker(3), 4, 1, Some(&mut out_of_date));
        let got = claims(&map);
        assert!(got.contains(&(range("c", "f"), (worker(3), 4, 1))));
        assert!(got.contains(&(range("a", "c"), (worker(1), 3, 1))));
        assert!(got.contains(&(range("f", "z"), (worker(1), 3, 1))));
    }
}
