// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Granule splitting: proposing boundaries from the store's byte samples
//! and committing split metadata.
//!
//! The split transaction persists everything a successor manager needs
//! before any worker hears about the split, and all of its writes are a
//! function of pre-generated child ids and the deterministic boundary list,
//! so a retry after `commit_unknown_result` lands in the same state.

use std::sync::Arc;

use granite_core::{
    keys,
    records::{
        self, GranuleHistoryValue, GranuleLock, GranuleParent, SplitBoundaryValue, SplitState,
    },
    GranuleId, Key, KeyRange, SeqNo, Version, WorkerId,
};

use crate::{
    manager::{
        assignment::RangeAssignment, check_manager_lock, BlobManagerInner, LockCheckError,
    },
    store::{SplitTarget, StoreError, StoreResult},
};

/// Proposes boundaries for `range` such that each segment approximately
/// meets the snapshot size target, with additional bandwidth-based slicing
/// for write-hot ranges. Always returns at least `[begin, end]`.
pub(crate) async fn propose_split_points(
    inner: &BlobManagerInner,
    range: &KeyRange,
    write_hot: bool,
) -> StoreResult<Vec<Key>> {
    let config = &inner.config;
    let mut backoff = config.stream_backoff_min;
    loop {
        let attempt = async {
            let estimated = inner.store.estimate_storage_metrics(range).await?;
            tracing::debug!(%range, bytes = estimated.bytes, write_hot, "estimated range size");

            if estimated.bytes <= config.snapshot_file_target_bytes && !write_hot {
                return Ok::<Vec<Key>, StoreError>(vec![range.begin.clone(), range.end.clone()]);
            }

            let mut target = SplitTarget {
                bytes: config.snapshot_file_target_bytes,
                bytes_per_ksec: config.split_bytes_per_ksec,
            };
            if write_hot {
                // Halve the observed write rate per segment, floored so a
                // hot range cannot shatter into slivers.
                target.bytes_per_ksec = target
                    .bytes_per_ksec
                    .min(estimated.bytes_per_ksec / 2)
                    .max(config.min_bytes_per_ksec);
            }

            let splits = inner
                .store
                .split_storage_metrics(range, target, estimated)
                .await?;
            if splits.len() < 2 {
                return Ok(vec![range.begin.clone(), range.end.clone()]);
            }
            assert_eq!(splits[0], range.begin, "split points must start at begin");
            assert_eq!(
                splits[splits.len() - 1],
                range.end,
                "split points must end at end"
            );
            Ok(splits)
        };
        match attempt.await {
            Ok(splits) => return Ok(splits),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                tracing::debug!(?error, %range, "retrying split proposal");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.stream_backoff_max);
            }
        }
    }
}

/// Recursively splits in the middle so the surviving boundaries stay
/// roughly balanced across the key space.
fn downsample_split(splits: &[Key], out: &mut Vec<Key>, start: usize, end: usize, remaining: usize) {
    assert!(end - start >= remaining);
    if remaining == 0 {
        return;
    }
    if end - start == remaining {
        out.extend_from_slice(&splits[start..start + remaining]);
    } else {
        let mid = (start + end) / 2;
        let start_count = (remaining - 1) / 2;
        let end_count = remaining - start_count - 1;
        assert!(mid != end && mid + 1 != start);
        downsample_split(splits, out, start, mid, start_count);
        out.push(splits[mid].clone());
        downsample_split(splits, out, mid + 1, end, end_count);
    }
}

/// Caps a boundary list at `max_fanout` segments, preserving endpoints.
pub(crate) fn enforce_fanout_cap(boundaries: Vec<Key>, max_fanout: usize) -> Vec<Key> {
    if boundaries.len() < max_fanout + 2 {
        return boundaries;
    }
    let mut capped = Vec::with_capacity(max_fanout + 1);
    capped.push(boundaries[0].clone());
    // Endpoints are kept, so max_fanout - 1 interior boundaries produce
    // exactly max_fanout segments.
    downsample_split(
        &boundaries,
        &mut capped,
        1,
        boundaries.len() - 1,
        max_fanout - 1,
    );
    capped.push(boundaries[boundaries.len() - 1].clone());
    assert_eq!(capped.len(), max_fanout + 1);
    capped
}

/// Evaluates a worker-reported split: either re-assigns the granule back to
/// its owner (too small to split) or commits split metadata and hands the
/// children to the assignment engine.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn maybe_split_range(
    inner: Arc<BlobManagerInner>,
    current_worker: WorkerId,
    granule_range: KeyRange,
    granule_id: GranuleId,
    granule_start_version: Version,
    latest_version: Version,
    write_hot: bool,
) -> anyhow::Result<()> {
    let mut new_ranges = propose_split_points(&inner, &granule_range, write_hot).await?;

    assert!(new_ranges.len() >= 2);
    if new_ranges.len() == 2 {
        // Not large enough to split; the worker re-snapshots in place.
        tracing::debug!(
            range = %granule_range,
            worker = %current_worker,
            "not splitting; continuing assignment"
        );
        inner
            .ranges_to_assign
            .send(RangeAssignment::assign_continue(
                granule_range,
                current_worker,
            ));
        return Ok(());
    }

    if new_ranges.len() >= inner.config.max_fanout + 2 {
        inner.metrics.split_downsamples_total.inc();
        new_ranges = enforce_fanout_cap(new_ranges, inner.config.max_fanout);
    }

    tracing::info!(
        range = %granule_range,
        children = new_ranges.len() - 1,
        version = latest_version,
        write_hot,
        "splitting granule"
    );
    assert_eq!(granule_range.begin, new_ranges[0]);
    assert_eq!(granule_range.end, new_ranges[new_ranges.len() - 1]);

    // Child ids must be identical across transaction retries, or a retried
    // commit would leak split state that recovery cannot clean up.
    let child_ids: Vec<GranuleId> = {
        let mut rng = inner.rng.lock().expect("manager rng lock");
        (0..new_ranges.len() - 1)
            .map(|_| GranuleId::random(&mut *rng))
            .collect()
    };

    let split_seq = inner.allocate_seq();
    let mut new_lock_seq: Option<SeqNo> = None;

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

        let attempt = persist_split(
            tr.as_mut(),
            &inner,
            &granule_range,
            granule_id,
            granule_start_version,
            latest_version,
            &new_ranges,
            &child_ids,
            split_seq,
            &mut new_lock_seq,
        )
        .await;
        match attempt {
            Ok(SplitOutcome::Committed) => break,
            Ok(SplitOutcome::Replaced) => return Ok(()),
            Err(error) => tr.on_error(error).await?,
        }
    }

    inner.metrics.granule_splits_total.inc();

    // Hand over: revoke the parent from its owner, then let the engine
    // place every child.
    inner.ranges_to_assign.send(RangeAssignment::revoke(
        granule_range.clone(),
        Some(current_worker),
        false,
    ));
    for window in new_ranges.windows(2) {
        inner.ranges_to_assign.send(RangeAssignment::assign(
            KeyRange::new(window[0].clone(), window[1].clone()),
            None,
        ));
    }

    Ok(())
}

enum SplitOutcome {
    Committed,
    Replaced,
}

#[allow(clippy::too_many_arguments)]
async fn persist_split(
    tr: &mut dyn crate::store::StoreTransaction,
    inner: &BlobManagerInner,
    granule_range: &KeyRange,
    granule_id: GranuleId,
    granule_start_version: Version,
    latest_version: Version,
    new_ranges: &[Key],
    child_ids: &[GranuleId],
    split_seq: SeqNo,
    new_lock_seq: &mut Option<SeqNo>,
) -> StoreResult<SplitOutcome> {
    // Take the parent's granule lock so no other manager can also split it.
    let lock_key = keys::granule_lock_key_for(granule_range);
    let lock_value = tr
        .get(&lock_key)
        .await?
        .ok_or_else(|| StoreError::Internal("granule lock missing for split".into()))?;
    let lock: GranuleLock = records::decode_value(&lock_value)
        .map_err(|err| StoreError::Internal(format!("bad granule lock: {err}")))?;

    if lock.epoch > inner.epoch {
        tracing::info!(
            range = %granule_range,
            observed = lock.epoch,
            "granule lock held by a newer manager"
        );
        inner.signal_replaced();
        return Ok(SplitOutcome::Replaced);
    }

    let seq = match *new_lock_seq {
        Some(seq) => {
            // A previous attempt may have committed with an unknown result,
            // so the inequality is non-strict on retries.
            assert!(
                inner.epoch > lock.epoch || (inner.epoch == lock.epoch && seq >= lock.seq),
                "lock seq out of order on retry: ({}, {}) vs owner ({}, {})",
                inner.epoch,
                seq,
                lock.epoch,
                lock.seq
            );
            seq
        }
        None => {
            let seq = inner.allocate_seq();
            assert!(
                inner.epoch > lock.epoch || (inner.epoch == lock.epoch && seq > lock.seq),
                "lock seq out of order: ({}, {}) vs owner ({}, {})",
                inner.epoch,
                seq,
                lock.epoch,
                lock.seq
            );
            *new_lock_seq = Some(seq);
            seq
        }
    };

    tr.set(
        &lock_key,
        &records::encode_value(&GranuleLock {
            epoch: inner.epoch,
            seq,
            granule_id: lock.granule_id,
        }),
    );

    // The sentinel boundary carries the (epoch, seq) of the whole split so
    // recovery can order concurrent splits of one range.
    tr.set(
        &keys::split_boundary_key_for(granule_id, keys::SPLIT_BOUNDARY_SENTINEL),
        &records::encode_value(&SplitBoundaryValue {
            epoch: inner.epoch,
            seq: split_seq,
        }),
    );

    for (index, window) in new_ranges.windows(2).enumerate() {
        let child_range = KeyRange::new(window[0].clone(), window[1].clone());
        tr.set(&keys::split_boundary_key_for(granule_id, &window[0]), b"");
        // The versionstamp makes the committed split-state row carry the
        // version the split happened at.
        tr.set_versionstamped_value(
            &keys::split_state_key_for(granule_id, child_ids[index]),
            &records::encode_value(&SplitState::Initialized),
        );
        tr.set(
            &keys::granule_history_key_for(&child_range, latest_version),
            &records::encode_value(&GranuleHistoryValue {
                granule_id: child_ids[index],
                parents: vec![GranuleParent {
                    range: granule_range.clone(),
                    start_version: granule_start_version,
                }],
            }),
        );
    }
    tr.set(
        &keys::split_boundary_key_for(granule_id, &new_ranges[new_ranges.len() - 1]),
        b"",
    );

    tr.commit().await?;
    Ok(SplitOutcome::Committed)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn boundaries(n: usize) -> Vec<Key> {
        (0..n)
            .map(|i| Bytes::from(format!("{i:04}")))
            .collect()
    }

    #[test]
    fn small_lists_pass_through_untouched() {
        let input = boundaries(11);
        assert_eq!(enforce_fanout_cap(input.clone(), 10), input);
    }

    #[test]
    fn oversized_lists_are_capped_with_endpoints_kept() {
        for n in [12, 13, 50, 200] {
            let input = boundaries(n);
            let capped = enforce_fanout_cap(input.clone(), 10);
            assert_eq!(capped.len(), 11, "n = {n}");
            assert_eq!(capped[0], input[0]);
            assert_eq!(capped[10], input[n - 1]);
            // Output is a strictly increasing subset of the input.
            for pair in capped.windows(2) {
                assert!(pair[0] < pair[1]);
            }
            for key in &capped {
                assert!(input.contains(key));
            }
        }
    }

    #[test]
    fn capped_boundaries_stay_roughly_balanced() {
        let input = boundaries(101);
        let capped = enforce_fanout_cap(input, 10);
        // Interior picks should land near the midpoints of equal halves:
        // with 100 segments and fanout 10, gaps of exactly 10 everywhere.
        let positions: Vec<usize> = capped
            .iter()
            .map(|key| {
                String::from_utf8_lossy(key)
                    .parse::<usize>()
                    .expect("numeric fixture")
            })
            .collect();
        for pair in positions.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((5..=20).contains(&gap), "unbalanced gap {gap}");
        }
    }
}
