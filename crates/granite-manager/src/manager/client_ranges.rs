// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation of user-declared blob ranges.
//!
//! The store holds the declared ranges as boundary rows; whenever the change
//! key moves, the monitor diffs that snapshot against the in-memory
//! `knownBlobRanges` map and turns the difference into work: newly active
//! ranges are split and assigned, newly inactive ranges are revoked with
//! disposal.

use std::sync::Arc;

use bytes::Bytes;
use granite_core::{keys, records, Key, KeyRange, RangeMap, WorkerId};

use crate::{
    manager::{assignment::RangeAssignment, split, BlobManagerInner},
    store::{StoreResult, StoreTransaction},
};

/// Applies one declared range to the known map, recording the pieces whose
/// active flag actually changed.
fn handle_client_range(
    known_blob_ranges: &mut RangeMap<bool>,
    ranges_to_add: &mut Vec<KeyRange>,
    ranges_to_remove: &mut Vec<KeyRange>,
    range: &KeyRange,
    active: bool,
) {
    let changed: Vec<KeyRange> = known_blob_ranges
        .intersecting(range)
        .into_iter()
        .filter(|(_, was_active)| **was_active != active)
        .map(|(overlap, _)| overlap)
        .collect();
    for overlap in changed {
        if active {
            tracing::debug!(range = %overlap, "client range becomes active");
            ranges_to_add.push(overlap);
        } else {
            tracing::debug!(range = %overlap, "client range becomes inactive");
            ranges_to_remove.push(overlap);
        }
    }
    known_blob_ranges.insert(range, active);
}

/// Diffs a store snapshot of declared ranges against the known map.
///
/// The snapshot is an ordered list of `(key, value)` boundary rows within
/// the normal range; value `"1"` starts an active span, anything else an
/// inactive one. Returns the active/inactive deltas; afterwards the known
/// map matches the snapshot and is coalesced.
pub(crate) fn update_client_blob_ranges(
    known_blob_ranges: &mut RangeMap<bool>,
    snapshot: &[(Key, Bytes)],
) -> (Vec<KeyRange>, Vec<KeyRange>) {
    let normal = KeyRange::normal();
    let mut ranges_to_add = Vec::new();
    let mut ranges_to_remove = Vec::new();

    if snapshot.is_empty() {
        // Nothing declared: the entire normal range goes inactive.
        handle_client_range(
            known_blob_ranges,
            &mut ranges_to_add,
            &mut ranges_to_remove,
            &normal,
            false,
        );
    } else {
        if snapshot[0].0 > normal.begin {
            handle_client_range(
                known_blob_ranges,
                &mut ranges_to_add,
                &mut ranges_to_remove,
                &KeyRange::new(normal.begin.clone(), snapshot[0].0.clone()),
                false,
            );
        }
        for window in snapshot.windows(2) {
            let (begin, value) = &window[0];
            if *begin >= normal.end {
                tracing::debug!(key = %granite_core::ranges::printable(begin), "ignoring boundary outside the normal range");
                break;
            }
            let active = value.as_ref() == records::BLOB_RANGE_ACTIVE;
            // Truncate anything reaching into the system keyspace.
            let end = window[1].0.clone().min(normal.end.clone());
            handle_client_range(
                known_blob_ranges,
                &mut ranges_to_add,
                &mut ranges_to_remove,
                &KeyRange::new(begin.clone(), end),
                active,
            );
        }
        let last = &snapshot[snapshot.len() - 1].0;
        if *last < normal.end {
            handle_client_range(
                known_blob_ranges,
                &mut ranges_to_add,
                &mut ranges_to_remove,
                &KeyRange::new(last.clone(), normal.end.clone()),
                false,
            );
        }
    }

    known_blob_ranges.coalesce(&normal);
    (ranges_to_add, ranges_to_remove)
}

/// Reads the full set of declared-range boundary rows.
async fn read_blob_range_rows(
    tr: &mut dyn StoreTransaction,
    row_limit: usize,
) -> StoreResult<Vec<(Key, Bytes)>> {
    let subspace = keys::subspace_range(keys::BLOB_RANGE_PREFIX);
    let mut rows = Vec::new();
    let mut begin = subspace.begin.clone();
    loop {
        let page = tr
            .get_range(&KeyRange::new(begin, subspace.end.clone()), row_limit, false)
            .await?;
        for (key, value) in &page.rows {
            rows.push((
                keys::decode_blob_range_key(key)
                    .map_err(|err| crate::store::StoreError::Internal(err.to_string()))?,
                value.clone(),
            ));
        }
        if !page.more {
            return Ok(rows);
        }
        let last = page.rows.last().expect("a page with more rows is non-empty");
        begin = KeyRange::single(last.0.clone()).end;
    }
}

/// Persists the initial (unplaced) granule mapping for freshly split client
/// ranges, in chunks so a giant declaration does not exceed one transaction.
pub(crate) async fn write_initial_granule_mapping(
    inner: &BlobManagerInner,
    boundaries: &[Key],
) -> StoreResult<()> {
    assert!(boundaries.len() >= 2);
    let chunk_rows = inner.config.initial_mapping_chunk_rows.max(1);
    let unplaced = records::encode_value(&WorkerId::NIL);

    let mut start = 0;
    while start < boundaries.len() - 1 {
        let end = (start + chunk_rows).min(boundaries.len() - 1);
        let mut tr = inner.store.transaction();
        loop {
            for boundary in &boundaries[start..end] {
                tr.set(&keys::granule_mapping_key_for(boundary), &unplaced);
            }
            // Terminate the span unless a neighboring mapping already
            // starts at the chunk-final boundary.
            let terminator = keys::granule_mapping_key_for(&boundaries[end]);
            let attempt = async {
                if tr.get(&terminator).await?.is_none() {
                    tr.set(&terminator, b"");
                }
                tr.commit().await
            }
            .await;
            match attempt {
                Ok(()) => break,
                Err(error) => tr.on_error(error).await?,
            }
        }
        tracing::debug!(
            from = %granite_core::ranges::printable(&boundaries[start]),
            to = %granite_core::ranges::printable(&boundaries[end]),
            "persisted initial granule mapping chunk"
        );
        start = end;
    }
    Ok(())
}

/// Watches the declared-range change key and reconciles on every change.
pub(crate) async fn monitor_client_ranges(inner: Arc<BlobManagerInner>) -> anyhow::Result<()> {
    // After a takeover the known map was recovered from granules, not from
    // client declarations; the first snapshot read re-baselines it.
    let mut need_to_coalesce = inner.epoch > 1;
    loop {
        let mut tr = inner.store.transaction();
        let (change_value, rows) = loop {
            let attempt = async {
                let change_value = tr.get(keys::BLOB_RANGE_CHANGE_KEY).await?;
                let rows = read_blob_range_rows(tr.as_mut(), inner.config.scan_row_limit).await?;
                Ok::<_, crate::store::StoreError>((change_value, rows))
            }
            .await;
            match attempt {
                Ok(result) => break result,
                Err(error) => tr.on_error(error).await?,
            }
        };

        let (ranges_to_add, ranges_to_remove) = {
            let mut state = inner.state.lock().expect("manager state lock");
            let deltas = update_client_blob_ranges(&mut state.known_blob_ranges, &rows);
            if need_to_coalesce {
                need_to_coalesce = false;
                for window in rows.windows(2) {
                    let active = window[0].1.as_ref() == records::BLOB_RANGE_ACTIVE;
                    let range = KeyRange::new(window[0].0.clone(), window[1].0.clone());
                    state.known_blob_ranges.insert(&range, active);
                }
                state.known_blob_ranges.coalesce(&KeyRange::normal());
            }
            deltas
        };

        for range in ranges_to_remove {
            tracing::info!(%range, "revoking deactivated client range");
            inner
                .ranges_to_assign
                .send(RangeAssignment::revoke(range, None, true));
        }

        for range in ranges_to_add {
            let boundaries = split::propose_split_points(&inner, &range, false).await?;
            tracing::info!(
                %range,
                granules = boundaries.len() - 1,
                "activating client range"
            );
            // Persist the mapping before assigning, so a manager dying here
            // hands the same granules to its successor.
            write_initial_granule_mapping(&inner, &boundaries).await?;
            for window in boundaries.windows(2) {
                inner.ranges_to_assign.send(RangeAssignment::assign(
                    KeyRange::new(window[0].clone(), window[1].clone()),
                    None,
                ));
            }
            inner.ranges_to_assign.on_empty().await;
        }

        // Re-read the change key; if nothing changed while we worked, wait
        // for the next change.
        let mut tr = inner.store.transaction();
        let unchanged = loop {
            let read = tr.get(keys::BLOB_RANGE_CHANGE_KEY).await;
            match read {
                Ok(value) => break value == change_value,
                Err(error) => tr.on_error(error).await?,
            }
        };
        if unchanged {
            inner.store.watch(keys::BLOB_RANGE_CHANGE_KEY).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> Key {
        Bytes::copy_from_slice(text.as_bytes())
    }

    fn range(begin: &str, end: &str) -> KeyRange {
        KeyRange::new(key(begin), key(end))
    }

    fn to_end(begin: &str) -> KeyRange {
        KeyRange::new(key(begin), KeyRange::normal().end)
    }

    fn from_start(end: &str) -> KeyRange {
        KeyRange::new(KeyRange::normal().begin, key(end))
    }

    fn snapshot(rows: &[(&str, bool)]) -> Vec<(Key, Bytes)> {
        rows.iter()
            .map(|(k, active)| {
                let value = if *active {
                    Bytes::from_static(records::BLOB_RANGE_ACTIVE)
                } else {
                    Bytes::new()
                };
                (key(k), value)
            })
            .collect()
    }

    fn assert_known(map: &RangeMap<bool>, expected: &[(KeyRange, bool)]) {
        let got: Vec<(KeyRange, bool)> = map.ranges().into_iter().map(|(r, v)| (r, *v)).collect();
        assert_eq!(got, expected);
    }

    // The canonical reconciliation walk: each step feeds a fresh store
    // snapshot and checks the deltas plus the coalesced known map.
    #[test]
    fn reconciles_declared_ranges_against_known_map() {
        let mut known = RangeMap::new(KeyRange::normal(), false);
        assert_known(&known, &[(KeyRange::normal(), false)]);

        // DB has [A - B).
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("B", false)]),
        );
        assert_eq!(added, vec![range("A", "B")]);
        assert!(removed.is_empty());
        assert_known(
            &known,
            &[
                (from_start("A"), false),
                (range("A", "B"), true),
                (to_end("B"), false),
            ],
        );

        // DB emptied.
        let (added, removed) = update_client_blob_ranges(&mut known, &[]);
        assert!(added.is_empty());
        assert_eq!(removed, vec![range("A", "B")]);
        assert_known(&known, &[(KeyRange::normal(), false)]);

        // DB has [A - B) and [C - D).
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("B", false), ("C", true), ("D", false)]),
        );
        assert_eq!(added, vec![range("A", "B"), range("C", "D")]);
        assert!(removed.is_empty());
        assert_known(
            &known,
            &[
                (from_start("A"), false),
                (range("A", "B"), true),
                (range("B", "C"), false),
                (range("C", "D"), true),
                (to_end("D"), false),
            ],
        );

        // DB has [A - D): the gap fills in.
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("D", false)]),
        );
        assert_eq!(added, vec![range("B", "C")]);
        assert!(removed.is_empty());
        assert_known(
            &known,
            &[
                (from_start("A"), false),
                (range("A", "D"), true),
                (to_end("D"), false),
            ],
        );

        // DB has [A - C): the tail drops off.
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("C", false)]),
        );
        assert!(added.is_empty());
        assert_eq!(removed, vec![range("C", "D")]);
        assert_known(
            &known,
            &[
                (from_start("A"), false),
                (range("A", "C"), true),
                (to_end("C"), false),
            ],
        );

        // DB has [B - C): the head drops off.
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("B", true), ("C", false)]),
        );
        assert!(added.is_empty());
        assert_eq!(removed, vec![range("A", "B")]);
        assert_known(
            &known,
            &[
                (from_start("B"), false),
                (range("B", "C"), true),
                (to_end("C"), false),
            ],
        );

        // DB has [B - D).
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("B", true), ("D", false)]),
        );
        assert_eq!(added, vec![range("C", "D")]);
        assert!(removed.is_empty());

        // DB has [A - D).
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("D", false)]),
        );
        assert_eq!(added, vec![range("A", "B")]);
        assert!(removed.is_empty());

        // DB back to [A - B) and [C - D).
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("B", false), ("C", true), ("D", false)]),
        );
        assert!(added.is_empty());
        assert_eq!(removed, vec![range("B", "C")]);

        // DB has only [B - C): one add, two removes.
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("B", true), ("C", false)]),
        );
        assert_eq!(added, vec![range("B", "C")]);
        assert_eq!(removed, vec![range("A", "B"), range("C", "D")]);
        assert_known(
            &known,
            &[
                (from_start("B"), false),
                (range("B", "C"), true),
                (to_end("C"), false),
            ],
        );
    }

    #[test]
    fn reconciler_is_idempotent() {
        let mut known = RangeMap::new(KeyRange::normal(), false);
        let rows = snapshot(&[("A", true), ("B", false), ("C", true), ("D", false)]);

        let (added, removed) = update_client_blob_ranges(&mut known, &rows);
        assert!(!added.is_empty() && removed.is_empty());

        let before: Vec<(KeyRange, bool)> =
            known.ranges().into_iter().map(|(r, v)| (r, *v)).collect();
        let (added, removed) = update_client_blob_ranges(&mut known, &rows);
        assert!(added.is_empty());
        assert!(removed.is_empty());
        let after: Vec<(KeyRange, bool)> =
            known.ranges().into_iter().map(|(r, v)| (r, *v)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn snapshot_rows_outside_normal_range_are_truncated() {
        let mut known = RangeMap::new(KeyRange::normal(), false);
        let rows = vec![
            (key("A"), Bytes::from_static(records::BLOB_RANGE_ACTIVE)),
            (Bytes::from_static(b"\xff\x01"), Bytes::new()),
        ];
        let (added, removed) = update_client_blob_ranges(&mut known, &rows);
        assert_eq!(added, vec![to_end("A")]);
        assert!(removed.is_empty());
    }

    #[test]
    fn to_add_and_to_remove_are_disjoint() {
        let mut known = RangeMap::new(KeyRange::normal(), false);
        update_client_blob_ranges(
            &mut known,
            &snapshot(&[("A", true), ("B", false), ("C", true), ("D", false)]),
        );
        let (added, removed) = update_client_blob_ranges(
            &mut known,
            &snapshot(&[("B", true), ("C", false)]),
        );
        for add in &added {
            for remove in &removed {
                assert!(!add.intersects(remove), "{add} overlaps {remove}");
            }
        }
    }
}
