// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Garbage collection of granule files.
//!
//! Prune intents arrive through the store; each sweep walks the granule
//! history DAG backwards from the active granules, classifies every node as
//! fully or partially collectible against the prune version, deletes blobs
//! from object storage, and clears the covered metadata. Failures are
//! logged and dropped; GC must never take the manager down.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use granite_core::{
    keys,
    records::{self, GranuleFileRecord, GranuleHistoryValue, PruneIntent},
    GranuleId, Key, KeyRange, Version, MAX_VERSION,
};
use tokio::select;

use crate::{manager::BlobManagerInner, store::StoreResult};

/// Watches the prune change key, and sweeps periodically regardless so an
/// intent missed during a manager blip is still honored.
pub(crate) async fn monitor_prune_keys(inner: Arc<BlobManagerInner>) -> anyhow::Result<()> {
    loop {
        if let Err(error) = sweep_prune_intents(&inner).await {
            inner.metrics.prune_errors_total.inc();
            tracing::warn!(?error, "prune sweep failed, will retry");
        }
        select! {
            result = inner.store.watch(keys::PRUNE_CHANGE_KEY) => {
                if let Err(error) = result {
                    tracing::warn!(?error, "prune watch failed");
                    tokio::time::sleep(inner.config.prune_timeout).await;
                }
            }
            _ = tokio::time::sleep(inner.config.prune_timeout) => {}
        }
    }
}

/// Reads every pending prune intent across the normal range and processes
/// them. Intents race: each one is cleared only if it is still exactly what
/// was read.
async fn sweep_prune_intents(inner: &Arc<BlobManagerInner>) -> anyhow::Result<()> {
    let rows = scan_prune_rows(inner).await?;
    let mut intents: Vec<(KeyRange, PruneIntent)> = Vec::new();
    for window in rows.windows(2) {
        let (key, value) = &window[0];
        if value.is_empty() {
            continue;
        }
        let begin = keys::decode_prune_intent_key(key)
            .map_err(|err| anyhow::anyhow!("bad prune intent key: {err}"))?;
        let end = keys::decode_prune_intent_key(&window[1].0)
            .map_err(|err| anyhow::anyhow!("bad prune intent key: {err}"))?;
        match records::decode_value::<PruneIntent>(value) {
            Ok(intent) => intents.push((KeyRange::new(begin, end), intent)),
            Err(error) => tracing::warn!(?error, "skipping malformed prune intent"),
        }
    }

    if intents.is_empty() {
        return Ok(());
    }
    tracing::info!(count = intents.len(), "processing prune intents");

    // Process the whole batch before returning, so a timer firing mid-sweep
    // cannot race a second prune of the same range.
    let sweeps = intents.into_iter().map(|(range, intent)| {
        let inner = inner.clone();
        async move {
            if let Err(error) = prune_range(&inner, &range, intent).await {
                inner.metrics.prune_errors_total.inc();
                tracing::warn!(?error, %range, "prune failed for range");
            }
        }
    });
    futures::future::join_all(sweeps).await;
    Ok(())
}

async fn scan_prune_rows(inner: &BlobManagerInner) -> StoreResult<Vec<(Bytes, Bytes)>> {
    let subspace = keys::subspace_range(keys::PRUNE_INTENT_PREFIX);
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

/// Prunes one range at one version: BFS over the history DAG from the
/// active granules, full deletes sequentially oldest-ancestor-first,
/// partial deletes in parallel, then a conditional clear of the intent.
pub(crate) async fn prune_range(
    inner: &Arc<BlobManagerInner>,
    range: &KeyRange,
    intent: PruneIntent,
) -> anyhow::Result<()> {
    tracing::info!(%range, version = intent.version, force = intent.force, "pruning range");

    // Seed with the active granules that lie entirely inside the prune
    // range; prune boundaries must align with granule boundaries, and
    // misaligned granules are skipped.
    let active_ranges: Vec<KeyRange> = {
        let state = inner.state.lock().expect("manager state lock");
        state
            .worker_assignments
            .intersecting(range)
            .into_iter()
            .map(|(piece, _)| state.worker_assignments.containing(&piece.begin).0)
            .filter(|entry| {
                let aligned = range.contains_range(entry);
                if !aligned {
                    tracing::debug!(granule = %entry, prune = %range, "skipping misaligned granule");
                }
                aligned
            })
            .collect()
    };

    // BFS queue of (range, start version, end version); a (begin, version)
    // pair uniquely identifies a granule.
    let mut queue: VecDeque<(KeyRange, Version, Version)> = VecDeque::new();
    let mut visited: HashSet<(Key, Version)> = HashSet::new();
    for active in active_ranges {
        if let Some(version) = latest_history_version(inner, &active).await? {
            if visited.insert((active.begin.clone(), version)) {
                queue.push_back((active, version, MAX_VERSION));
            }
        }
    }

    let mut to_fully_delete: Vec<(GranuleId, Key)> = Vec::new();
    let mut to_partially_delete: Vec<GranuleId> = Vec::new();

    while let Some((current, start_version, end_version)) = queue.pop_front() {
        let history_key = keys::granule_history_key_for(&current, start_version);
        let node = read_history_entry(inner, &history_key).await?;

        if intent.force || end_version <= intent.version {
            // Every version of this granule is below the prune point (or
            // the prune is unconditional): files and history both go.
            to_fully_delete.push((node.granule_id, history_key));
        } else if start_version < intent.version {
            // The prune point lands inside this granule's version span.
            to_partially_delete.push(node.granule_id);
        }

        for parent in &node.parents {
            if visited.insert((parent.range.begin.clone(), parent.start_version)) {
                // The parent's span ends where this node's begins.
                queue.push_back((parent.range.clone(), parent.start_version, start_version));
            }
        }
    }

    // Full deletes run sequentially, oldest ancestor first (the collection
    // order put children before parents, so iterate in reverse). A crash
    // mid-sweep then never leaves an unreachable history node.
    tracing::debug!(
        full = to_fully_delete.len(),
        partial = to_partially_delete.len(),
        "prune classification done"
    );
    for (granule_id, history_key) in to_fully_delete.iter().rev() {
        fully_delete_granule(inner, *granule_id, history_key).await?;
    }

    // Partial deletes only touch leaves; they can run in parallel.
    futures::future::try_join_all(
        to_partially_delete
            .iter()
            .rev()
            .map(|granule_id| partially_delete_granule(inner, *granule_id, intent.version)),
    )
    .await?;

    // Clear the intent only if it is still the one we worked on; a fresh
    // intent that arrived mid-sweep must survive.
    let intent_key = keys::prune_intent_key_for(&range.begin);
    let mut tr = inner.store.transaction();
    loop {
        let attempt = async {
            let current_value = tr.get(&intent_key).await?;
            match current_value {
                Some(value) => {
                    let current = records::decode_value::<PruneIntent>(&value).map_err(|err| {
                        crate::store::StoreError::Internal(format!("bad prune intent: {err}"))
                    })?;
                    if current == intent {
                        tr.clear(&intent_key);
                        tr.commit().await?;
                    } else {
                        tracing::debug!(%range, "prune intent changed mid-sweep, leaving it");
                    }
                }
                None => tracing::debug!(%range, "prune intent already gone"),
            }
            Ok::<_, crate::store::StoreError>(())
        };
        let attempt = attempt.await;
        match attempt {
            Ok(()) => break,
            Err(error) => tr.on_error(error).await?,
        }
    }

    tracing::info!(%range, version = intent.version, "prune complete");
    Ok(())
}

/// The latest history entry version for exactly `range`, if any.
async fn latest_history_version(
    inner: &BlobManagerInner,
    range: &KeyRange,
) -> anyhow::Result<Option<Version>> {
    let span = keys::granule_history_range_for(range);
    let mut tr = inner.store.transaction();
    loop {
        let attempt = tr.get_range(&span, 1, true).await;
        match attempt {
            Ok(page) => {
                let Some((key, _)) = page.rows.first() else {
                    return Ok(None);
                };
                let (_, version) = keys::decode_granule_history_key(key)
                    .map_err(|err| anyhow::anyhow!("bad history key: {err}"))?;
                return Ok(Some(version));
            }
            Err(error) => tr.on_error(error).await?,
        }
    }
}

async fn read_history_entry(
    inner: &BlobManagerInner,
    history_key: &[u8],
) -> anyhow::Result<GranuleHistoryValue> {
    let mut tr = inner.store.transaction();
    loop {
        let attempt = tr.get(history_key).await;
        match attempt {
            Ok(Some(value)) => {
                return records::decode_value(&value)
                    .map_err(|err| anyhow::anyhow!("bad history value: {err}"));
            }
            Ok(None) => {
                anyhow::bail!("history entry missing during prune traversal");
            }
            Err(error) => tr.on_error(error).await?,
        }
    }
}

struct GranuleFiles {
    /// (version, record, row key) sorted by version ascending.
    snapshots: Vec<(Version, GranuleFileRecord, Key)>,
    deltas: Vec<(Version, GranuleFileRecord, Key)>,
}

async fn load_granule_files(
    inner: &BlobManagerInner,
    granule_id: GranuleId,
) -> anyhow::Result<GranuleFiles> {
    let span = keys::granule_file_range_for(granule_id);
    let mut tr = inner.store.transaction();
    let mut rows: Vec<(Bytes, Bytes)> = Vec::new();
    let mut begin = span.begin.clone();
    loop {
        let attempt = tr
            .get_range(
                &KeyRange::new(begin.clone(), span.end.clone()),
                inner.config.scan_row_limit,
                false,
            )
            .await;
        let page = match attempt {
            Ok(page) => page,
            Err(error) => {
                tr.on_error(error).await?;
                rows.clear();
                begin = span.begin.clone();
                continue;
            }
        };
        rows.extend(page.rows.iter().cloned());
        if !page.more {
            break;
        }
        let last = page.rows.last().expect("a page with more rows is non-empty");
        begin = KeyRange::single(last.0.clone()).end;
    }

    let mut files = GranuleFiles {
        snapshots: Vec::new(),
        deltas: Vec::new(),
    };
    for (key, value) in rows {
        let (_, kind, version) = keys::decode_granule_file_key(&key)
            .map_err(|err| anyhow::anyhow!("bad file key: {err}"))?;
        let record: GranuleFileRecord = records::decode_value(&value)
            .map_err(|err| anyhow::anyhow!("bad file record: {err}"))?;
        match kind {
            keys::FILE_KIND_SNAPSHOT => files.snapshots.push((version, record, key)),
            keys::FILE_KIND_DELTA => files.deltas.push((version, record, key)),
            other => tracing::warn!(kind = other, "unknown granule file kind"),
        }
    }
    Ok(files)
}

/// Deletes every file of `granule_id` from object storage, then clears its
/// history entry and file rows. Blobs go first: a dangling file row is
/// recoverable on the next sweep, a dangling blob is not.
async fn fully_delete_granule(
    inner: &BlobManagerInner,
    granule_id: GranuleId,
    history_key: &[u8],
) -> anyhow::Result<()> {
    tracing::debug!(granule = %granule_id, "fully deleting granule");
    let files = load_granule_files(inner, granule_id).await?;

    let paths: Vec<&str> = files
        .snapshots
        .iter()
        .chain(files.deltas.iter())
        .map(|(_, record, _)| record.path.as_str())
        .collect();
    futures::future::try_join_all(paths.iter().map(|path| inner.object_store.delete_file(path)))
        .await?;

    let mut tr = inner.store.transaction();
    loop {
        tr.clear(history_key);
        tr.clear_range(&keys::granule_file_range_for(granule_id));
        let committed = tr.commit().await;
        match committed {
            Ok(()) => break,
            Err(error) => tr.on_error(error).await?,
        }
    }

    inner.metrics.granules_fully_deleted_total.inc();
    tracing::debug!(granule = %granule_id, "fully deleted granule");
    Ok(())
}

/// Picks which files of a still-live granule are obsolete at
/// `prune_version`: everything older than the youngest snapshot at or below
/// the prune point. Returns `None` when no such snapshot exists.
fn select_partial_deletes(
    snapshot_versions: &[Version],
    delta_versions: &[Version],
    prune_version: Version,
) -> Option<(Version, Vec<usize>, Vec<usize>)> {
    let mut latest_snapshot: Option<Version> = None;
    let mut snapshot_deletes = Vec::new();
    for (index, &version) in snapshot_versions.iter().enumerate().rev() {
        if latest_snapshot.is_some() {
            snapshot_deletes.push(index);
        } else if version <= prune_version {
            latest_snapshot = Some(version);
        }
    }
    let latest_snapshot = latest_snapshot?;

    let delta_deletes = delta_versions
        .iter()
        .enumerate()
        .take_while(|(_, &version)| version <= latest_snapshot)
        .map(|(index, _)| index)
        .collect();
    Some((latest_snapshot, snapshot_deletes, delta_deletes))
}

/// Deletes a live granule's files made obsolete by `prune_version`. Never
/// deletes the last snapshot at or below the prune point, so reads at the
/// prune version keep working.
async fn partially_delete_granule(
    inner: &BlobManagerInner,
    granule_id: GranuleId,
    prune_version: Version,
) -> anyhow::Result<()> {
    tracing::debug!(granule = %granule_id, prune_version, "partially deleting granule");
    let files = load_granule_files(inner, granule_id).await?;

    let snapshot_versions: Vec<Version> = files.snapshots.iter().map(|(v, _, _)| *v).collect();
    let delta_versions: Vec<Version> = files.deltas.iter().map(|(v, _, _)| *v).collect();
    let (latest_snapshot, snapshot_deletes, delta_deletes) =
        select_partial_deletes(&snapshot_versions, &delta_versions, prune_version).ok_or_else(
            || anyhow::anyhow!("no snapshot at or below the prune version for {granule_id}"),
        )?;
    tracing::debug!(
        granule = %granule_id,
        latest_snapshot,
        snapshots = snapshot_deletes.len(),
        deltas = delta_deletes.len(),
        "partial delete plan"
    );

    let mut doomed_paths: Vec<&str> = Vec::new();
    let mut doomed_keys: Vec<&Key> = Vec::new();
    for &index in &snapshot_deletes {
        doomed_paths.push(files.snapshots[index].1.path.as_str());
        doomed_keys.push(&files.snapshots[index].2);
    }
    for &index in &delta_deletes {
        doomed_paths.push(files.deltas[index].1.path.as_str());
        doomed_keys.push(&files.deltas[index].2);
    }

    futures::future::try_join_all(
        doomed_paths
            .iter()
            .map(|path| inner.object_store.delete_file(path)),
    )
    .await?;

    let mut tr = inner.store.transaction();
    loop {
        for key in &doomed_keys {
            tr.clear(key);
        }
        let committed = tr.commit().await;
        match committed {
            Ok(()) => break,
            Err(error) => tr.on_error(error).await?,
        }
    }

    inner.metrics.granules_partially_deleted_total.inc();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_delete_keeps_youngest_snapshot_at_or_below_prune() {
        let snapshots = [100, 200, 300];
        let deltas = [150, 200, 250, 300, 350];

        let (latest, snapshot_deletes, delta_deletes) =
            select_partial_deletes(&snapshots, &deltas, 250).unwrap();
        assert_eq!(latest, 200);
        // Only the snapshot at 100 goes; 200 must survive.
        assert_eq!(snapshot_deletes, vec![0]);
        // Deltas at or below 200 go (the delta sharing the snapshot version
        // is covered by the snapshot).
        assert_eq!(delta_deletes, vec![0, 1]);
    }

    #[test]
    fn partial_delete_with_exact_snapshot_match() {
        let (latest, snapshot_deletes, _) =
            select_partial_deletes(&[100, 200, 300], &[], 200).unwrap();
        assert_eq!(latest, 200);
        assert_eq!(snapshot_deletes, vec![0]);
    }

    #[test]
    fn partial_delete_without_eligible_snapshot_is_refused() {
        assert!(select_partial_deletes(&[100, 200], &[50], 99).is_none());
    }

    #[test]
    fn partial_delete_never_deletes_everything() {
        for prune in [100, 150, 200, 1000] {
            if let Some((latest, snapshot_deletes, _)) =
                select_partial_deletes(&[100, 200], &[], prune)
            {
                assert!(latest <= prune);
                assert!(snapshot_deletes.len() < 2, "kept at least one snapshot");
            }
        }
    }
}
