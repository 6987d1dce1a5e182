// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios driving the full manager task tree against the
//! in-memory fabric: worker death, a write-hot split storm, leader takeover
//! with an in-progress split, and a forced prune.

use std::time::Duration;

use granite_core::{
    keys,
    records::{GranuleHistoryValue, GranuleLock, GranuleParent, PruneIntent},
    GranuleId, KeyRange,
};
use granite_manager::{
    store::StorageMetrics,
    testing::{
        declare_client_range, key, range, wait_until, write_file_row, write_granule_lock,
        write_granule_mapping, write_history_entry, write_in_progress_split, write_prune_intent,
        FakeBlobWorker, FakeCluster, ManagerFixture, MemObjectStore, MemStore,
    },
    worker::GranuleStatusReport,
};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// The owned ranges of a set of workers, in key order, ignoring stamps.
fn owned_ranges(workers: &[&FakeBlobWorker]) -> Vec<KeyRange> {
    let mut owned: Vec<KeyRange> = workers
        .iter()
        .flat_map(|worker| worker.owned_ranges())
        .map(|(range, _, _)| range)
        .collect();
    owned.sort_by(|a, b| a.begin.cmp(&b.begin));
    owned
}

fn tiles(ranges: &[KeyRange], whole: &KeyRange) -> bool {
    if ranges.is_empty() {
        return false;
    }
    if ranges[0].begin != whole.begin || ranges[ranges.len() - 1].end != whole.end {
        return false;
    }
    ranges.windows(2).all(|pair| pair[0].end == pair[1].begin)
}

#[tokio::test]
async fn worker_death_moves_ranges_to_survivor() {
    init_tracing();
    let store = MemStore::new();
    let objects = MemObjectStore::new();
    let cluster = FakeCluster::new(store.clone());

    let worker_a = FakeBlobWorker::new(1, "10.0.0.1:4500", None);
    let worker_b = FakeBlobWorker::new(2, "10.0.0.2:4500", None);
    cluster.add_candidate(worker_a.clone());
    cluster.add_candidate(worker_b.clone());

    let whole = range("a", "z");
    store.set_estimate(
        whole.clone(),
        StorageMetrics {
            bytes: 50_000_000,
            bytes_per_ksec: 0,
        },
    );
    store.set_split_points(whole.clone(), vec![key("a"), key("m"), key("z")]);
    declare_client_range(&store, &whole);

    let fixture = ManagerFixture::start(1, store.clone(), objects, cluster.clone());

    // Both granules land somewhere.
    assert!(
        wait_until(WAIT, || {
            tiles(&owned_ranges(&[&worker_a, &worker_b]), &whole)
                && owned_ranges(&[&worker_a, &worker_b]).len() == 2
        })
        .await
    );

    worker_a.trigger_failure();

    // The survivor ends up owning everything.
    assert!(
        wait_until(WAIT, || {
            let survivor = owned_ranges(&[&worker_b]);
            survivor.len() == 2 && tiles(&survivor, &whole)
        })
        .await
    );

    // And the dead worker's registration is gone from the store.
    assert!(
        wait_until(WAIT, || {
            store
                .get(&keys::worker_list_key_for(worker_a.id()))
                .is_none()
        })
        .await
    );

    fixture.stop().await.expect("manager exits cleanly");
}

#[tokio::test]
async fn write_hot_split_storm_is_capped_at_max_fanout() {
    init_tracing();
    let store = MemStore::new();
    let objects = MemObjectStore::new();
    let cluster = FakeCluster::new(store.clone());

    let worker = FakeBlobWorker::new(1, "10.0.0.1:4500", None);
    cluster.add_candidate(worker.clone());

    let whole = range("a", "z");
    declare_client_range(&store, &whole);

    let fixture = ManagerFixture::start(1, store.clone(), objects, cluster.clone());

    assert!(wait_until(WAIT, || worker.owned_ranges().len() == 1).await);
    let (owned_range, assign_epoch, assign_seq) = worker.owned_ranges().remove(0);
    assert_eq!(owned_range, whole);

    // The worker would have locked the granule when it opened it.
    let granule_id = GranuleId::from_bytes([7; 16]);
    write_granule_lock(
        &store,
        &whole,
        &GranuleLock {
            epoch: assign_epoch,
            seq: assign_seq,
            granule_id,
        },
    );

    // Make the range look enormous and write-hot, with more split points
    // than the fanout cap allows.
    store.set_estimate(
        whole.clone(),
        StorageMetrics {
            bytes: 400_000_000,
            bytes_per_ksec: 900_000_000,
        },
    );
    let mut points: Vec<_> = (b'a'..=b'l').map(|c| key(&(c as char).to_string())).collect();
    points.push(key("z"));
    assert_eq!(points.len(), 13);
    store.set_split_points(whole.clone(), points);

    worker.push_status(GranuleStatusReport {
        granule_id,
        range: whole.clone(),
        epoch: assign_epoch,
        seq: assign_seq,
        start_version: 100,
        latest_version: 500,
        do_split: true,
        write_hot_split: true,
    });

    // The worker ends up owning exactly ten contiguous children.
    assert!(
        wait_until(WAIT, || {
            let owned = owned_ranges(&[&worker]);
            owned.len() == 10 && tiles(&owned, &whole)
        })
        .await
    );

    // Split metadata is committed: one sentinel plus eleven boundaries.
    let boundary_rows = store.snapshot_subspace(keys::SPLIT_BOUNDARY_PREFIX);
    assert_eq!(boundary_rows.len(), 12);

    // Ten history entries, every one naming the parent.
    let history_rows = store.snapshot_subspace(keys::GRANULE_HISTORY_PREFIX);
    assert_eq!(history_rows.len(), 10);
    let mut child_ranges = Vec::new();
    for (history_key, value) in &history_rows {
        let (child_range, version) = keys::decode_granule_history_key(history_key).unwrap();
        assert_eq!(version, 500);
        let node: GranuleHistoryValue =
            granite_core::records::decode_value(value).unwrap();
        assert_eq!(
            node.parents,
            vec![GranuleParent {
                range: whole.clone(),
                start_version: 100,
            }]
        );
        child_ranges.push(child_range);
    }
    child_ranges.sort_by(|a, b| a.begin.cmp(&b.begin));
    assert!(tiles(&child_ranges, &whole));

    // One split-state row per child.
    let state_rows = store.snapshot_subspace(keys::SPLIT_STATE_PREFIX);
    assert_eq!(state_rows.len(), 10);

    fixture.stop().await.expect("manager exits cleanly");
}

#[tokio::test]
async fn takeover_recovers_in_progress_split() {
    init_tracing();
    let store = MemStore::new();
    let objects = MemObjectStore::new();
    let cluster = FakeCluster::new(store.clone());

    let whole = range("a", "z");

    // Epoch 1 left behind: a live worker owning [a - z) at (1, 5), the
    // granule mapping naming that worker, and a committed-but-unapplied
    // split of [a - z) into [a - m) and [m - z) at (1, 7).
    let worker = FakeBlobWorker::new(1, "10.0.0.1:4500", None);
    worker.seed_assignment(whole.clone(), 1, 5);
    cluster.register_existing(worker.clone());

    declare_client_range(&store, &whole);
    write_granule_mapping(&store, &[key("a"), key("z")], worker.id());
    let parent = GranuleId::from_bytes([9; 16]);
    write_in_progress_split(&store, parent, &[key("a"), key("m"), key("z")], 1, 7);

    let fixture = ManagerFixture::start(2, store.clone(), objects, cluster.clone());

    // After recovery both children are explicitly assigned with epoch 2.
    assert!(
        wait_until(WAIT, || {
            let owned = worker.owned_ranges();
            owned.len() == 2
                && owned.iter().all(|(_, epoch, _)| *epoch == 2)
                && tiles(
                    &owned.iter().map(|(r, _, _)| r.clone()).collect::<Vec<_>>(),
                    &whole,
                )
        })
        .await
    );
    assert_eq!(
        worker
            .owned_ranges()
            .iter()
            .map(|(r, _, _)| r.clone())
            .collect::<Vec<_>>(),
        vec![range("a", "m"), range("m", "z")]
    );

    fixture.stop().await.expect("manager exits cleanly");
}

#[tokio::test]
async fn forced_prune_deletes_history_and_files() {
    init_tracing();
    let store = MemStore::new();
    let objects = MemObjectStore::new();
    let cluster = FakeCluster::new(store.clone());

    let worker = FakeBlobWorker::new(1, "10.0.0.1:4500", None);
    cluster.add_candidate(worker.clone());

    let whole = range("a", "z");
    declare_client_range(&store, &whole);

    let fixture = ManagerFixture::start(1, store.clone(), objects.clone(), cluster.clone());
    assert!(wait_until(WAIT, || worker.owned_ranges().len() == 1).await);

    // History: the active granule at version 300 descends from two parents
    // created at version 100.
    let left = GranuleId::from_bytes([1; 16]);
    let right = GranuleId::from_bytes([2; 16]);
    let active = GranuleId::from_bytes([3; 16]);
    write_history_entry(
        &store,
        &range("a", "m"),
        100,
        &GranuleHistoryValue {
            granule_id: left,
            parents: vec![],
        },
    );
    write_history_entry(
        &store,
        &range("m", "z"),
        100,
        &GranuleHistoryValue {
            granule_id: right,
            parents: vec![],
        },
    );
    write_history_entry(
        &store,
        &whole,
        300,
        &GranuleHistoryValue {
            granule_id: active,
            parents: vec![
                GranuleParent {
                    range: range("a", "m"),
                    start_version: 100,
                },
                GranuleParent {
                    range: range("m", "z"),
                    start_version: 100,
                },
            ],
        },
    );

    write_file_row(&store, &objects, left, keys::FILE_KIND_SNAPSHOT, 100, "left/snap-100");
    write_file_row(&store, &objects, left, keys::FILE_KIND_DELTA, 150, "left/delta-150");
    write_file_row(&store, &objects, right, keys::FILE_KIND_SNAPSHOT, 100, "right/snap-100");
    write_file_row(&store, &objects, right, keys::FILE_KIND_DELTA, 240, "right/delta-240");
    write_file_row(&store, &objects, active, keys::FILE_KIND_SNAPSHOT, 300, "active/snap-300");
    assert_eq!(objects.paths().len(), 5);

    write_prune_intent(
        &store,
        &whole,
        PruneIntent {
            version: 400,
            force: true,
        },
    );

    // Everything under the pruned range disappears: blobs, file rows,
    // history entries, and finally the intent itself.
    assert!(wait_until(WAIT, || objects.paths().is_empty()).await);
    assert!(
        wait_until(WAIT, || {
            store.snapshot_subspace(keys::GRANULE_HISTORY_PREFIX).is_empty()
                && store.snapshot_subspace(keys::GRANULE_FILE_PREFIX).is_empty()
        })
        .await
    );
    assert!(
        wait_until(WAIT, || {
            store
                .get(&keys::prune_intent_key_for(&whole.begin))
                .is_none()
        })
        .await
    );

    fixture.stop().await.expect("manager exits cleanly");
}

#[tokio::test]
async fn halting_the_manager_stops_its_task_tree() {
    init_tracing();
    let store = MemStore::new();
    let objects = MemObjectStore::new();
    let cluster = FakeCluster::new(store.clone());

    let worker = FakeBlobWorker::new(1, "10.0.0.1:4500", None);
    cluster.add_candidate(worker.clone());
    declare_client_range(&store, &range("a", "z"));

    let fixture = ManagerFixture::start(1, store.clone(), objects, cluster);
    assert!(wait_until(WAIT, || worker.owned_ranges().len() == 1).await);

    fixture.stop().await.expect("manager honors halt");
}
