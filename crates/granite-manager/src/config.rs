// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the Blob Manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Tunables recognized by the manager core.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BlobManagerConfig {
    /// Target size of one granule snapshot; granules estimated above this
    /// are split.
    pub snapshot_file_target_bytes: u64,
    /// Write-rate target for one split segment of a write-hot granule.
    pub split_bytes_per_ksec: u64,
    /// Floor for the write-rate target when slicing write-hot granules.
    pub min_bytes_per_ksec: u64,
    /// Maximum number of children one split may produce.
    pub max_fanout: usize,
    /// Timeout for per-worker requests during recovery and monitoring.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "worker_timeout_ms")]
    pub worker_timeout: Duration,
    /// Interval between scans of the persisted worker list.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "worker_list_fetch_interval_ms")]
    pub worker_list_fetch_interval: Duration,
    /// Debounce applied to recruitment restarts.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "debounce_recruiting_delay_ms")]
    pub debounce_recruiting_delay: Duration,
    /// Backoff after a failed recruitment attempt.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "storage_recruitment_delay_ms")]
    pub storage_recruitment_delay: Duration,
    /// The prune engine sweeps at least this often even without a watch
    /// notification.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "prune_timeout_ms")]
    pub prune_timeout: Duration,
    /// Settle delay between lock checks, so a burst of conflicts does not
    /// hammer the epoch key.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "lock_check_settle_ms")]
    pub lock_check_settle: Duration,
    /// Initial backoff when reconnecting a worker status stream.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "stream_backoff_min_ms")]
    pub stream_backoff_min: Duration,
    /// Cap on the status stream reconnect backoff.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "stream_backoff_max_ms")]
    pub stream_backoff_max: Duration,
    /// Rows written per transaction when persisting the initial granule
    /// mapping of a newly declared client range.
    pub initial_mapping_chunk_rows: usize,
    /// Rows per page when range-scanning during recovery and GC.
    pub scan_row_limit: usize,
    /// Address of the object-storage backend holding granule files.
    pub bg_url: String,
    /// Fault-injection only: periodically move a random granule.
    pub chaos_range_mover: bool,
}

impl Default for BlobManagerConfig {
    fn default() -> Self {
        Self {
            snapshot_file_target_bytes: 10_000_000,
            split_bytes_per_ksec: 250_000_000,
            min_bytes_per_ksec: 100_000_000,
            max_fanout: 10,
            worker_timeout: Duration::from_secs(10),
            worker_list_fetch_interval: Duration::from_secs(1),
            debounce_recruiting_delay: Duration::from_secs(5),
            storage_recruitment_delay: Duration::from_millis(500),
            prune_timeout: Duration::from_secs(60),
            lock_check_settle: Duration::from_millis(500),
            stream_backoff_min: Duration::from_millis(100),
            stream_backoff_max: Duration::from_secs(5),
            initial_mapping_chunk_rows: 1000,
            scan_row_limit: 10_000,
            bg_url: String::new(),
            chaos_range_mover: false,
        }
    }
}

impl BlobManagerConfig {
    /// A configuration with short intervals, for tests that drive the full
    /// manager task tree.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn default_for_test() -> Self {
        Self {
            worker_timeout: Duration::from_millis(500),
            worker_list_fetch_interval: Duration::from_millis(20),
            debounce_recruiting_delay: Duration::from_millis(10),
            storage_recruitment_delay: Duration::from_millis(10),
            prune_timeout: Duration::from_millis(100),
            lock_check_settle: Duration::from_millis(10),
            stream_backoff_min: Duration::from_millis(5),
            stream_backoff_max: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_serde() {
        let config = BlobManagerConfig::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: BlobManagerConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn fanout_default_is_ten() {
        assert_eq!(BlobManagerConfig::default().max_fanout, 10);
    }
}
