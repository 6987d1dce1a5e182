// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seam to the transactional key-value store the manager persists into.
//!
//! The manager consumes a narrow contract: transactional reads and writes,
//! range reads with continuation, versionstamped values, watches, and the
//! store's standard retry behavior through [`StoreTransaction::on_error`].
//! Call sites follow the same shape everywhere: build a transaction, loop
//! attempting the body, and feed every failure to `on_error`, which either
//! backs off and resets the transaction or propagates a terminal error.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use granite_core::KeyRange;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store.
///
/// The retryable variants are exactly the ones `on_error` absorbs; anything
/// else ends the enclosing retry loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The transaction conflicted with a concurrent commit.
    #[error("transaction conflict")]
    Conflict,
    /// The commit may or may not have happened.
    #[error("commit result unknown")]
    CommitUnknownResult,
    /// The transaction ran past the store's read-version horizon.
    #[error("transaction too old")]
    TooOld,
    /// The store is temporarily unreachable.
    #[error("store unavailable")]
    Unavailable,
    /// A non-retryable store failure.
    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict
                | StoreError::CommitUnknownResult
                | StoreError::TooOld
                | StoreError::Unavailable
        )
    }
}

/// A page of a range read.
#[derive(Debug, Clone, Default)]
pub struct RangeReadResult {
    pub rows: Vec<(Bytes, Bytes)>,
    /// True if the range holds more rows past the last returned one.
    pub more: bool,
}

/// One store transaction.
///
/// Mutations are buffered locally and take effect atomically at `commit`.
/// Reads observe the transaction's own writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Reads up to `limit` rows of `range`, smallest keys first, or largest
    /// first when `reverse` is set.
    async fn get_range(
        &mut self,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
    ) -> StoreResult<RangeReadResult>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    /// Writes `value` with the store's commit versionstamp appended, so the
    /// committed value carries the version it was written at.
    fn set_versionstamped_value(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, range: &KeyRange);

    /// Adds `range` to the read-conflict set, so any concurrent write to it
    /// aborts this transaction at commit.
    fn add_read_conflict(&mut self, range: &KeyRange);

    async fn commit(&mut self) -> StoreResult<()>;

    /// The store's standard retry contract: backs off and resets the
    /// transaction if `error` is retryable, otherwise returns it.
    async fn on_error(&mut self, error: StoreError) -> StoreResult<()>;
}

/// Byte-sampled size and write-rate estimates for a range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageMetrics {
    pub bytes: u64,
    pub bytes_per_ksec: u64,
}

/// Target metrics for one split segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitTarget {
    pub bytes: u64,
    pub bytes_per_ksec: u64,
}

/// Handle to the transactional store.
#[async_trait]
pub trait KvStore: fmt::Debug + Send + Sync {
    fn transaction(&self) -> Box<dyn StoreTransaction>;

    /// Resolves after the next committed change to `key`.
    async fn watch(&self, key: &[u8]) -> StoreResult<()>;

    /// Estimates the byte size and write rate of `range` from the store's
    /// byte samples.
    async fn estimate_storage_metrics(&self, range: &KeyRange) -> StoreResult<StorageMetrics>;

    /// Streams split points such that each segment between consecutive
    /// points approximately meets `target`. The returned list starts at
    /// `range.begin` and ends at `range.end`.
    async fn split_storage_metrics(
        &self,
        range: &KeyRange,
        target: SplitTarget,
        estimated: StorageMetrics,
    ) -> StoreResult<Vec<Bytes>>;
}
