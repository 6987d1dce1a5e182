// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seam to the Blob Worker RPC surface.
//!
//! Every request a manager sends carries its `(epoch, seq)`; workers use the
//! pair to reject anything staler than what they have already accepted, from
//! this manager or any prior one.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use granite_core::{records::WorkerListEntry, Epoch, GranuleId, KeyRange, ManagerId, SeqNo, Version, WorkerId};

/// Errors surfaced by worker requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The worker knows of a manager with a higher epoch.
    #[error("blob manager replaced by a higher epoch")]
    ManagerReplaced,
    /// The worker believes another owner or a newer manager holds the range.
    #[error("granule assignment conflict")]
    AssignmentConflict,
    /// The request may or may not have been delivered.
    #[error("request delivery unknown")]
    MaybeDelivered,
    #[error("connection failed")]
    ConnectionFailed,
    /// The worker's endpoint is gone for good.
    #[error("worker endpoint closed")]
    EndpointClosed,
    #[error("the candidate process declined recruitment")]
    RecruitmentFailed,
    #[error("request timed out")]
    Timeout,
}

impl WorkerError {
    /// Errors worth retrying against the same worker after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkerError::MaybeDelivered | WorkerError::ConnectionFailed | WorkerError::Timeout
        )
    }
}

/// How a worker should treat an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignKind {
    /// A new range for this worker.
    Normal,
    /// The worker already holds the range; re-snapshot without splitting.
    Continue,
}

#[derive(Debug, Clone)]
pub struct AssignRangeRequest {
    pub range: KeyRange,
    pub epoch: Epoch,
    pub seq: SeqNo,
    pub kind: AssignKind,
}

#[derive(Debug, Clone)]
pub struct RevokeRangeRequest {
    pub range: KeyRange,
    pub epoch: Epoch,
    pub seq: SeqNo,
    /// True when the range is leaving the blob tier entirely, so the worker
    /// should drop its persisted granule state too.
    pub dispose: bool,
}

/// A worker's view of one granule, reported on its status stream.
#[derive(Debug, Clone)]
pub struct GranuleStatusReport {
    pub granule_id: GranuleId,
    pub range: KeyRange,
    pub epoch: Epoch,
    pub seq: SeqNo,
    pub start_version: Version,
    pub latest_version: Version,
    pub do_split: bool,
    pub write_hot_split: bool,
}

/// One row of a worker's assignment snapshot.
#[derive(Debug, Clone)]
pub struct AssignedRange {
    pub range: KeyRange,
    pub epoch_assigned: Epoch,
    pub seq_assigned: SeqNo,
}

pub type GranuleStatusStream = BoxStream<'static, Result<GranuleStatusReport, WorkerError>>;

/// RPC client for one blob worker.
#[async_trait]
pub trait BlobWorkerClient: fmt::Debug + Send + Sync {
    async fn assign_range(&self, request: AssignRangeRequest) -> Result<(), WorkerError>;

    async fn revoke_range(&self, request: RevokeRangeRequest) -> Result<(), WorkerError>;

    /// Opens the unidirectional status stream, stamped with the manager's
    /// epoch. The stream never ends cleanly; it fails when the worker does.
    async fn granule_status_stream(&self, epoch: Epoch)
        -> Result<GranuleStatusStream, WorkerError>;

    /// A consistent snapshot of the worker's current assignments. The
    /// worker rejects every later request from managers below `epoch`.
    async fn granule_assignments(&self, epoch: Epoch) -> Result<Vec<AssignedRange>, WorkerError>;

    async fn halt(&self, epoch: Epoch, manager_id: ManagerId) -> Result<(), WorkerError>;

    /// Resolves when the worker is considered failed.
    async fn wait_failure(&self);
}

/// A live worker: its persisted identity plus a connected client.
#[derive(Debug, Clone)]
pub struct BlobWorkerHandle {
    pub entry: WorkerListEntry,
    pub client: Arc<dyn BlobWorkerClient>,
}

impl BlobWorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.entry.id
    }

    pub fn address(&self) -> &str {
        &self.entry.address
    }
}

/// Builds clients for workers known only from their persisted registration,
/// e.g. during recovery of a new manager epoch.
#[async_trait]
pub trait WorkerServiceFactory: fmt::Debug + Send + Sync {
    async fn connect(&self, entry: &WorkerListEntry)
        -> Result<Arc<dyn BlobWorkerClient>, WorkerError>;
}
