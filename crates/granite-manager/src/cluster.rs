// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seam to the cluster controller that offers candidate processes for
//! blob-worker recruitment.

use std::fmt;

use async_trait::async_trait;
use granite_core::WorkerId;

use crate::worker::{BlobWorkerHandle, WorkerError};

/// A process the cluster controller is willing to host a blob worker on.
#[derive(Debug, Clone)]
pub struct CandidateWorker {
    pub address: String,
    pub dc: Option<String>,
}

#[async_trait]
pub trait ClusterController: fmt::Debug + Send + Sync {
    /// Asks for a candidate process, excluding the given stable addresses.
    /// May wait until a candidate becomes available; times out with
    /// [`WorkerError::Timeout`] so the recruiter can refresh its exclusion
    /// list.
    async fn recruit_blob_worker(
        &self,
        exclude_addresses: &[String],
    ) -> Result<CandidateWorker, WorkerError>;

    /// Asks `candidate` to start a blob worker with the given interface id.
    /// On success the worker has registered itself in the store's worker
    /// list and is ready to serve requests.
    async fn initialize_blob_worker(
        &self,
        candidate: &CandidateWorker,
        interface_id: WorkerId,
    ) -> Result<BlobWorkerHandle, WorkerError>;
}
