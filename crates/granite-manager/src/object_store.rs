// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seam to the object-storage backend holding granule files.
//!
//! The manager only ever deletes blobs; the paths come from file inventory
//! rows in the transactional store and their contents are never read here.

use std::fmt;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait ObjectStore: fmt::Debug + Send + Sync {
    /// Deletes one blob. Deleting a blob that does not exist succeeds, so a
    /// GC sweep interrupted mid-delete can be safely re-run.
    async fn delete_file(&self, path: &str) -> Result<(), ObjectStoreError>;
}
