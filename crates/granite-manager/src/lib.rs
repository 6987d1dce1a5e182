// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! The Granite Blob Manager.
//!
//! The Blob Manager is the singleton control-plane of the blob-granule tier:
//! it partitions the logical key space into contiguous granules, places each
//! granule on a Blob Worker for continuous snapshotting and delta logging,
//! splits granules that grow too large or too hot, garbage-collects obsolete
//! granule files, and reconstructs all of this after a leadership change.
//!
//! Leadership is fenced by an externally-assigned epoch: a single store key
//! holds the maximum epoch, every persistent mutation re-reads it, and any
//! transaction racing a newer manager aborts. There is no distributed lease.

pub mod cluster;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod object_store;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::BlobManagerConfig;
pub use manager::{BlobManager, BlobManagerHandle};
