// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Record types persisted in the transactional store.
//!
//! Values are BCS-encoded. The encode/decode helpers pair with the key
//! builders in [`crate::keys`]; a record's key carries the components that
//! must sort (ranges, versions), the value carries the rest.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    errors::RecordCodecError,
    ids::{GranuleId, WorkerId},
    ranges::KeyRange,
    Epoch, SeqNo, Version,
};

/// Ownership record for one granule range: the largest `(epoch, seq)` any
/// manager has written for it, plus the owner granule's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleLock {
    pub epoch: Epoch,
    pub seq: SeqNo,
    pub granule_id: GranuleId,
}

/// One parent reference inside a history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleParent {
    pub range: KeyRange,
    pub start_version: Version,
}

/// Immutable record of a granule's identity and ancestry, keyed by
/// `(range, end version)`. The set of these entries forms the history DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleHistoryValue {
    pub granule_id: GranuleId,
    pub parents: Vec<GranuleParent>,
}

/// Progress of one child granule through a split.
///
/// The manager only ever writes `Initialized`; workers advance the state as
/// they open and persist the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitState {
    Initialized,
    Assigned,
    Done,
}

/// Value of the reserved sentinel boundary row: orders concurrent splits of
/// the same range during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBoundaryValue {
    pub epoch: Epoch,
    pub seq: SeqNo,
}

/// Inventory row for one snapshot or delta file; the object-store path is
/// all the manager ever needs (it never reads file contents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleFileRecord {
    pub path: String,
    pub length: u64,
}

/// A user request to reclaim files below a version in some range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneIntent {
    pub version: Version,
    pub force: bool,
}

/// Persisted registration of a blob worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerListEntry {
    pub id: WorkerId,
    /// Stable network address; unique among living workers.
    pub address: String,
    /// Data-center the worker runs in.
    pub dc: Option<String>,
}

/// Encodes a record value as BCS bytes.
pub fn encode_value<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(bcs::to_bytes(value).expect("record types always serialize"))
}

/// Decodes a record value, rejecting empty values.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RecordCodecError> {
    if bytes.is_empty() {
        return Err(RecordCodecError::Empty);
    }
    Ok(bcs::from_bytes(bytes)?)
}

/// Decodes a boundary-row value that may legitimately be empty (an empty
/// value marks the end of a mapped span).
pub fn decode_optional_value<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<Option<T>, RecordCodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(bcs::from_bytes(bytes)?))
}

/// Value of the manager epoch key.
pub fn encode_epoch(epoch: Epoch) -> Bytes {
    encode_value(&epoch)
}

pub fn decode_epoch(bytes: &[u8]) -> Result<Epoch, RecordCodecError> {
    decode_value(bytes)
}

/// The active flag stored in client blob-range boundary rows.
pub const BLOB_RANGE_ACTIVE: &[u8] = b"1";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Uid;

    fn range(begin: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(Bytes::copy_from_slice(begin), Bytes::copy_from_slice(end))
    }

    #[test]
    fn lock_round_trip() {
        let lock = GranuleLock {
            epoch: 3,
            seq: 17,
            granule_id: Uid::from_bytes([5; 16]),
        };
        let encoded = encode_value(&lock);
        assert_eq!(decode_value::<GranuleLock>(&encoded).unwrap(), lock);
    }

    #[test]
    fn history_round_trip() {
        let value = GranuleHistoryValue {
            granule_id: Uid::from_bytes([1; 16]),
            parents: vec![GranuleParent {
                range: range(b"a", b"z"),
                start_version: 42,
            }],
        };
        let encoded = encode_value(&value);
        assert_eq!(decode_value::<GranuleHistoryValue>(&encoded).unwrap(), value);
    }

    #[test]
    fn empty_values_are_rejected_or_none() {
        assert!(matches!(
            decode_value::<PruneIntent>(b""),
            Err(RecordCodecError::Empty)
        ));
        assert_eq!(decode_optional_value::<WorkerId>(b"").unwrap(), None);
    }
}
