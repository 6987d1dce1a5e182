// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! System key subspaces and their binary encodings.
//!
//! Keys are built from a subspace prefix plus escaped components so that
//! encoded keys sort exactly like their component tuples: every component is
//! NUL-terminated with embedded NULs escaped as `\x00\xff`, and version
//! components are appended as raw big-endian words. Peer components
//! (workers, the read path) rely on these exact bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ids::GranuleId, ranges::KeyRange, KeyCodecError, Version, WorkerId};

/// Single key holding the maximum manager epoch ever handed out.
pub const BLOB_MANAGER_EPOCH_KEY: &[u8] = b"\xff/blobManagerEpoch";

/// Boundary rows of the user-declared blob ranges; value `"1"` means active.
pub const BLOB_RANGE_PREFIX: &[u8] = b"\xff/blobRange/";

/// Change counter watched by the client-range reconciler.
pub const BLOB_RANGE_CHANGE_KEY: &[u8] = b"\xff/blobRangeChange";

/// Boundary rows mapping granule ranges to their owning worker.
pub const GRANULE_MAPPING_PREFIX: &[u8] = b"\xff/blobGranuleMapping/";

/// Per-range granule locks `(epoch, seq, granule id)`.
pub const GRANULE_LOCK_PREFIX: &[u8] = b"\xff/blobGranuleLock/";

/// In-progress split boundaries, grouped by parent granule.
pub const SPLIT_BOUNDARY_PREFIX: &[u8] = b"\xff/blobGranuleSplitBoundary/";

/// Per-(parent, child) split progress rows.
pub const SPLIT_STATE_PREFIX: &[u8] = b"\xff/blobGranuleSplit/";

/// Granule history entries keyed by `(range, end version)`.
pub const GRANULE_HISTORY_PREFIX: &[u8] = b"\xff/blobGranuleHistory/";

/// Granule file inventory rows keyed by `(granule, kind, version)`.
pub const GRANULE_FILE_PREFIX: &[u8] = b"\xff/blobGranuleFile/";

/// Prune intent boundary rows.
pub const PRUNE_INTENT_PREFIX: &[u8] = b"\xff/blobGranulePrune/";

/// Change counter watched by the prune engine.
pub const PRUNE_CHANGE_KEY: &[u8] = b"\xff/blobGranulePruneChange";

/// Persisted blob worker registrations.
pub const WORKER_LIST_PREFIX: &[u8] = b"\xff/blobWorkerList/";

// DO NOT CHANGE: reserved boundary key whose value holds the (epoch, seq)
// of the whole split. Real boundaries lie within the normal range and can
// never collide with it.
pub const SPLIT_BOUNDARY_SENTINEL: &[u8] = b"\xff\xff\xff";

fn push_escaped(out: &mut BytesMut, component: &[u8]) {
    for &byte in component {
        out.put_u8(byte);
        if byte == 0x00 {
            out.put_u8(0xff);
        }
    }
    out.put_u8(0x00);
}

/// Reads one escaped component, returning it and the remaining input.
fn take_escaped(input: &[u8]) -> Result<(Vec<u8>, &[u8]), KeyCodecError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            0x00 if input.get(i + 1) == Some(&0xff) => {
                out.push(0x00);
                i += 2;
            }
            0x00 => return Ok((out, &input[i + 1..])),
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Err(KeyCodecError::Truncated)
}

fn take_u64_be(input: &[u8]) -> Result<(u64, &[u8]), KeyCodecError> {
    let bytes: [u8; 8] = input
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(KeyCodecError::Truncated)?;
    Ok((u64::from_be_bytes(bytes), &input[8..]))
}

fn strip_prefix<'a>(key: &'a [u8], prefix: &[u8]) -> Result<&'a [u8], KeyCodecError> {
    key.strip_prefix(prefix)
        .ok_or(KeyCodecError::WrongSubspace)
}

/// The smallest key strictly greater than every key prefixed by `prefix`.
///
/// # Panics
///
/// Panics if `prefix` is empty or all `\xff` (no such key exists).
pub fn strinc(prefix: &[u8]) -> Bytes {
    let trimmed = prefix
        .iter()
        .rposition(|&b| b != 0xff)
        .map(|idx| &prefix[..=idx])
        .expect("prefix must contain a byte below 0xff");
    let mut out = trimmed.to_vec();
    *out.last_mut().expect("non-empty") += 1;
    Bytes::from(out)
}

/// The key range covering every key with the given prefix.
pub fn subspace_range(prefix: &[u8]) -> KeyRange {
    KeyRange::new(Bytes::copy_from_slice(prefix), strinc(prefix))
}

pub fn blob_range_key_for(key: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(BLOB_RANGE_PREFIX.len() + key.len());
    out.put_slice(BLOB_RANGE_PREFIX);
    out.put_slice(key);
    out.freeze()
}

pub fn decode_blob_range_key(key: &[u8]) -> Result<Bytes, KeyCodecError> {
    Ok(Bytes::copy_from_slice(strip_prefix(key, BLOB_RANGE_PREFIX)?))
}

pub fn granule_mapping_key_for(key: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(GRANULE_MAPPING_PREFIX.len() + key.len());
    out.put_slice(GRANULE_MAPPING_PREFIX);
    out.put_slice(key);
    out.freeze()
}

pub fn decode_granule_mapping_key(key: &[u8]) -> Result<Bytes, KeyCodecError> {
    Ok(Bytes::copy_from_slice(strip_prefix(
        key,
        GRANULE_MAPPING_PREFIX,
    )?))
}

pub fn granule_lock_key_for(range: &KeyRange) -> Bytes {
    let mut out = BytesMut::with_capacity(GRANULE_LOCK_PREFIX.len() + range.begin.len() + range.end.len() + 2);
    out.put_slice(GRANULE_LOCK_PREFIX);
    push_escaped(&mut out, &range.begin);
    push_escaped(&mut out, &range.end);
    out.freeze()
}

pub fn split_boundary_key_for(parent: GranuleId, boundary: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(SPLIT_BOUNDARY_PREFIX);
    push_escaped(&mut out, parent.as_bytes());
    push_escaped(&mut out, boundary);
    out.freeze()
}

pub fn decode_split_boundary_key(key: &[u8]) -> Result<(GranuleId, Bytes), KeyCodecError> {
    let rest = strip_prefix(key, SPLIT_BOUNDARY_PREFIX)?;
    let (id, rest) = take_escaped(rest)?;
    let (boundary, rest) = take_escaped(rest)?;
    if !rest.is_empty() {
        return Err(KeyCodecError::TrailingBytes);
    }
    let parent = GranuleId::from_slice(&id).ok_or(KeyCodecError::MalformedId)?;
    Ok((parent, Bytes::from(boundary)))
}

pub fn split_state_key_for(parent: GranuleId, child: GranuleId) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(SPLIT_STATE_PREFIX);
    push_escaped(&mut out, parent.as_bytes());
    push_escaped(&mut out, child.as_bytes());
    out.freeze()
}

pub fn granule_history_key_for(range: &KeyRange, end_version: Version) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(GRANULE_HISTORY_PREFIX);
    push_escaped(&mut out, &range.begin);
    push_escaped(&mut out, &range.end);
    out.put_u64(end_version);
    out.freeze()
}

pub fn decode_granule_history_key(key: &[u8]) -> Result<(KeyRange, Version), KeyCodecError> {
    let rest = strip_prefix(key, GRANULE_HISTORY_PREFIX)?;
    let (begin, rest) = take_escaped(rest)?;
    let (end, rest) = take_escaped(rest)?;
    let (version, rest) = take_u64_be(rest)?;
    if !rest.is_empty() {
        return Err(KeyCodecError::TrailingBytes);
    }
    Ok((KeyRange::new(Bytes::from(begin), Bytes::from(end)), version))
}

/// The key range covering all history versions of exactly `range`.
pub fn granule_history_range_for(range: &KeyRange) -> KeyRange {
    let mut prefix = BytesMut::new();
    prefix.put_slice(GRANULE_HISTORY_PREFIX);
    push_escaped(&mut prefix, &range.begin);
    push_escaped(&mut prefix, &range.end);
    subspace_range(&prefix)
}

/// File inventory kind discriminants; part of the persisted key layout.
pub const FILE_KIND_SNAPSHOT: u8 = 1;
pub const FILE_KIND_DELTA: u8 = 2;

pub fn granule_file_key_for(granule: GranuleId, kind: u8, version: Version) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(GRANULE_FILE_PREFIX);
    push_escaped(&mut out, granule.as_bytes());
    out.put_u8(kind);
    out.put_u64(version);
    out.freeze()
}

pub fn decode_granule_file_key(key: &[u8]) -> Result<(GranuleId, u8, Version), KeyCodecError> {
    let rest = strip_prefix(key, GRANULE_FILE_PREFIX)?;
    let (id, rest) = take_escaped(rest)?;
    let (&kind, rest) = rest.split_first().ok_or(KeyCodecError::Truncated)?;
    let (version, rest) = take_u64_be(rest)?;
    if !rest.is_empty() {
        return Err(KeyCodecError::TrailingBytes);
    }
    let granule = GranuleId::from_slice(&id).ok_or(KeyCodecError::MalformedId)?;
    Ok((granule, kind, version))
}

/// The key range covering every file row of one granule.
pub fn granule_file_range_for(granule: GranuleId) -> KeyRange {
    let mut prefix = BytesMut::new();
    prefix.put_slice(GRANULE_FILE_PREFIX);
    push_escaped(&mut prefix, granule.as_bytes());
    subspace_range(&prefix)
}

pub fn prune_intent_key_for(key: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(PRUNE_INTENT_PREFIX.len() + key.len());
    out.put_slice(PRUNE_INTENT_PREFIX);
    out.put_slice(key);
    out.freeze()
}

pub fn decode_prune_intent_key(key: &[u8]) -> Result<Bytes, KeyCodecError> {
    Ok(Bytes::copy_from_slice(strip_prefix(
        key,
        PRUNE_INTENT_PREFIX,
    )?))
}

pub fn worker_list_key_for(worker: WorkerId) -> Bytes {
    let mut out = BytesMut::with_capacity(WORKER_LIST_PREFIX.len() + 16);
    out.put_slice(WORKER_LIST_PREFIX);
    out.put_slice(worker.as_bytes());
    out.freeze()
}

pub fn decode_worker_list_key(key: &[u8]) -> Result<WorkerId, KeyCodecError> {
    WorkerId::from_slice(strip_prefix(key, WORKER_LIST_PREFIX)?).ok_or(KeyCodecError::MalformedId)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::Uid;

    fn key(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn escaped_components_sort_like_their_tuples() {
        let id = GranuleId::from_bytes([9; 16]);
        let pairs = [
            (key(b"a"), key(b"a\x00b")),
            (key(b"a\x00b"), key(b"ab")),
            (key(b"ab"), key(b"b")),
        ];
        for (lo, hi) in pairs {
            assert!(
                split_boundary_key_for(id, &lo) < split_boundary_key_for(id, &hi),
                "expected {lo:?} < {hi:?} after encoding"
            );
        }
    }

    #[test]
    fn split_boundary_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);
        let parent = GranuleId::random(&mut rng);
        let boundary = key(b"user/\x00key");
        let encoded = split_boundary_key_for(parent, &boundary);
        assert_eq!(
            decode_split_boundary_key(&encoded).unwrap(),
            (parent, boundary)
        );
    }

    #[test]
    fn sentinel_boundary_sorts_after_normal_keys() {
        let parent = GranuleId::from_bytes([1; 16]);
        let normal = split_boundary_key_for(parent, b"zzz");
        let sentinel = split_boundary_key_for(parent, SPLIT_BOUNDARY_SENTINEL);
        assert!(normal < sentinel);
    }

    #[test]
    fn history_key_round_trip_and_version_order() {
        let range = KeyRange::new(key(b"a"), key(b"m"));
        let low = granule_history_key_for(&range, 10);
        let high = granule_history_key_for(&range, 2000);
        assert!(low < high);
        assert_eq!(decode_granule_history_key(&high).unwrap(), (range.clone(), 2000));

        let span = granule_history_range_for(&range);
        assert!(span.contains(&low));
        assert!(span.contains(&high));
        let other = granule_history_key_for(&KeyRange::new(key(b"a"), key(b"z")), 5);
        assert!(!span.contains(&other));
    }

    #[test]
    fn file_key_round_trip_and_range() {
        let granule = GranuleId::from_bytes([7; 16]);
        let snapshot = granule_file_key_for(granule, FILE_KIND_SNAPSHOT, 100);
        assert_eq!(
            decode_granule_file_key(&snapshot).unwrap(),
            (granule, FILE_KIND_SNAPSHOT, 100)
        );

        let span = granule_file_range_for(granule);
        assert!(span.contains(&snapshot));
        let other = granule_file_key_for(GranuleId::from_bytes([8; 16]), FILE_KIND_DELTA, 1);
        assert!(!span.contains(&other));
    }

    #[test]
    fn strinc_handles_trailing_ff() {
        assert_eq!(strinc(b"ab"), key(b"ac"));
        assert_eq!(strinc(b"a\xff\xff"), key(b"b"));
    }

    #[test]
    fn worker_list_round_trip() {
        let id = Uid::from_bytes([3; 16]);
        assert_eq!(
            decode_worker_list_key(&worker_list_key_for(id)).unwrap(),
            id
        );
    }
}
