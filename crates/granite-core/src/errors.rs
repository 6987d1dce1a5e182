// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Decoding errors for system keys and persisted records.

/// Failure to decode a system key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyCodecError {
    #[error("key does not belong to the expected subspace")]
    WrongSubspace,
    #[error("key ended before all components were read")]
    Truncated,
    #[error("key has bytes past its last component")]
    TrailingBytes,
    #[error("identifier component has the wrong width")]
    MalformedId,
}

/// Failure to decode a persisted record value.
#[derive(Debug, thiserror::Error)]
pub enum RecordCodecError {
    #[error("malformed record value: {0}")]
    Value(#[from] bcs::Error),
    #[error("record value is empty")]
    Empty,
}
