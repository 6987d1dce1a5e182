// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Half-open key ranges and the range-interval map.

use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound::{Excluded, Included, Unbounded},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque byte-string key.
pub type Key = Bytes;

/// A half-open key range `[begin, end)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    /// Creates a range; `begin` must not exceed `end`.
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        let (begin, end) = (begin.into(), end.into());
        assert!(begin <= end, "key range begin must not exceed end");
        Self { begin, end }
    }

    /// The universe of granule keys. System keys sort above it and are
    /// never granulated.
    pub fn normal() -> Self {
        Self::new(Bytes::new(), Bytes::from_static(b"\xff"))
    }

    /// The range containing exactly `key`.
    pub fn single(key: impl Into<Key>) -> Self {
        let begin = key.into();
        let mut end = Vec::with_capacity(begin.len() + 1);
        end.extend_from_slice(&begin);
        end.push(0x00);
        Self {
            begin,
            end: Bytes::from(end),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_ref() <= key && key < self.end.as_ref()
    }

    /// True iff `self` fully contains `other`.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// The overlap of two ranges, or `None` if they are disjoint.
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let begin = self.begin.clone().max(other.begin.clone());
        let end = self.end.clone().min(other.end.clone());
        (begin < end).then(|| KeyRange { begin, end })
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            printable(&self.begin),
            printable(&self.end)
        )
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Renders a key for logs, escaping non-printable bytes.
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &byte in key {
        if byte.is_ascii_graphic() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
    out
}

/// A map from disjoint half-open key ranges to values.
///
/// The map always tiles its universe exactly: for every key in the universe
/// there is exactly one entry, and neighboring entries share boundaries.
/// Internally this is a `BTreeMap` of range-start boundaries, so inserts and
/// intersection seeks are `O(log n)`.
#[derive(Clone, Debug)]
pub struct RangeMap<V> {
    universe: KeyRange,
    // INV: contains an entry at `universe.begin`; all keys lie within the
    // universe.
    boundaries: BTreeMap<Key, V>,
}

impl<V: Clone + PartialEq> RangeMap<V> {
    /// Creates a map covering `universe` with a single `default` entry.
    pub fn new(universe: KeyRange, default: V) -> Self {
        assert!(!universe.is_empty(), "range map universe must be non-empty");
        let mut boundaries = BTreeMap::new();
        boundaries.insert(universe.begin.clone(), default);
        Self {
            universe,
            boundaries,
        }
    }

    pub fn universe(&self) -> &KeyRange {
        &self.universe
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    /// Inserts `value` over `range`, splitting or overwriting whatever
    /// overlaps it. Entries partially covered keep their value outside
    /// `range`.
    pub fn insert(&mut self, range: &KeyRange, value: V) {
        let range = match range.intersection(&self.universe) {
            Some(range) => range,
            None => return,
        };

        // Capture the value in effect at `range.end` before truncating, so
        // the suffix of a partially-covered entry survives.
        let value_at_end = (range.end < self.universe.end
            && !self.boundaries.contains_key(&range.end))
        .then(|| self.value_at(&range.end).clone());

        let doomed: Vec<Key> = self
            .boundaries
            .range((Included(range.begin.clone()), Excluded(range.end.clone())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.boundaries.remove(&key);
        }

        self.boundaries.insert(range.begin.clone(), value);
        if let Some(suffix) = value_at_end {
            self.boundaries.insert(range.end.clone(), suffix);
        }
    }

    /// The entry containing `key`, which must lie within the universe.
    pub fn containing(&self, key: &[u8]) -> (KeyRange, &V) {
        assert!(self.universe.contains(key), "key outside range map universe");
        let (begin, value) = self
            .boundaries
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .expect("universe is always covered");
        let end = self
            .boundaries
            .range::<[u8], _>((Excluded(key), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| self.universe.end.clone());
        (KeyRange::new(begin.clone(), end), value)
    }

    fn value_at(&self, key: &Key) -> &V {
        self.boundaries
            .range::<[u8], _>((Unbounded, Included(key.as_ref())))
            .next_back()
            .map(|(_, v)| v)
            .expect("universe is always covered")
    }

    /// All entries overlapping `range`, clipped to it, in key order.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        let range = match range.intersection(&self.universe) {
            Some(range) => range,
            None => return Vec::new(),
        };

        let first_begin = self
            .boundaries
            .range::<[u8], _>((Unbounded, Included(range.begin.as_ref())))
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("universe is always covered");

        let mut out = Vec::new();
        let mut iter = self
            .boundaries
            .range((Included(first_begin), Excluded(range.end.clone())))
            .peekable();
        while let Some((begin, value)) = iter.next() {
            let end = iter
                .peek()
                .map(|(k, _)| (*k).clone())
                .unwrap_or_else(|| self.universe.end.clone());
            let entry = KeyRange::new(begin.clone(), end);
            if let Some(clipped) = entry.intersection(&range) {
                out.push((clipped, value));
            }
        }
        out
    }

    /// All entries in key order.
    pub fn ranges(&self) -> Vec<(KeyRange, &V)> {
        self.intersecting(&self.universe.clone())
    }

    /// Merges neighboring entries with equal values within `within`.
    pub fn coalesce(&mut self, within: &KeyRange) {
        let doomed: Vec<Key> = {
            let mut doomed = Vec::new();
            let mut prev: Option<(&Key, &V)> = None;
            for (key, value) in self.boundaries.range((
                Included(within.begin.clone()),
                Excluded(within.end.clone()),
            )) {
                if let Some((_, prev_value)) = prev {
                    if prev_value == value {
                        doomed.push(key.clone());
                        continue;
                    }
                }
                prev = Some((key, value));
            }
            doomed
        };
        for key in doomed {
            self.boundaries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: &str, end: &str) -> KeyRange {
        KeyRange::new(
            Bytes::copy_from_slice(begin.as_bytes()),
            Bytes::copy_from_slice(end.as_bytes()),
        )
    }

    fn universe() -> KeyRange {
        range("", "z")
    }

    fn entries(map: &RangeMap<u32>) -> Vec<(KeyRange, u32)> {
        map.ranges().into_iter().map(|(r, v)| (r, *v)).collect()
    }

    #[test]
    fn starts_fully_covered() {
        let map = RangeMap::new(universe(), 0u32);
        assert_eq!(entries(&map), vec![(universe(), 0)]);
        assert_eq!(map.containing(b"m"), (universe(), &0));
    }

    #[test]
    fn insert_splits_overlaps() {
        let mut map = RangeMap::new(universe(), 0u32);
        map.insert(&range("b", "d"), 1);
        assert_eq!(
            entries(&map),
            vec![
                (range("", "b"), 0),
                (range("b", "d"), 1),
                (range("d", "z"), 0),
            ]
        );

        // Overwrite across an existing boundary.
        map.insert(&range("c", "f"), 2);
        assert_eq!(
            entries(&map),
            vec![
                (range("", "b"), 0),
                (range("b", "c"), 1),
                (range("c", "f"), 2),
                (range("f", "z"), 0),
            ]
        );
    }

    #[test]
    fn insert_preserves_suffix_value() {
        let mut map = RangeMap::new(universe(), 0u32);
        map.insert(&range("b", "h"), 1);
        map.insert(&range("a", "d"), 2);
        assert_eq!(
            entries(&map),
            vec![
                (range("", "a"), 0),
                (range("a", "d"), 2),
                (range("d", "h"), 1),
                (range("h", "z"), 0),
            ]
        );
    }

    #[test]
    fn insert_clamps_to_universe() {
        let mut map = RangeMap::new(range("c", "x"), 0u32);
        map.insert(&range("a", "e"), 1);
        assert_eq!(
            entries(&map),
            vec![(range("c", "e"), 1), (range("e", "x"), 0)]
        );
    }

    #[test]
    fn intersecting_clips_and_orders() {
        let mut map = RangeMap::new(universe(), 0u32);
        map.insert(&range("b", "d"), 1);
        map.insert(&range("d", "f"), 2);

        let got: Vec<(KeyRange, u32)> = map
            .intersecting(&range("c", "e"))
            .into_iter()
            .map(|(r, v)| (r, *v))
            .collect();
        assert_eq!(got, vec![(range("c", "d"), 1), (range("d", "e"), 2)]);

        assert!(map.intersecting(&range("c", "c")).is_empty());
    }

    #[test]
    fn containing_reports_full_entry() {
        let mut map = RangeMap::new(universe(), 0u32);
        map.insert(&range("b", "d"), 1);
        assert_eq!(map.containing(b"b"), (range("b", "d"), &1));
        assert_eq!(map.containing(b"c"), (range("b", "d"), &1));
        assert_eq!(map.containing(b"d"), (range("d", "z"), &0));
    }

    #[test]
    fn coalesce_merges_equal_neighbors() {
        let mut map = RangeMap::new(universe(), 0u32);
        map.insert(&range("b", "d"), 1);
        map.insert(&range("d", "f"), 1);
        map.insert(&range("f", "h"), 0);
        map.coalesce(&universe());
        assert_eq!(
            entries(&map),
            vec![
                (range("", "b"), 0),
                (range("b", "f"), 1),
                (range("f", "z"), 0),
            ]
        );
    }

    #[test]
    fn tiling_is_preserved_under_mixed_inserts() {
        let mut map = RangeMap::new(universe(), 0u32);
        for (r, v) in [
            (range("a", "q"), 1),
            (range("c", "d"), 2),
            (range("", "b"), 3),
            (range("p", "z"), 4),
        ] {
            map.insert(&r, v);
        }
        let got = entries(&map);
        assert_eq!(got.first().unwrap().0.begin, universe().begin);
        assert_eq!(got.last().unwrap().0.end, universe().end);
        for pair in got.windows(2) {
            assert_eq!(pair[0].0.end, pair[1].0.begin);
        }
    }
}
