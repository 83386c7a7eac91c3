// SPDX-License-Identifier: MIT
//! ID sets: per-replica sorted range lists over 48-bit counters.
//!
//! This is the watermark carrier for ICS: `given`, `seen`, `seen_fai` and
//! `read` all travel as serialized ID sets. The serialized form is a flat
//! command list per replica — `[u16 replid][u32 nranges]([u64 low][u64 high])*`
//! little-endian, replicas in ascending order — compact enough for the state
//! stream and trivially stable for equality checks.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub low: u64,
    pub high: u64,
}

/// Set of EIDs represented as (replica id → ascending disjoint ranges).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdSet {
    repls: BTreeMap<u16, Vec<Range>>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.repls.values().all(|r| r.is_empty())
    }

    pub fn clear(&mut self) {
        self.repls.clear();
    }

    /// Append a single counter value for a replica.
    pub fn append(&mut self, replid: u16, value: u64) {
        self.append_range(replid, value, value);
    }

    /// Append an inclusive range, merging with neighbours.
    pub fn append_range(&mut self, replid: u16, low: u64, high: u64) {
        if low > high {
            return;
        }
        let ranges = self.repls.entry(replid).or_default();
        ranges.push(Range { low, high });
        Self::normalize(ranges);
    }

    fn normalize(ranges: &mut Vec<Range>) {
        ranges.sort_by_key(|r| r.low);
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.low <= last.high.saturating_add(1) => {
                    last.high = last.high.max(r.high);
                }
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }

    /// Membership test.
    pub fn hint(&self, replid: u16, value: u64) -> bool {
        let Some(ranges) = self.repls.get(&replid) else {
            return false;
        };
        let idx = ranges.partition_point(|r| r.high < value);
        idx < ranges.len() && ranges[idx].low <= value
    }

    /// Highest counter present for a replica, or 0 for an empty set.
    pub fn max_value(&self, replid: u16) -> u64 {
        self.repls
            .get(&replid)
            .and_then(|r| r.last())
            .map(|r| r.high)
            .unwrap_or(0)
    }

    /// Compact ranges (already maintained incrementally; kept for the
    /// operation surface the callers expect).
    pub fn convert(&mut self) {
        for ranges in self.repls.values_mut() {
            Self::normalize(ranges);
        }
    }

    pub fn replids(&self) -> Vec<u16> {
        self.repls.keys().copied().collect()
    }

    pub fn ranges(&self, replid: u16) -> &[Range] {
        self.repls.get(&replid).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Visit every counter of one replica. Ranges can be huge in theory, so
    /// the walk is bounded by the caller's set contents, which for mailbox
    /// sync are id allocations — always enumerable.
    pub fn enumerate_repl(&self, replid: u16, mut f: impl FnMut(u64)) {
        for r in self.ranges(replid) {
            for v in r.low..=r.high {
                f(v);
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (replid, ranges) in &self.repls {
            if ranges.is_empty() {
                continue;
            }
            out.extend_from_slice(&replid.to_le_bytes());
            out.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
            for r in ranges {
                out.extend_from_slice(&r.low.to_le_bytes());
                out.extend_from_slice(&r.high.to_le_bytes());
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut set = IdSet::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if pos + 6 > data.len() {
                return Err(StoreError::InvalidParam("truncated idset header"));
            }
            let replid = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let count =
                u32::from_le_bytes([data[pos + 2], data[pos + 3], data[pos + 4], data[pos + 5]])
                    as usize;
            pos += 6;
            if pos + count * 16 > data.len() {
                return Err(StoreError::InvalidParam("truncated idset ranges"));
            }
            for _ in 0..count {
                let low = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
                let high = u64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
                if low > high {
                    return Err(StoreError::InvalidParam("inverted idset range"));
                }
                set.append_range(replid, low, high);
                pos += 16;
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_merges_adjacent() {
        let mut s = IdSet::new();
        s.append(1, 1);
        s.append(1, 2);
        s.append(1, 3);
        assert_eq!(s.ranges(1), &[Range { low: 1, high: 3 }]);
    }

    #[test]
    fn test_hint_across_gap() {
        let mut s = IdSet::new();
        s.append_range(1, 1, 3);
        s.append_range(1, 7, 9);
        assert!(s.hint(1, 2));
        assert!(!s.hint(1, 5));
        assert!(s.hint(1, 9));
        assert!(!s.hint(2, 2));
    }

    #[test]
    fn test_max_value() {
        let mut s = IdSet::new();
        assert_eq!(s.max_value(1), 0);
        s.append_range(1, 4, 10);
        s.append(1, 2);
        assert_eq!(s.max_value(1), 10);
    }

    proptest! {
        #[test]
        fn prop_serialize_round_trip(
            values in prop::collection::vec((1u16..4, 1u64..2000), 0..64)
        ) {
            let mut s = IdSet::new();
            for (r, v) in &values {
                s.append(*r, *v);
            }
            let back = IdSet::deserialize(&s.serialize()).unwrap();
            prop_assert_eq!(&back, &s);
            for (r, v) in &values {
                prop_assert!(back.hint(*r, *v));
            }
        }

        #[test]
        fn prop_hint_matches_membership(
            values in prop::collection::vec(1u64..500, 1..64),
            probe in 1u64..600
        ) {
            let mut s = IdSet::new();
            for v in &values {
                s.append(1, *v);
            }
            prop_assert_eq!(s.hint(1, probe), values.contains(&probe));
        }
    }
}
