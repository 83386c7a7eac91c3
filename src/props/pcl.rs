// SPDX-License-Identifier: MIT
//! XIDs and predecessor change lists.
//!
//! An XID pairs a replica GUID with a local counter of 1–8 bytes; the wire
//! form used by SOURCE_KEY / CHANGE_KEY is exactly 22 bytes (16-byte GUID +
//! 6-byte little-endian counter). A PCL is a set of XIDs, at most one per
//! GUID, serialized as size-prefixed XID records.

use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Outcome of comparing two predecessor change lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PclCompare {
    /// `a` strictly dominates `b`.
    Include,
    /// `b` strictly dominates `a`.
    Included,
    Conflict,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xid {
    pub guid: Uuid,
    pub counter: u64,
    /// Serialized counter width in bytes (1–8).
    pub size: u8,
}

impl Xid {
    pub fn new(guid: Uuid, counter: u64) -> Self {
        Xid { guid, counter, size: 6 }
    }

    /// The 22-byte SOURCE_KEY / CHANGE_KEY wire form.
    pub fn to_source_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.extend_from_slice(self.guid.as_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes()[..6]);
        out
    }

    pub fn from_source_key(data: &[u8]) -> Result<Self> {
        if data.len() != 22 {
            return Err(StoreError::InvalidParam("source key must be 22 bytes"));
        }
        Self::from_sized(data)
    }

    /// Parse a GUID + 1..8-byte counter blob (17–24 bytes).
    pub fn from_sized(data: &[u8]) -> Result<Self> {
        if data.len() < 17 || data.len() > 24 {
            return Err(StoreError::InvalidParam("xid must be 17..=24 bytes"));
        }
        let guid = Uuid::from_slice(&data[..16])
            .map_err(|_| StoreError::InvalidParam("malformed xid guid"))?;
        let mut ctr = [0u8; 8];
        ctr[..data.len() - 16].copy_from_slice(&data[16..]);
        Ok(Xid {
            guid,
            counter: u64::from_le_bytes(ctr),
            size: (data.len() - 16) as u8,
        })
    }

    pub fn to_sized(&self) -> Vec<u8> {
        let size = self.size.clamp(1, 8) as usize;
        let mut out = Vec::with_capacity(16 + size);
        out.extend_from_slice(self.guid.as_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes()[..size]);
        out
    }
}

/// Predecessor change list: at most one counter per replica GUID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pcl {
    entries: Vec<Xid>,
}

impl Pcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the serialized form: a sequence of `[u8 len][len bytes xid]`.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut pcl = Pcl::new();
        let mut pos = 0usize;
        while pos < blob.len() {
            let len = blob[pos] as usize;
            pos += 1;
            if len < 17 || len > 24 || pos + len > blob.len() {
                return Err(StoreError::InvalidParam("malformed pcl record"));
            }
            pcl.append(Xid::from_sized(&blob[pos..pos + len])?);
            pos += len;
        }
        Ok(pcl)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut sorted: Vec<&Xid> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.guid.as_bytes().cmp(b.guid.as_bytes()));
        let mut out = Vec::new();
        for xid in sorted {
            let bytes = xid.to_sized();
            out.push(bytes.len() as u8);
            out.extend_from_slice(&bytes);
        }
        out
    }

    /// Add an XID, keeping only the highest counter per GUID.
    pub fn append(&mut self, xid: Xid) {
        if let Some(slot) = self.entries.iter_mut().find(|e| e.guid == xid.guid) {
            if xid.counter > slot.counter {
                *slot = xid;
            }
        } else {
            self.entries.push(xid);
        }
    }

    pub fn merge(&mut self, other: &Pcl) {
        for xid in &other.entries {
            self.append(*xid);
        }
    }

    pub fn counter_for(&self, guid: &Uuid) -> Option<u64> {
        self.entries.iter().find(|e| e.guid == *guid).map(|e| e.counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Xid> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Does every entry of `other` appear in self with a >= counter?
    fn dominates(&self, other: &Pcl) -> bool {
        other.entries.iter().all(|theirs| {
            self.counter_for(&theirs.guid)
                .map(|ours| ours >= theirs.counter)
                .unwrap_or(false)
        })
    }

    pub fn compare(&self, other: &Pcl) -> PclCompare {
        let fwd = self.dominates(other);
        let rev = other.dominates(self);
        match (fwd, rev) {
            (true, true) => PclCompare::Equal,
            (true, false) => PclCompare::Include,
            (false, true) => PclCompare::Included,
            (false, false) => PclCompare::Conflict,
        }
    }
}

/// Parse an existing PCL blob, merge one XID, serialize back.
pub fn pcl_append(existing: Option<&[u8]>, xid: Xid) -> Result<Vec<u8>> {
    let mut pcl = match existing {
        Some(blob) => Pcl::parse(blob)?,
        None => Pcl::new(),
    };
    pcl.append(xid);
    Ok(pcl.serialize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn xid(guid: Uuid, counter: u64) -> Xid {
        Xid::new(guid, counter)
    }

    #[test]
    fn test_source_key_round_trip() {
        let x = xid(Uuid::new_v4(), 0x0000_7766_5544_3322);
        let wire = x.to_source_key();
        assert_eq!(wire.len(), 22);
        let back = Xid::from_source_key(&wire).unwrap();
        assert_eq!(back.guid, x.guid);
        assert_eq!(back.counter, x.counter);
    }

    #[test]
    fn test_append_is_idempotent() {
        let g = Uuid::new_v4();
        let mut p = Pcl::new();
        p.append(xid(g, 5));
        let once = p.serialize();
        p.append(xid(g, 5));
        assert_eq!(p.serialize(), once);
    }

    #[test]
    fn test_append_dominates_lower_counter() {
        let g = Uuid::new_v4();
        let mut p = Pcl::new();
        p.append(xid(g, 9));
        p.append(xid(g, 3));
        assert_eq!(p.counter_for(&g), Some(9));
    }

    #[test]
    fn test_compare_included_after_append() {
        let g = Uuid::new_v4();
        let mut base = Pcl::new();
        base.append(xid(g, 1));
        let mut newer = base.clone();
        newer.append(xid(g, 2));
        assert_eq!(base.compare(&newer), PclCompare::Included);
        assert_eq!(newer.compare(&base), PclCompare::Include);
        assert_eq!(base.compare(&base.clone()), PclCompare::Equal);
    }

    #[test]
    fn test_compare_conflict_on_divergent_guids() {
        let mut a = Pcl::new();
        a.append(xid(Uuid::new_v4(), 1));
        let mut b = Pcl::new();
        b.append(xid(Uuid::new_v4(), 1));
        assert_eq!(a.compare(&b), PclCompare::Conflict);
    }

    proptest! {
        #[test]
        fn prop_parse_serialize_round_trip(entries in prop::collection::vec((any::<u128>(), 1u64..=0xFFFF_FFFF_FFFF), 0..8)) {
            let mut pcl = Pcl::new();
            for (g, c) in entries {
                pcl.append(Xid::new(Uuid::from_u128(g), c));
            }
            let blob = pcl.serialize();
            let back = Pcl::parse(&blob).unwrap();
            prop_assert_eq!(back.serialize(), blob);
        }
    }
}
