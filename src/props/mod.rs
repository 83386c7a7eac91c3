// SPDX-License-Identifier: MIT
//! Property model: tagged values, property bags, proptag helpers.
//!
//! A proptag is a 32-bit value — 16-bit property id in the high half,
//! 16-bit type in the low half. The engine stores strings as UTF-8
//! internally and converts/truncates only at the row-retrieval boundary.

pub mod idset;
pub mod pcl;
pub mod restriction;
pub mod tags;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use tags::*;

/// Maximum byte length of a string/binary cell handed back through a
/// view-table row; longer values are truncated (strings on a codepoint
/// boundary). Blob retrieval through the content-id store is unaffected.
pub const ROW_VALUE_LIMIT: usize = 510;

#[inline]
pub const fn prop_type(proptag: u32) -> u16 {
    (proptag & 0xFFFF) as u16
}

#[inline]
pub const fn prop_id(proptag: u32) -> u16 {
    (proptag >> 16) as u16
}

#[inline]
pub const fn make_proptag(id: u16, ptype: u16) -> u32 {
    ((id as u32) << 16) | ptype as u32
}

/// Swap the type half of a proptag.
#[inline]
pub const fn retag(proptag: u32, ptype: u16) -> u32 {
    make_proptag(prop_id(proptag), ptype)
}

/// A single typed MAPI property value. Multi-value variants carry the full
/// element vector; instanced (MVI) handling happens in the table engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum PropValue {
    Short(i16),
    Long(i32),
    Float(f32),
    Double(f64),
    Currency(i64),
    AppTime(f64),
    Bool(bool),
    I8(i64),
    /// NT FILETIME: 100ns intervals since 1601-01-01.
    SysTime(u64),
    Unicode(String),
    /// Legacy 8-bit codepage string; held as UTF-8 internally.
    String8(String),
    Guid(Uuid),
    Binary(Vec<u8>),
    SvrEid(Vec<u8>),
    Object(Vec<u8>),
    MvShort(Vec<i16>),
    MvLong(Vec<i32>),
    MvI8(Vec<i64>),
    MvUnicode(Vec<String>),
    MvString8(Vec<String>),
    MvGuid(Vec<Uuid>),
    MvBinary(Vec<Vec<u8>>),
    MvSysTime(Vec<u64>),
}

impl PropValue {
    /// The PT_* type constant this value carries.
    pub fn ptype(&self) -> u16 {
        match self {
            PropValue::Short(_) => PT_SHORT,
            PropValue::Long(_) => PT_LONG,
            PropValue::Float(_) => PT_FLOAT,
            PropValue::Double(_) => PT_DOUBLE,
            PropValue::Currency(_) => PT_CURRENCY,
            PropValue::AppTime(_) => PT_APPTIME,
            PropValue::Bool(_) => PT_BOOLEAN,
            PropValue::I8(_) => PT_I8,
            PropValue::SysTime(_) => PT_SYSTIME,
            PropValue::Unicode(_) => PT_UNICODE,
            PropValue::String8(_) => PT_STRING8,
            PropValue::Guid(_) => PT_CLSID,
            PropValue::Binary(_) => PT_BINARY,
            PropValue::SvrEid(_) => PT_SVREID,
            PropValue::Object(_) => PT_OBJECT,
            PropValue::MvShort(_) => PT_MV_SHORT,
            PropValue::MvLong(_) => PT_MV_LONG,
            PropValue::MvI8(_) => PT_MV_I8,
            PropValue::MvUnicode(_) => PT_MV_UNICODE,
            PropValue::MvString8(_) => PT_MV_STRING8,
            PropValue::MvGuid(_) => PT_MV_CLSID,
            PropValue::MvBinary(_) => PT_MV_BINARY,
            PropValue::MvSysTime(_) => PT_MV_SYSTIME,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Unicode(s) | PropValue::String8(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropValue::Binary(b) | PropValue::SvrEid(b) | PropValue::Object(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Widen any integer-family value to i64 for comparison and sorting.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Short(v) => Some(*v as i64),
            PropValue::Long(v) => Some(*v as i64),
            PropValue::Currency(v) | PropValue::I8(v) => Some(*v),
            PropValue::SysTime(v) => Some(*v as i64),
            PropValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(v) => Some(*v as f64),
            PropValue::Double(v) | PropValue::AppTime(v) => Some(*v),
            _ => None,
        }
    }

    /// Approximate in-store size in bytes, used for quota accounting.
    pub fn size(&self) -> u32 {
        match self {
            PropValue::Short(_) => 2,
            PropValue::Long(_) | PropValue::Float(_) => 4,
            PropValue::Bool(_) => 1,
            PropValue::Double(_)
            | PropValue::Currency(_)
            | PropValue::AppTime(_)
            | PropValue::I8(_)
            | PropValue::SysTime(_) => 8,
            PropValue::Unicode(s) | PropValue::String8(s) => s.len() as u32 + 1,
            PropValue::Guid(_) => 16,
            PropValue::Binary(b) | PropValue::SvrEid(b) | PropValue::Object(b) => b.len() as u32,
            PropValue::MvShort(v) => 2 * v.len() as u32,
            PropValue::MvLong(v) => 4 * v.len() as u32,
            PropValue::MvI8(v) => 8 * v.len() as u32,
            PropValue::MvSysTime(v) => 8 * v.len() as u32,
            PropValue::MvUnicode(v) | PropValue::MvString8(v) => {
                v.iter().map(|s| s.len() as u32 + 1).sum()
            }
            PropValue::MvGuid(v) => 16 * v.len() as u32,
            PropValue::MvBinary(v) => v.iter().map(|b| b.len() as u32).sum(),
        }
    }

    /// Total-order comparison used by restriction relops. Values of
    /// incompatible families compare as unequal-and-unordered (None).
    pub fn compare(&self, other: &PropValue) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        if let (Some(a), Some(b)) = (self.as_int(), other.as_int()) {
            return Some(a.cmp(&b));
        }
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b);
        }
        if let (Some(a), Some(b)) = (self.as_str(), other.as_str()) {
            return Some(a.to_lowercase().cmp(&b.to_lowercase()));
        }
        if let (Some(a), Some(b)) = (self.as_bytes(), other.as_bytes()) {
            return Some(a.cmp(b));
        }
        if let (PropValue::Guid(a), PropValue::Guid(b)) = (self, other) {
            return Some(a.as_bytes().cmp(b.as_bytes()));
        }
        if self == other {
            return Some(Ordering::Equal);
        }
        None
    }
}

/// An unordered property bag: last write wins per proptag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropvalBag {
    entries: Vec<(u32, PropValue)>,
}

impl PropvalBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, proptag: u32) -> Option<&PropValue> {
        self.entries.iter().find(|(t, _)| *t == proptag).map(|(_, v)| v)
    }

    pub fn set(&mut self, proptag: u32, value: PropValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(t, _)| *t == proptag) {
            slot.1 = value;
        } else {
            self.entries.push((proptag, value));
        }
    }

    pub fn remove(&mut self, proptag: u32) -> Option<PropValue> {
        let pos = self.entries.iter().position(|(t, _)| *t == proptag)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, proptag: u32) -> bool {
        self.entries.iter().any(|(t, _)| *t == proptag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &PropValue)> {
        self.entries.iter().map(|(t, v)| (*t, v))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = (u32, &mut PropValue)> {
        self.entries.iter_mut().map(|(t, v)| (*t, v))
    }

    pub fn proptags(&self) -> Vec<u32> {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    /// Merge `other` into self. With `force`, incoming values overwrite;
    /// without, only absent proptags are filled in.
    pub fn merge(&mut self, other: &PropvalBag, force: bool) {
        for (tag, val) in other.iter() {
            if force || !self.contains(tag) {
                self.set(tag, val.clone());
            }
        }
    }
}

impl FromIterator<(u32, PropValue)> for PropvalBag {
    fn from_iter<I: IntoIterator<Item = (u32, PropValue)>>(iter: I) -> Self {
        let mut bag = PropvalBag::new();
        for (t, v) in iter {
            bag.set(t, v);
        }
        bag
    }
}

/// Ordered proptag list with append-unique semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropTagArray(pub Vec<u32>);

impl PropTagArray {
    pub fn append_unique(&mut self, proptag: u32) {
        if !self.0.contains(&proptag) {
            self.0.push(proptag);
        }
    }

    pub fn index_of(&self, proptag: u32) -> Option<usize> {
        self.0.iter().position(|t| *t == proptag)
    }
}

/// Seconds between the NT epoch (1601-01-01) and the Unix epoch.
const NT_UNIX_DELTA: i64 = 11_644_473_600;

/// Current wall clock as an NT FILETIME.
pub fn nttime_now() -> u64 {
    nttime_from(Utc::now())
}

pub fn nttime_from(dt: DateTime<Utc>) -> u64 {
    let micros = dt.timestamp_micros() + NT_UNIX_DELTA * 1_000_000;
    (micros as u64) * 10
}

pub fn nttime_to_datetime(nt: u64) -> Option<DateTime<Utc>> {
    let micros = (nt / 10) as i64 - NT_UNIX_DELTA * 1_000_000;
    Utc.timestamp_micros(micros).single()
}

/// Truncate a string to at most `limit` bytes on a char boundary.
pub fn truncate_str(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Apply the row-retrieval truncation contract to a value in place.
pub fn truncate_for_row(value: &mut PropValue) {
    match value {
        PropValue::Unicode(s) | PropValue::String8(s) => {
            if s.len() > ROW_VALUE_LIMIT {
                let cut = truncate_str(s, ROW_VALUE_LIMIT).len();
                s.truncate(cut);
            }
        }
        PropValue::Binary(b) | PropValue::Object(b) | PropValue::SvrEid(b) => {
            if b.len() > ROW_VALUE_LIMIT {
                b.truncate(ROW_VALUE_LIMIT);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bag_last_write_wins() {
        let mut bag = PropvalBag::new();
        bag.set(PR_SUBJECT, PropValue::Unicode("a".into()));
        bag.set(PR_SUBJECT, PropValue::Unicode("b".into()));
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get(PR_SUBJECT).unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        // 'é' is two bytes in UTF-8; a cut in the middle must back off.
        let s = "a".repeat(509) + "é";
        let t = truncate_str(&s, 510);
        assert_eq!(t.len(), 509);
        assert!(t.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_nttime_round_trip() {
        let now = Utc::now();
        let nt = nttime_from(now);
        let back = nttime_to_datetime(nt).unwrap();
        assert_eq!(now.timestamp_micros(), back.timestamp_micros());
    }

    #[test]
    fn test_compare_mixed_ints() {
        let a = PropValue::Short(5);
        let b = PropValue::I8(7);
        assert_eq!(a.compare(&b), Some(std::cmp::Ordering::Less));
    }

    #[test]
    fn test_proptag_helpers() {
        assert_eq!(prop_type(PR_SUBJECT), PT_UNICODE);
        assert_eq!(make_proptag(prop_id(PR_SUBJECT), PT_STRING8), PR_SUBJECT_A);
    }
}
