// SPDX-License-Identifier: MIT
//! Restriction trees and their evaluator.
//!
//! One recursive evaluator serves message filtering (ICS, search folders,
//! content tables), rule conditions and view-row matching: the caller hands
//! in a [`PropSource`] and the tree is evaluated purely against it.
//! Restrictions are serde-serializable; the store persists them as JSON in
//! `rules.condition` and in search-folder criteria.

use serde::{Deserialize, Serialize};

use super::{prop_id, prop_type, retag, PropValue, PropvalBag, PR_ANR, PT_STRING8, PT_UNICODE};

/// Relational operators for RES_PROPERTY / RES_PROPCOMPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// Distribution-list membership; evaluated as substring containment.
    MemberOfDl,
}

/// Fuzzy-level bits for RES_CONTENT.
pub const FL_FULLSTRING: u32 = 0x0000;
pub const FL_SUBSTRING: u32 = 0x0001;
pub const FL_PREFIX: u32 = 0x0002;
pub const FL_IGNORECASE: u32 = 0x0001_0000;
pub const FL_LOOSE: u32 = 0x0004_0000;

pub const BMR_EQZ: u32 = 0;
pub const BMR_NEZ: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Restriction {
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Box<Restriction>),
    Content {
        fuzzy_level: u32,
        proptag: u32,
        value: PropValue,
    },
    Property {
        relop: RelOp,
        proptag: u32,
        value: PropValue,
    },
    PropCompare {
        relop: RelOp,
        proptag1: u32,
        proptag2: u32,
    },
    Bitmask {
        relop: u32,
        proptag: u32,
        mask: u32,
    },
    Size {
        relop: RelOp,
        proptag: u32,
        size: u32,
    },
    Exist {
        proptag: u32,
    },
    /// Nested restriction over message subobjects (recipients/attachments).
    Sub {
        subobject: u32,
        res: Box<Restriction>,
    },
    Comment {
        props: Vec<(u32, PropValue)>,
        res: Option<Box<Restriction>>,
    },
    Count {
        count: u32,
        res: Box<Restriction>,
    },
}

/// Property access surface the evaluator runs against.
pub trait PropSource {
    fn get(&self, proptag: u32) -> Option<PropValue>;

    /// Child rows for RES_SUB: recipient or attachment property bags.
    fn sub_sources(&self, _subobject: u32) -> Vec<Box<dyn PropSource + '_>> {
        Vec::new()
    }

    /// Values probed by the ANR pseudo-tag (display-name-like surface).
    fn anr_values(&self) -> Vec<String> {
        Vec::new()
    }
}

impl PropSource for PropvalBag {
    fn get(&self, proptag: u32) -> Option<PropValue> {
        // A string lookup tolerates the other codepage variant.
        if let Some(v) = PropvalBag::get(self, proptag) {
            return Some(v.clone());
        }
        match prop_type(proptag) {
            PT_UNICODE => PropvalBag::get(self, retag(proptag, PT_STRING8)).cloned(),
            PT_STRING8 => PropvalBag::get(self, retag(proptag, PT_UNICODE)).cloned(),
            _ => None,
        }
    }
}

impl Restriction {
    /// Collect every proptag the tree touches (callers prefetch these).
    pub fn proptags(&self, out: &mut Vec<u32>) {
        match self {
            Restriction::And(list) | Restriction::Or(list) => {
                for r in list {
                    r.proptags(out);
                }
            }
            Restriction::Not(r) => r.proptags(out),
            Restriction::Content { proptag, .. }
            | Restriction::Property { proptag, .. }
            | Restriction::Bitmask { proptag, .. }
            | Restriction::Size { proptag, .. }
            | Restriction::Exist { proptag } => out.push(*proptag),
            Restriction::PropCompare { proptag1, proptag2, .. } => {
                out.push(*proptag1);
                out.push(*proptag2);
            }
            Restriction::Sub { subobject, res } => {
                out.push(*subobject);
                res.proptags(out);
            }
            Restriction::Comment { res, .. } => {
                if let Some(r) = res {
                    r.proptags(out);
                }
            }
            Restriction::Count { res, .. } => res.proptags(out),
        }
    }

    pub fn matches(&self, src: &dyn PropSource) -> bool {
        match self {
            Restriction::And(list) => list.iter().all(|r| r.matches(src)),
            Restriction::Or(list) => list.iter().any(|r| r.matches(src)),
            Restriction::Not(r) => !r.matches(src),
            Restriction::Content { fuzzy_level, proptag, value } => {
                let Some(hay) = src.get(*proptag) else {
                    return false;
                };
                let (Some(hay), Some(needle)) = (hay.as_str(), value.as_str()) else {
                    return false;
                };
                content_match(*fuzzy_level, hay, needle)
            }
            Restriction::Property { relop, proptag, value } => {
                if prop_id(*proptag) == prop_id(PR_ANR) {
                    let Some(needle) = value.as_str() else {
                        return false;
                    };
                    let needle = needle.to_lowercase();
                    return src
                        .anr_values()
                        .iter()
                        .any(|v| v.to_lowercase().contains(&needle));
                }
                let Some(actual) = src.get(*proptag) else {
                    return false;
                };
                relop_eval(*relop, actual.compare(value))
            }
            Restriction::PropCompare { relop, proptag1, proptag2 } => {
                let (Some(a), Some(b)) = (src.get(*proptag1), src.get(*proptag2)) else {
                    return false;
                };
                relop_eval(*relop, a.compare(&b))
            }
            Restriction::Bitmask { relop, proptag, mask } => {
                let bits = src.get(*proptag).and_then(|v| v.as_int()).unwrap_or(0) as u32;
                match *relop {
                    BMR_EQZ => bits & mask == 0,
                    _ => bits & mask != 0,
                }
            }
            Restriction::Size { relop, proptag, size } => {
                let Some(v) = src.get(*proptag) else {
                    return false;
                };
                relop_eval(*relop, Some((v.size()).cmp(size)))
            }
            Restriction::Exist { proptag } => src.get(*proptag).is_some(),
            Restriction::Sub { subobject, res } => src
                .sub_sources(*subobject)
                .iter()
                .any(|child| res.matches(child.as_ref())),
            Restriction::Comment { res, .. } => match res {
                Some(r) => r.matches(src),
                None => true,
            },
            Restriction::Count { count, res } => {
                if *count == 0 {
                    return false;
                }
                res.matches(src)
            }
        }
    }
}

fn relop_eval(relop: RelOp, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    let Some(ord) = ord else {
        return relop == RelOp::Ne;
    };
    match relop {
        RelOp::Lt => ord == Less,
        RelOp::Le => ord != Greater,
        RelOp::Gt => ord == Greater,
        RelOp::Ge => ord != Less,
        RelOp::Eq => ord == Equal,
        RelOp::Ne => ord != Equal,
        RelOp::MemberOfDl => false,
    }
}

fn content_match(fuzzy_level: u32, hay: &str, needle: &str) -> bool {
    let ci = fuzzy_level & (FL_IGNORECASE | FL_LOOSE) != 0;
    let (hay_cmp, needle_cmp) = if ci {
        (hay.to_lowercase(), needle.to_lowercase())
    } else {
        (hay.to_string(), needle.to_string())
    };
    match fuzzy_level & 0xFFFF {
        FL_SUBSTRING => hay_cmp.contains(&needle_cmp),
        FL_PREFIX => hay_cmp.starts_with(&needle_cmp),
        _ => hay_cmp == needle_cmp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{PR_MESSAGE_FLAGS, PR_SUBJECT};

    fn subject_bag(s: &str) -> PropvalBag {
        let mut bag = PropvalBag::new();
        bag.set(PR_SUBJECT, PropValue::Unicode(s.into()));
        bag.set(PR_MESSAGE_FLAGS, PropValue::Long(0x9));
        bag
    }

    #[test]
    fn test_content_substring_ignorecase() {
        let r = Restriction::Content {
            fuzzy_level: FL_SUBSTRING | FL_IGNORECASE,
            proptag: PR_SUBJECT,
            value: PropValue::Unicode("hello".into()),
        };
        assert!(r.matches(&subject_bag("Say Hello World")));
        assert!(!r.matches(&subject_bag("goodbye")));
    }

    #[test]
    fn test_content_prefix_case_sensitive() {
        let r = Restriction::Content {
            fuzzy_level: FL_PREFIX,
            proptag: PR_SUBJECT,
            value: PropValue::Unicode("Re:".into()),
        };
        assert!(r.matches(&subject_bag("Re: status")));
        assert!(!r.matches(&subject_bag("re: status")));
    }

    #[test]
    fn test_bitmask() {
        let nez = Restriction::Bitmask {
            relop: BMR_NEZ,
            proptag: PR_MESSAGE_FLAGS,
            mask: 0x8,
        };
        let eqz = Restriction::Bitmask {
            relop: BMR_EQZ,
            proptag: PR_MESSAGE_FLAGS,
            mask: 0x100,
        };
        let bag = subject_bag("x");
        assert!(nez.matches(&bag));
        assert!(eqz.matches(&bag));
    }

    #[test]
    fn test_and_or_not() {
        let bag = subject_bag("Quarterly report");
        let has = |s: &str| Restriction::Content {
            fuzzy_level: FL_SUBSTRING | FL_IGNORECASE,
            proptag: PR_SUBJECT,
            value: PropValue::Unicode(s.into()),
        };
        let r = Restriction::And(vec![
            has("quarterly"),
            Restriction::Or(vec![has("report"), has("summary")]),
            Restriction::Not(Box::new(has("draft"))),
        ]);
        assert!(r.matches(&bag));
    }

    #[test]
    fn test_missing_property_ne_semantics() {
        let r = Restriction::Property {
            relop: RelOp::Ne,
            proptag: 0x8000_001F,
            value: PropValue::Unicode("x".into()),
        };
        // Absent property: only NE holds.
        assert!(r.matches(&PropvalBag::new()));
        let r_eq = Restriction::Property {
            relop: RelOp::Eq,
            proptag: 0x8000_001F,
            value: PropValue::Unicode("x".into()),
        };
        assert!(!r_eq.matches(&PropvalBag::new()));
    }

    #[test]
    fn test_json_round_trip() {
        let r = Restriction::And(vec![
            Restriction::Exist { proptag: PR_SUBJECT },
            Restriction::Size {
                relop: RelOp::Gt,
                proptag: PR_SUBJECT,
                size: 3,
            },
        ]);
        let blob = serde_json::to_vec(&r).unwrap();
        let back: Restriction = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, r);
    }
}
