// SPDX-License-Identifier: MIT
//! Rule model: state bits, action blocks, stored form.
//!
//! Standard rules live in the `rules` table with JSON condition/action
//! columns. Extended rules are FAI messages of class
//! `IPM.ExtendedRule.Message` whose condition/actions blobs additionally
//! carry a named-property block that is remapped to mailbox-local property
//! ids before evaluation.

pub mod engine;
pub mod env;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::props::restriction::Restriction;
use crate::props::{PropValue, PropvalBag};

pub const RULE_STATE_ENABLED: u32 = 0x01;
pub const RULE_STATE_ONLY_WHEN_OOF: u32 = 0x04;
pub const RULE_STATE_EXIT_LEVEL: u32 = 0x10;
pub const RULE_STATE_ERROR: u32 = 0x20;
pub const RULE_STATE_PARSE_ERROR: u32 = 0x40;

// DEM error codes.
pub const RULE_ERROR_GENERIC: u32 = 1;
pub const RULE_ERROR_MOVECOPY: u32 = 4;
pub const RULE_ERROR_TOO_MANY_RCPTS: u32 = 9;
pub const RULE_ERROR_RETRIEVE_TEMPLATE: u32 = 10;

// Reply flavors.
pub const REPLY_FLAVOR_ST: u32 = 0x01;
pub const REPLY_FLAVOR_NS: u32 = 0x02;

// Forward flavors.
pub const FWD_PRESERVE_SENDER: u32 = 0x01;
pub const FWD_DO_NOT_MUNGE_MESSAGE: u32 = 0x02;
pub const FWD_AS_ATTACHMENT: u32 = 0x04;

/// One executable action block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleAction {
    Move { same_store: bool, dst_folder: u64 },
    Copy { same_store: bool, dst_folder: u64 },
    Reply { template_mid: u64, template_guid: Uuid, flavor: u32 },
    OofReply { template_mid: u64, template_guid: Uuid, flavor: u32 },
    Forward { flavor: u32, recipients: Vec<PropvalBag> },
    Delegate { recipients: Vec<PropvalBag> },
    Bounce { code: u32 },
    Tag { proptag: u32, value: PropValue },
    Delete,
    MarkAsRead,
    DeferAction { data: Vec<u8> },
}

impl RuleAction {
    /// Wire-level action-type ordinal, recorded in DEMs.
    pub fn op_code(&self) -> u32 {
        match self {
            RuleAction::Move { .. } => 1,
            RuleAction::Copy { .. } => 2,
            RuleAction::Reply { .. } => 3,
            RuleAction::OofReply { .. } => 4,
            RuleAction::DeferAction { .. } => 5,
            RuleAction::Bounce { .. } => 6,
            RuleAction::Forward { .. } => 7,
            RuleAction::Delegate { .. } => 8,
            RuleAction::Tag { .. } => 9,
            RuleAction::Delete => 10,
            RuleAction::MarkAsRead => 11,
        }
    }
}

/// A rule ready for evaluation, standard or extended.
#[derive(Debug, Clone)]
pub struct LoadedRule {
    pub id: u64,
    pub sequence: u32,
    pub state: u32,
    pub provider: String,
    pub condition: Option<Restriction>,
    pub actions: Vec<RuleAction>,
    /// Extended rules never produce DAMs or DEMs.
    pub extended: bool,
}

/// Stored payload of an extended-rule FAI message: the condition/action
/// blobs plus the embedded named-property block with rule-local ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedRulePayload {
    /// (rule-local propid, property name), looked up or created in the
    /// mailbox's named-property table before evaluation.
    pub named_props: Vec<(u16, String)>,
    pub condition: Option<Restriction>,
    pub actions: Vec<RuleAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_json_round_trip() {
        let actions = vec![
            RuleAction::Move { same_store: true, dst_folder: 100 },
            RuleAction::Bounce { code: 2 },
            RuleAction::Tag {
                proptag: crate::props::PR_IMPORTANCE,
                value: PropValue::Long(2),
            },
        ];
        let text = serde_json::to_string(&actions).unwrap();
        let back: Vec<RuleAction> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, actions);
    }

    #[test]
    fn test_op_codes_distinct() {
        let ops = [
            RuleAction::Delete.op_code(),
            RuleAction::MarkAsRead.op_code(),
            RuleAction::Bounce { code: 0 }.op_code(),
        ];
        assert_eq!(ops.iter().collect::<std::collections::HashSet<_>>().len(), 3);
    }
}
