// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use crate::props::restriction::PropSource;
use crate::props::*;

/// Fully materialized message tree: the unit the instance buffer holds in
/// memory and the delivery path accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub proplist: PropvalBag,
    pub recipients: Vec<PropvalBag>,
    pub attachments: Vec<AttachmentContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentContent {
    pub proplist: PropvalBag,
    pub embedded: Option<Box<MessageContent>>,
}

impl MessageContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mid(&self) -> Option<u64> {
        self.proplist
            .get(PR_MID)
            .and_then(|v| v.as_int())
            .map(|v| crate::ids::gc_of(v as u64))
    }

    pub fn is_associated(&self) -> bool {
        self.proplist
            .get(PR_MESSAGE_FLAGS)
            .and_then(|v| v.as_int())
            .map(|f| f as u32 & MSGFLAG_ASSOCIATED != 0)
            .unwrap_or(false)
    }

    /// Approximate serialized size: property payloads plus children.
    pub fn size(&self) -> u64 {
        let props: u64 = self.proplist.iter().map(|(_, v)| v.size() as u64).sum();
        let rcpts: u64 = self
            .recipients
            .iter()
            .flat_map(|r| r.iter())
            .map(|(_, v)| v.size() as u64)
            .sum();
        let atts: u64 = self.attachments.iter().map(|a| a.size()).sum();
        props + rcpts + atts
    }
}

impl AttachmentContent {
    pub fn size(&self) -> u64 {
        let props: u64 = self.proplist.iter().map(|(_, v)| v.size() as u64).sum();
        props + self.embedded.as_ref().map(|m| m.size()).unwrap_or(0)
    }
}

impl PropSource for MessageContent {
    fn get(&self, proptag: u32) -> Option<PropValue> {
        PropSource::get(&self.proplist, proptag)
    }

    fn sub_sources(&self, subobject: u32) -> Vec<Box<dyn PropSource + '_>> {
        match subobject {
            PR_MESSAGE_RECIPIENTS => self
                .recipients
                .iter()
                .map(|r| Box::new(r.clone()) as Box<dyn PropSource>)
                .collect(),
            PR_MESSAGE_ATTACHMENTS => self
                .attachments
                .iter()
                .map(|a| Box::new(a.proplist.clone()) as Box<dyn PropSource>)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn anr_values(&self) -> Vec<String> {
        let mut out = Vec::new();
        for tag in [PR_DISPLAY_NAME, PR_SENDER_SMTP_ADDRESS, PR_SENT_REPRESENTING_SMTP_ADDRESS] {
            if let Some(v) = self.proplist.get(tag).and_then(|v| v.as_str().map(String::from)) {
                out.push(v);
            }
        }
        for rcpt in &self.recipients {
            for tag in [PR_DISPLAY_NAME, PR_SMTP_ADDRESS, PR_EMAIL_ADDRESS] {
                if let Some(v) = rcpt.get(tag).and_then(|v| v.as_str().map(String::from)) {
                    out.push(v);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_counts_children() {
        let mut msg = MessageContent::new();
        msg.proplist.set(PR_SUBJECT, PropValue::Unicode("abc".into()));
        let mut rcpt = PropvalBag::new();
        rcpt.set(PR_SMTP_ADDRESS, PropValue::Unicode("a@b".into()));
        msg.recipients.push(rcpt);
        let mut att = AttachmentContent::default();
        att.proplist.set(PR_ATTACH_METHOD, PropValue::Long(1));
        msg.attachments.push(att);
        assert!(msg.size() >= 3 + 3 + 4);
    }

    #[test]
    fn test_associated_flag() {
        let mut msg = MessageContent::new();
        assert!(!msg.is_associated());
        msg.proplist
            .set(PR_MESSAGE_FLAGS, PropValue::Long(MSGFLAG_ASSOCIATED as i32));
        assert!(msg.is_associated());
    }
}
