// SPDX-License-Identifier: MIT
//! The seam between the rule engine and the transport world.
//!
//! SMTP submission, bounce-template production, MIME rebuild for forwards
//! and cross-mailbox delegate injection all live outside the core; the
//! engine reaches them through this trait. Tests install a recording stub.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::MessageContent;

#[async_trait]
pub trait RuleEnvironment: Send + Sync {
    /// Hand a composed message to the SMTP submission queue.
    async fn submit_mail(
        &self,
        from: &str,
        recipients: &[String],
        content: &MessageContent,
    ) -> Result<()>;

    /// Produce and send a bounce for a stored message by reason code.
    async fn bounce_message(
        &self,
        dir: &Path,
        message_id: u64,
        code: u32,
        from: &str,
        account: &str,
    ) -> Result<()>;

    /// Rebuild the MIME off the stored eml and send it onward.
    async fn forward_message(
        &self,
        dir: &Path,
        message_id: u64,
        recipients: &[String],
        flavor: u32,
        from: &str,
    ) -> Result<()>;

    /// Re-inject a message into another user's mailbox (delegate rules).
    async fn deliver_to_mailbox(
        &self,
        target: &str,
        content: &MessageContent,
        from: &str,
    ) -> Result<()>;

    /// Address-book entry id for a local user, if resolvable.
    async fn username_to_entryid(&self, username: &str) -> Option<Vec<u8>>;

    /// Inverse lookup: SMTP address for an address-book entry id.
    async fn entryid_to_username(&self, entryid: &[u8]) -> Option<String>;

    async fn user_displayname(&self, username: &str) -> Option<String>;
}

/// Environment that drops every external effect. Useful for tooling that
/// replays storage operations without a transport.
pub struct NullEnvironment;

#[async_trait]
impl RuleEnvironment for NullEnvironment {
    async fn submit_mail(&self, _: &str, _: &[String], _: &MessageContent) -> Result<()> {
        Ok(())
    }

    async fn bounce_message(&self, _: &Path, _: u64, _: u32, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn forward_message(&self, _: &Path, _: u64, _: &[String], _: u32, _: &str) -> Result<()> {
        Ok(())
    }

    async fn deliver_to_mailbox(&self, _: &str, _: &MessageContent, _: &str) -> Result<()> {
        Ok(())
    }

    async fn username_to_entryid(&self, _: &str) -> Option<Vec<u8>> {
        None
    }

    async fn entryid_to_username(&self, _: &[u8]) -> Option<String> {
        None
    }

    async fn user_displayname(&self, _: &str) -> Option<String> {
        None
    }
}
