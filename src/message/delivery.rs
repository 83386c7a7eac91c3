// SPDX-License-Identifier: MIT
//! Message delivery: quota gate, received-by stamping, rule pass.

use tracing::{info, warn};

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::Result;
use crate::folder::{PRIVATE_FID_INBOX, PUBLIC_FID_IPMSUBTREE};
use crate::notify::StoreEvent;
use crate::props::*;
use crate::rules::engine::{run_rules, RulePass};
use crate::rules::env::RuleEnvironment;

use super::{write_message_tx, MessageContent};

/// Outcome handed back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Message landed (possibly moved on by rules); the mid is the original
    /// inbox mid.
    Delivered(u64),
    /// Receive quota or message-count cap exceeded.
    MailboxFull,
}

impl DbHandle {
    /// Deliver a transport message into the mailbox and run the folder's
    /// rules. Rule execution errors never fail the delivery.
    pub async fn delivery_message(
        &self,
        env: &dyn RuleEnvironment,
        from_address: &str,
        account: &str,
        content: &MessageContent,
    ) -> Result<DeliveryResult> {
        let mut to_me = false;
        let mut cc_me = false;
        for rcpt in &content.recipients {
            let Some(addr) = rcpt
                .get(PR_SMTP_ADDRESS)
                .and_then(|v| v.as_str().map(String::from))
            else {
                continue;
            };
            if !addr.eq_ignore_ascii_case(account) {
                continue;
            }
            match rcpt.get(PR_RECIPIENT_TYPE).and_then(|v| v.as_int()) {
                Some(t) if t as u32 == RECIPIENT_TYPE_TO => to_me = true,
                Some(t) if t as u32 == RECIPIENT_TYPE_CC => cc_me = true,
                _ => {}
            }
            if to_me || cc_me {
                break;
            }
        }

        let mut tx = self.pool.begin().await?;
        if !self.check_receive_quota(&mut tx, content.size()).await? {
            info!(account, "delivery rejected: mailbox full");
            return Ok(DeliveryResult::MailboxFull);
        }
        let (fid, b_oof) = if self.private {
            let oof = properties::get_property(self, &mut tx, PropTable::Store, 0, PR_OOF_STATE)
                .await?
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            (PRIVATE_FID_INBOX, oof)
        } else {
            (PUBLIC_FID_IPMSUBTREE, false)
        };

        let mut msg = content.clone();
        rectify_delivered(self, env, account, to_me, cc_me, &mut msg).await;
        let outcome = write_message_tx(self, &mut tx, Some(fid), None, &msg).await?;
        let mid = outcome.message_id;

        let mut pass = RulePass::new(env, from_address, account, b_oof);
        pass.folder_list.push(fid);
        if let Err(e) = run_rules(self, &mut tx, &mut pass, fid, mid).await {
            // Rule failures are recorded on the rules themselves; the
            // delivery must still land.
            warn!(account, mid, err = %e, "rule pass failed");
            pass.msg_list.push((fid, mid));
        }
        tx.commit().await?;
        self.touch();

        for (folder_id, message_id) in &pass.msg_list {
            self.notifier.post(StoreEvent::NewMail {
                folder_id: *folder_id,
                message_id: *message_id,
            });
            crate::table::notify_tables_folder_changed(self, *folder_id).await;
        }
        info!(account, mid, folder = fid, "message delivered");
        Ok(DeliveryResult::Delivered(mid))
    }
}

/// Delivery-time property rectification: delivery time, flag hygiene,
/// to/cc-me flags and the received-by block.
async fn rectify_delivered(
    handle: &DbHandle,
    env: &dyn RuleEnvironment,
    account: &str,
    to_me: bool,
    cc_me: bool,
    msg: &mut MessageContent,
) {
    let now = nttime_now();
    msg.proplist.set(PR_MESSAGE_DELIVERY_TIME, PropValue::SysTime(now));
    let flags = msg
        .proplist
        .get(PR_MESSAGE_FLAGS)
        .and_then(|v| v.as_int())
        .unwrap_or(0) as u32;
    msg.proplist.set(
        PR_MESSAGE_FLAGS,
        PropValue::Long((flags & !(MSGFLAG_UNSENT | MSGFLAG_READ)) as i32),
    );
    msg.proplist.set(PR_MESSAGE_TO_ME, PropValue::Bool(to_me));
    msg.proplist.set(PR_MESSAGE_CC_ME, PropValue::Bool(cc_me));
    msg.proplist
        .set(PR_MESSAGE_RECIP_ME, PropValue::Bool(to_me || cc_me));
    if !handle.private {
        return;
    }
    if let Some(entryid) = env.username_to_entryid(account).await {
        msg.proplist
            .set(PR_RECEIVED_BY_ENTRYID, PropValue::Binary(entryid));
    }
    msg.proplist
        .set(PR_RECEIVED_BY_ADDRTYPE, PropValue::Unicode("SMTP".into()));
    msg.proplist.set(
        PR_RECEIVED_BY_EMAIL_ADDRESS,
        PropValue::Unicode(account.to_string()),
    );
    let mut search_key = account.to_uppercase().into_bytes();
    search_key.push(0);
    msg.proplist
        .set(PR_RECEIVED_BY_SEARCH_KEY, PropValue::Binary(search_key));
    if let Some(name) = env.user_displayname(account).await {
        msg.proplist.set(PR_RECEIVED_BY_NAME, PropValue::Unicode(name));
    }
}
