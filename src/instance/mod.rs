// SPDX-License-Identifier: MIT
//! Message/attachment instances: per-connection mutable working copies.
//!
//! An instance materializes a full message (or attachment) tree in memory;
//! every mutation stays local until `flush_instance` writes back through the
//! storage layer. Instance ids are monotone per handle; parent links form a
//! tree rooted at a message instance, alternating message → attachment →
//! embedded message.

use std::collections::HashMap;

use tracing::debug;

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::ids::make_local_eid;
use crate::message::{self, AttachmentContent, MessageContent};
use crate::props::*;
use crate::rules::env::RuleEnvironment;

#[derive(Debug, Clone)]
pub enum InstanceContent {
    Message(MessageContent),
    Attachment(AttachmentContent),
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u32,
    pub parent: Option<u32>,
    /// Folder the root message belongs to (0 for floating attachments).
    pub folder_id: u64,
    /// Created fresh rather than loaded from storage.
    pub b_new: bool,
    /// Attachment number within the parent message instance, for
    /// attachment instances.
    pub attachment_num: Option<u32>,
    pub content: InstanceContent,
}

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    last_id: u32,
    map: HashMap<u32, Instance>,
}

impl InstanceRegistry {
    fn insert(&mut self, mut instance: Instance) -> u32 {
        self.last_id += 1;
        instance.id = self.last_id;
        let id = instance.id;
        self.map.insert(id, instance);
        id
    }

    pub fn get(&self, id: u32) -> Option<&Instance> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Instance> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Instance> {
        self.map.remove(&id)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Result of flushing a message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Ok(u64),
    /// Store quota would be exceeded by the write.
    OverQuota,
}

impl DbHandle {
    /// Open a message as an instance, or start an empty one with a fresh
    /// mid when `b_new`.
    pub async fn load_message_instance(
        &self,
        folder_id: u64,
        message_id: u64,
        b_new: bool,
    ) -> Result<u32> {
        let content = if b_new {
            let mid = if message_id != 0 {
                message_id
            } else {
                let mut tx = self.pool.begin().await?;
                let mid = self.allocate_eid_from_folder(&mut tx, folder_id).await?;
                tx.commit().await?;
                mid
            };
            let mut content = MessageContent::new();
            content
                .proplist
                .set(PR_MID, PropValue::I8(make_local_eid(mid) as i64));
            content.proplist.set(PR_MESSAGE_FLAGS, PropValue::Long(0));
            content
        } else {
            let mut conn = self.pool.acquire().await?;
            message::read_message_tx(self, &mut conn, message_id)
                .await?
                .ok_or(StoreError::NotFound)?
        };
        let mut registry = self.instances.lock().await;
        let id = registry.insert(Instance {
            id: 0,
            parent: None,
            folder_id,
            b_new,
            attachment_num: None,
            content: InstanceContent::Message(content),
        });
        debug!(instance = id, folder_id, message_id, b_new, "loaded message instance");
        Ok(id)
    }

    /// Open the embedded message of an attachment instance; with `b_new`,
    /// allocate a fresh mid and start empty.
    pub async fn load_embedded_instance(
        &self,
        attachment_instance: u32,
        b_new: bool,
    ) -> Result<u32> {
        let (folder_id, existing) = {
            let registry = self.instances.lock().await;
            let parent = registry
                .get(attachment_instance)
                .ok_or(StoreError::NullObject)?;
            let InstanceContent::Attachment(att) = &parent.content else {
                return Err(StoreError::InvalidParam("parent is not an attachment instance"));
            };
            (parent.folder_id, att.embedded.clone())
        };
        let content = match (existing, b_new) {
            (Some(embedded), false) => *embedded,
            (None, false) => return Err(StoreError::NotFound),
            (_, true) => {
                let mut tx = self.pool.begin().await?;
                let mid = self.allocate_eid(&mut tx).await?;
                tx.commit().await?;
                let mut content = MessageContent::new();
                content
                    .proplist
                    .set(PR_MID, PropValue::I8(make_local_eid(mid) as i64));
                content
            }
        };
        let mut registry = self.instances.lock().await;
        let id = registry.insert(Instance {
            id: 0,
            parent: Some(attachment_instance),
            folder_id,
            b_new,
            attachment_num: None,
            content: InstanceContent::Message(content),
        });
        Ok(id)
    }

    /// Open an existing attachment of a message instance by number.
    pub async fn load_attachment_instance(
        &self,
        message_instance: u32,
        attachment_num: u32,
    ) -> Result<u32> {
        let mut registry = self.instances.lock().await;
        let parent = registry.get(message_instance).ok_or(StoreError::NullObject)?;
        let folder_id = parent.folder_id;
        let InstanceContent::Message(msg) = &parent.content else {
            return Err(StoreError::InvalidParam("parent is not a message instance"));
        };
        let att = msg
            .attachments
            .get(attachment_num as usize)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        Ok(registry.insert(Instance {
            id: 0,
            parent: Some(message_instance),
            folder_id,
            b_new: false,
            attachment_num: Some(attachment_num),
            content: InstanceContent::Attachment(att),
        }))
    }

    /// Append a new empty attachment slot and open it as an instance.
    pub async fn create_attachment_instance(&self, message_instance: u32) -> Result<(u32, u32)> {
        let mut registry = self.instances.lock().await;
        let parent = registry
            .get_mut(message_instance)
            .ok_or(StoreError::NullObject)?;
        let folder_id = parent.folder_id;
        let InstanceContent::Message(msg) = &mut parent.content else {
            return Err(StoreError::InvalidParam("parent is not a message instance"));
        };
        let num = msg.attachments.len() as u32;
        let mut att = AttachmentContent::default();
        att.proplist.set(PR_ATTACH_NUM, PropValue::Long(num as i32));
        msg.attachments.push(att.clone());
        let id = registry.insert(Instance {
            id: 0,
            parent: Some(message_instance),
            folder_id,
            b_new: true,
            attachment_num: Some(num),
            content: InstanceContent::Attachment(att),
        });
        Ok((id, num))
    }

    /// Deep copy of the instance's message tree.
    pub async fn read_message_instance(&self, instance_id: u32) -> Result<MessageContent> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        match &instance.content {
            InstanceContent::Message(m) => Ok(m.clone()),
            InstanceContent::Attachment(_) => {
                Err(StoreError::InvalidParam("not a message instance"))
            }
        }
    }

    pub async fn read_attachment_instance(&self, instance_id: u32) -> Result<AttachmentContent> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        match &instance.content {
            InstanceContent::Attachment(a) => Ok(a.clone()),
            InstanceContent::Message(_) => {
                Err(StoreError::InvalidParam("not an attachment instance"))
            }
        }
    }

    /// Merge an incoming message tree into the instance. Readonly proptags
    /// are rejected; without `b_force` only absent properties are filled.
    pub async fn write_message_instance(
        &self,
        instance_id: u32,
        incoming: &MessageContent,
        b_force: bool,
    ) -> Result<()> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        let b_new = instance.b_new;
        let InstanceContent::Message(msg) = &mut instance.content else {
            return Err(StoreError::InvalidParam("not a message instance"));
        };
        for (tag, value) in incoming.proplist.iter() {
            if message::is_readonly_message_tag(tag) {
                continue;
            }
            if tag == PR_MESSAGE_FLAGS && !b_new {
                continue;
            }
            if !b_force && msg.proplist.contains(tag) {
                continue;
            }
            set_instance_prop(msg, tag, value.clone());
        }
        if !incoming.recipients.is_empty() {
            msg.recipients = incoming.recipients.clone();
        }
        if !incoming.attachments.is_empty() {
            msg.attachments = incoming.attachments.clone();
        }
        Ok(())
    }

    pub async fn write_attachment_instance(
        &self,
        instance_id: u32,
        incoming: &AttachmentContent,
        b_force: bool,
    ) -> Result<()> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        let InstanceContent::Attachment(att) = &mut instance.content else {
            return Err(StoreError::InvalidParam("not an attachment instance"));
        };
        for (tag, value) in incoming.proplist.iter() {
            if tag == PR_ATTACH_NUM {
                continue;
            }
            if !b_force && att.proplist.contains(tag) {
                continue;
            }
            att.proplist.set(tag, value.clone());
        }
        if let Some(embedded) = &incoming.embedded {
            att.embedded = Some(embedded.clone());
        }
        Ok(())
    }

    /// Drop all content but keep identity (mid) — the ICS upload reset.
    pub async fn clear_message_instance(&self, instance_id: u32) -> Result<()> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        let InstanceContent::Message(msg) = &mut instance.content else {
            return Err(StoreError::InvalidParam("not a message instance"));
        };
        let mid = msg.proplist.get(PR_MID).cloned();
        *msg = MessageContent::new();
        if let Some(mid) = mid {
            msg.proplist.set(PR_MID, mid);
        }
        Ok(())
    }

    /// Re-materialize the instance from storage, discarding local edits.
    pub async fn reload_message_instance(&self, instance_id: u32) -> Result<()> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        if instance.b_new {
            return Err(StoreError::NotSupported);
        }
        let InstanceContent::Message(msg) = &instance.content else {
            return Err(StoreError::InvalidParam("not a message instance"));
        };
        let Some(mid) = msg.mid() else {
            return Err(StoreError::NotFound);
        };
        drop(registry);
        let mut conn = self.pool.acquire().await?;
        let fresh = message::read_message_tx(self, &mut conn, mid)
            .await?
            .ok_or(StoreError::NotFound)?;
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        instance.content = InstanceContent::Message(fresh);
        Ok(())
    }

    pub async fn get_instance_properties(
        &self,
        instance_id: u32,
        proptags: &[u32],
    ) -> Result<PropvalBag> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        let bag = match &instance.content {
            InstanceContent::Message(m) => &m.proplist,
            InstanceContent::Attachment(a) => &a.proplist,
        };
        let mut out = PropvalBag::new();
        for &tag in proptags {
            if let Some(v) = crate::props::restriction::PropSource::get(bag, tag) {
                out.set(tag, v);
            }
        }
        Ok(out)
    }

    pub async fn get_instance_all_proptags(&self, instance_id: u32) -> Result<PropTagArray> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        let mut tags = PropTagArray::default();
        let bag = match &instance.content {
            InstanceContent::Message(m) => &m.proplist,
            InstanceContent::Attachment(a) => &a.proplist,
        };
        for (tag, _) in bag.iter() {
            tags.append_unique(tag);
        }
        Ok(tags)
    }

    /// Set properties on the instance, enforcing the readonly set and the
    /// write-once PR_MESSAGE_FLAGS rule.
    pub async fn set_instance_properties(&self, instance_id: u32, bag: &PropvalBag) -> Result<()> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        let b_new = instance.b_new;
        match &mut instance.content {
            InstanceContent::Message(msg) => {
                for (tag, value) in bag.iter() {
                    if message::is_readonly_message_tag(tag) {
                        return Err(StoreError::AccessDenied);
                    }
                    if tag == PR_MESSAGE_FLAGS && !b_new {
                        return Err(StoreError::AccessDenied);
                    }
                    set_instance_prop(msg, tag, value.clone());
                }
            }
            InstanceContent::Attachment(att) => {
                for (tag, value) in bag.iter() {
                    if tag == PR_ATTACH_NUM {
                        return Err(StoreError::AccessDenied);
                    }
                    set_attachment_prop(att, tag, value.clone());
                }
            }
        }
        Ok(())
    }

    pub async fn remove_instance_properties(
        &self,
        instance_id: u32,
        proptags: &[u32],
    ) -> Result<()> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        let bag = match &mut instance.content {
            InstanceContent::Message(m) => &mut m.proplist,
            InstanceContent::Attachment(a) => &mut a.proplist,
        };
        for &tag in proptags {
            if message::is_readonly_message_tag(tag) {
                return Err(StoreError::AccessDenied);
            }
            bag.remove(tag);
            // Drop the sibling codepage variant too.
            match prop_type(tag) {
                PT_UNICODE => {
                    bag.remove(retag(tag, PT_STRING8));
                }
                PT_STRING8 => {
                    bag.remove(retag(tag, PT_UNICODE));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Walk parents from `dst`; true when `src` is reachable — the guard
    /// against attaching a message inside itself.
    pub async fn check_instance_cycle(&self, src: u32, dst: u32) -> Result<bool> {
        let registry = self.instances.lock().await;
        let mut cur = Some(dst);
        while let Some(id) = cur {
            if id == src {
                return Ok(true);
            }
            cur = registry.get(id).and_then(|i| i.parent);
        }
        Ok(false)
    }

    pub async fn get_embedded_cn(&self, instance_id: u32) -> Result<Option<u64>> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        let InstanceContent::Message(msg) = &instance.content else {
            return Err(StoreError::InvalidParam("not a message instance"));
        };
        if instance.b_new {
            return Ok(None);
        }
        let Some(mid) = msg.mid() else {
            return Ok(None);
        };
        let mut conn = self.pool.acquire().await?;
        Ok(message::message_row(&mut conn, mid)
            .await?
            .map(|r| r.change_number))
    }

    // ── Recipient subops ─────────────────────────────────────────────────────

    pub async fn empty_instance_rcpts(&self, instance_id: u32) -> Result<()> {
        self.with_message_instance(instance_id, |msg| {
            msg.recipients.clear();
            Ok(())
        })
        .await
    }

    pub async fn get_instance_rcpts_num(&self, instance_id: u32) -> Result<u32> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        match &instance.content {
            InstanceContent::Message(m) => Ok(m.recipients.len() as u32),
            _ => Err(StoreError::InvalidParam("not a message instance")),
        }
    }

    pub async fn get_instance_rcpts(&self, instance_id: u32) -> Result<Vec<PropvalBag>> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        match &instance.content {
            InstanceContent::Message(m) => Ok(m.recipients.clone()),
            _ => Err(StoreError::InvalidParam("not a message instance")),
        }
    }

    /// Row-id keyed upsert/delete of recipient rows: an incoming row with an
    /// unknown PR_ROWID appends, a known one replaces, and a row carrying
    /// only PR_ROWID deletes.
    pub async fn update_instance_rcpts(
        &self,
        instance_id: u32,
        rows: &[PropvalBag],
    ) -> Result<()> {
        self.with_message_instance(instance_id, |msg| {
            for row in rows {
                let rowid = row.get(PR_ROWID).and_then(|v| v.as_int());
                let pos = rowid.and_then(|rid| {
                    msg.recipients.iter().position(|r| {
                        r.get(PR_ROWID).and_then(|v| v.as_int()) == Some(rid)
                    })
                });
                if row.len() == 1 && rowid.is_some() {
                    if let Some(pos) = pos {
                        msg.recipients.remove(pos);
                    }
                } else {
                    match pos {
                        Some(pos) => msg.recipients[pos] = row.clone(),
                        None => msg.recipients.push(row.clone()),
                    }
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn copy_instance_rcpts(&self, src_instance: u32, dst_instance: u32) -> Result<()> {
        let rcpts = self.get_instance_rcpts(src_instance).await?;
        self.with_message_instance(dst_instance, move |msg| {
            msg.recipients = rcpts;
            Ok(())
        })
        .await
    }

    // ── Attachment subops ────────────────────────────────────────────────────

    pub async fn empty_instance_attachments(&self, instance_id: u32) -> Result<()> {
        self.with_message_instance(instance_id, |msg| {
            msg.attachments.clear();
            Ok(())
        })
        .await
    }

    pub async fn get_instance_attachments_num(&self, instance_id: u32) -> Result<u32> {
        let registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?;
        match &instance.content {
            InstanceContent::Message(m) => Ok(m.attachments.len() as u32),
            _ => Err(StoreError::InvalidParam("not a message instance")),
        }
    }

    pub async fn delete_instance_attachment(
        &self,
        instance_id: u32,
        attachment_num: u32,
    ) -> Result<()> {
        self.with_message_instance(instance_id, |msg| {
            if (attachment_num as usize) < msg.attachments.len() {
                msg.attachments.remove(attachment_num as usize);
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        })
        .await
    }

    pub async fn copy_instance_attachments(
        &self,
        src_instance: u32,
        dst_instance: u32,
    ) -> Result<()> {
        let atts = {
            let registry = self.instances.lock().await;
            let instance = registry.get(src_instance).ok_or(StoreError::NullObject)?;
            match &instance.content {
                InstanceContent::Message(m) => m.attachments.clone(),
                _ => return Err(StoreError::InvalidParam("not a message instance")),
            }
        };
        self.with_message_instance(dst_instance, move |msg| {
            msg.attachments = atts;
            Ok(())
        })
        .await
    }

    // ── Flush / unload ───────────────────────────────────────────────────────

    /// Persist the instance. Attachment and embedded instances copy into
    /// their parent instance; a root message instance writes through the
    /// storage layer.
    pub async fn flush_instance(
        &self,
        instance_id: u32,
        env: &dyn RuleEnvironment,
    ) -> Result<FlushResult> {
        let mut registry = self.instances.lock().await;
        let instance = registry.get(instance_id).ok_or(StoreError::NullObject)?.clone();
        match (&instance.content, instance.parent) {
            (InstanceContent::Attachment(att), Some(parent_id)) => {
                let num = instance.attachment_num.unwrap_or(0) as usize;
                let parent = registry.get_mut(parent_id).ok_or(StoreError::NullObject)?;
                let InstanceContent::Message(pmsg) = &mut parent.content else {
                    return Err(StoreError::InvalidParam("attachment parent is not a message"));
                };
                if num < pmsg.attachments.len() {
                    pmsg.attachments[num] = att.clone();
                } else {
                    pmsg.attachments.push(att.clone());
                }
                Ok(FlushResult::Ok(0))
            }
            (InstanceContent::Message(msg), Some(parent_id)) => {
                // Embedded message: copy into the parent attachment instance.
                let parent = registry.get_mut(parent_id).ok_or(StoreError::NullObject)?;
                let InstanceContent::Attachment(patt) = &mut parent.content else {
                    return Err(StoreError::InvalidParam("embedded parent is not an attachment"));
                };
                patt.embedded = Some(Box::new(msg.clone()));
                Ok(FlushResult::Ok(msg.mid().unwrap_or(0)))
            }
            (InstanceContent::Message(msg), None) => {
                let mut msg = msg.clone();
                drop(registry);
                rectify_for_flush(env, &mut msg).await;
                let mut tx = self.pool.begin().await?;
                match self.check_quota(&mut tx, msg.size()).await {
                    Err(StoreError::QuotaExceeded) => return Ok(FlushResult::OverQuota),
                    Err(e) => return Err(e),
                    Ok(()) => {}
                }
                let outcome = crate::message::write_message_tx(
                    self,
                    &mut tx,
                    Some(instance.folder_id),
                    None,
                    &msg,
                )
                .await?;
                tx.commit().await?;
                self.touch();
                let mut registry = self.instances.lock().await;
                if let Some(live) = registry.get_mut(instance_id) {
                    live.b_new = false;
                }
                self.notifier.post(crate::notify::StoreEvent::MessageCreated {
                    folder_id: instance.folder_id,
                    message_id: outcome.message_id,
                });
                crate::table::notify_tables_folder_changed(self, instance.folder_id).await;
                Ok(FlushResult::Ok(outcome.message_id))
            }
            (InstanceContent::Attachment(_), None) => {
                Err(StoreError::InvalidParam("floating attachment instance"))
            }
        }
    }

    /// Release an instance. Parents are left untouched.
    pub async fn unload_instance(&self, instance_id: u32) -> Result<()> {
        let mut registry = self.instances.lock().await;
        registry.remove(instance_id);
        Ok(())
    }

    async fn with_message_instance<F>(&self, instance_id: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut MessageContent) -> Result<()>,
    {
        let mut registry = self.instances.lock().await;
        let instance = registry.get_mut(instance_id).ok_or(StoreError::NullObject)?;
        match &mut instance.content {
            InstanceContent::Message(m) => f(m),
            _ => Err(StoreError::InvalidParam("not a message instance")),
        }
    }
}

/// Property write with codepage-variant hygiene: setting one string variant
/// removes the other, and a rewrite of a cid-backed tag drops stale
/// alternates (plain body rewrite invalidates a derived body, etc.).
fn set_instance_prop(msg: &mut MessageContent, tag: u32, value: PropValue) {
    match prop_type(tag) {
        PT_UNICODE => {
            msg.proplist.remove(retag(tag, PT_STRING8));
        }
        PT_STRING8 => {
            msg.proplist.remove(retag(tag, PT_UNICODE));
        }
        _ => {}
    }
    msg.proplist.set(tag, value);
}

fn set_attachment_prop(att: &mut AttachmentContent, tag: u32, value: PropValue) {
    match prop_type(tag) {
        PT_UNICODE => {
            att.proplist.remove(retag(tag, PT_STRING8));
        }
        PT_STRING8 => {
            att.proplist.remove(retag(tag, PT_UNICODE));
        }
        _ => {}
    }
    att.proplist.set(tag, value);
}

/// Pre-flush fixups: plain-body derivation from HTML when only the HTML
/// changed, and sender entry-id resolution to SMTP columns.
async fn rectify_for_flush(env: &dyn RuleEnvironment, msg: &mut MessageContent) {
    if msg.proplist.contains(PR_HTML)
        && !msg.proplist.contains(PR_BODY)
        && !msg.proplist.contains(PR_BODY_A)
    {
        if let Some(html) = msg.proplist.get(PR_HTML).and_then(|v| v.as_bytes()) {
            let text = html_to_plain(&String::from_utf8_lossy(html));
            msg.proplist.set(PR_BODY, PropValue::Unicode(text));
        }
    }
    for (entry_tag, smtp_tag) in [
        (PR_SENDER_ENTRYID, PR_SENDER_SMTP_ADDRESS),
        (PR_SENT_REPRESENTING_ENTRYID, PR_SENT_REPRESENTING_SMTP_ADDRESS),
    ] {
        if msg.proplist.contains(smtp_tag) {
            continue;
        }
        let Some(entryid) = msg.proplist.get(entry_tag).and_then(|v| v.as_bytes()) else {
            continue;
        };
        if let Some(addr) = env.entryid_to_username(entryid).await {
            msg.proplist.set(smtp_tag, PropValue::Unicode(addr));
        }
    }
}

/// Minimal tag-stripping derivation; real HTML conversion happens in the
/// MIME layer outside the core.
fn html_to_plain(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_plain_strips_tags() {
        assert_eq!(html_to_plain("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn test_registry_monotone_ids() {
        let mut reg = InstanceRegistry::default();
        let a = reg.insert(Instance {
            id: 0,
            parent: None,
            folder_id: 6,
            b_new: true,
            attachment_num: None,
            content: InstanceContent::Message(MessageContent::new()),
        });
        let b = reg.insert(Instance {
            id: 0,
            parent: Some(a),
            folder_id: 6,
            b_new: true,
            attachment_num: Some(0),
            content: InstanceContent::Attachment(AttachmentContent::default()),
        });
        assert!(b > a);
        reg.remove(a);
        let c = reg.insert(Instance {
            id: 0,
            parent: None,
            folder_id: 6,
            b_new: true,
            attachment_num: None,
            content: InstanceContent::Message(MessageContent::new()),
        });
        assert!(c > b);
    }
}
