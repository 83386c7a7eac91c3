// SPDX-License-Identifier: MIT
//! Message storage operations: full-tree read/write, move/copy, deletion,
//! read state, submit bookkeeping, timers and change-group indices.

pub mod delivery;
pub mod model;

use sqlx::{Row, SqliteConnection, Sqlite, Transaction};
use tracing::{debug, warn};

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::folder;
use crate::ids::make_local_eid;
use crate::notify::StoreEvent;
use crate::props::restriction::Restriction;
use crate::props::*;

pub use model::{AttachmentContent, MessageContent};

/// Proptags a client can never write directly on a message; the engine
/// derives or owns them.
static READONLY_MESSAGE_TAGS: once_cell::sync::Lazy<std::collections::HashSet<u32>> =
    once_cell::sync::Lazy::new(|| {
        [
            PR_MID,
            PR_PARENT_FOLDER_ID,
            PR_FOLDER_ID,
            PR_CHANGE_NUMBER,
            PR_MESSAGE_SIZE,
            PR_MESSAGE_SIZE_EXTENDED,
            PR_HASATTACH,
            PR_DISPLAY_TO,
            PR_DISPLAY_CC,
            PR_DISPLAY_BCC,
            PR_TRANSPORT_MESSAGE_HEADERS,
            PR_TRANSPORT_MESSAGE_HEADERS_A,
            PR_CHANGE_KEY,
            PR_PREDECESSOR_CHANGE_LIST,
        ]
        .into_iter()
        .collect()
    });

pub(crate) fn is_readonly_message_tag(proptag: u32) -> bool {
    READONLY_MESSAGE_TAGS.contains(&proptag)
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRow {
    pub message_id: u64,
    pub parent_fid: Option<u64>,
    pub parent_attid: Option<u64>,
    pub is_associated: bool,
    pub is_deleted: bool,
    pub change_number: u64,
    pub read_state: bool,
    pub message_size: u64,
}

pub(crate) async fn message_row(
    conn: &mut SqliteConnection,
    mid: u64,
) -> Result<Option<MessageRow>> {
    let row = sqlx::query(
        "SELECT message_id, parent_fid, parent_attid, is_associated, is_deleted, \
         change_number, read_state, message_size FROM messages WHERE message_id = ?",
    )
    .bind(mid as i64)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|r| MessageRow {
        message_id: r.get::<i64, _>(0) as u64,
        parent_fid: r.get::<Option<i64>, _>(1).map(|v| v as u64),
        parent_attid: r.get::<Option<i64>, _>(2).map(|v| v as u64),
        is_associated: r.get::<i64, _>(3) != 0,
        is_deleted: r.get::<i64, _>(4) != 0,
        change_number: r.get::<i64, _>(5) as u64,
        read_state: r.get::<i64, _>(6) != 0,
        message_size: r.get::<i64, _>(7) as u64,
    }))
}

// ─── Restriction evaluation over a stored message ────────────────────────────

/// Load the property surface a restriction needs and evaluate it. The full
/// stored bag is used, minus cid-backed blobs unless the tree references
/// them explicitly.
pub(crate) async fn eval_message_restriction(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    mid: u64,
    res: &Restriction,
) -> Result<bool> {
    let mut wanted = Vec::new();
    res.proptags(&mut wanted);
    let content = load_for_eval(handle, conn, mid, &wanted).await?;
    Ok(res.matches(&content))
}

async fn load_for_eval(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    mid: u64,
    wanted: &[u32],
) -> Result<MessageContent> {
    let mut content = MessageContent::new();
    let tags = properties::all_proptags(conn, PropTable::Message, mid).await?;
    for tag in tags.0 {
        if properties::is_cid_tag(PropTable::Message, tag) && !wanted.contains(&tag) {
            continue;
        }
        if let Some(v) = properties::get_property(handle, conn, PropTable::Message, mid, tag).await?
        {
            content.proplist.set(tag, v);
        }
    }
    for tag in [PR_MESSAGE_FLAGS, PR_READ, PR_MESSAGE_SIZE, PR_SUBJECT, PR_MESSAGE_DELIVERY_TIME] {
        if !content.proplist.contains(tag) {
            if let Some(v) =
                properties::get_property(handle, conn, PropTable::Message, mid, tag).await?
            {
                content.proplist.set(tag, v);
            }
        }
    }
    if wanted.contains(&PR_MESSAGE_RECIPIENTS) || wanted.is_empty() {
        content.recipients = read_recipients(handle, conn, mid).await?;
    }
    if wanted.contains(&PR_MESSAGE_ATTACHMENTS) {
        for (attid, _) in attachment_ids(conn, mid).await? {
            let bag = read_bag(handle, conn, PropTable::Attachment, attid).await?;
            content.attachments.push(AttachmentContent { proplist: bag, embedded: None });
        }
    }
    Ok(content)
}

async fn read_bag(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
) -> Result<PropvalBag> {
    let tags = properties::all_proptags(conn, table, id).await?;
    properties::get_properties(handle, conn, table, id, &tags.0).await
}

pub(crate) async fn read_recipients(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    mid: u64,
) -> Result<Vec<PropvalBag>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT recipient_id FROM recipients WHERE message_id = ? ORDER BY recipient_id",
    )
    .bind(mid as i64)
    .fetch_all(&mut *conn)
    .await?;
    let mut out = Vec::with_capacity(ids.len());
    for (idx, rid) in ids.iter().enumerate() {
        let mut bag = read_bag(handle, conn, PropTable::Recipient, *rid as u64).await?;
        bag.set(PR_ROWID, PropValue::Long(idx as i32));
        out.push(bag);
    }
    Ok(out)
}

pub(crate) async fn attachment_ids(
    conn: &mut SqliteConnection,
    mid: u64,
) -> Result<Vec<(u64, u32)>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT attachment_id FROM attachments WHERE message_id = ? ORDER BY attachment_id",
    )
    .bind(mid as i64)
    .fetch_all(conn)
    .await?;
    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(num, id)| (id as u64, num as u32))
        .collect())
}

// ─── Full-tree read / write ──────────────────────────────────────────────────

/// Materialize the complete message tree with cid blobs resolved.
pub(crate) fn read_message_tx<'a>(
    handle: &'a DbHandle,
    conn: &'a mut SqliteConnection,
    mid: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<MessageContent>>> + Send + 'a>>
{
    Box::pin(async move {
        let Some(row) = message_row(conn, mid).await? else {
            return Ok(None);
        };
        let mut content = MessageContent::new();
        let tags = properties::all_proptags(conn, PropTable::Message, mid).await?;
        for tag in tags.0 {
            if let Some(v) =
                properties::get_property(handle, conn, PropTable::Message, mid, tag).await?
            {
                content.proplist.set(tag, v);
            }
        }
        content
            .proplist
            .set(PR_MID, PropValue::I8(make_local_eid(mid) as i64));
        let mut flags = content
            .proplist
            .get(PR_MESSAGE_FLAGS)
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u32;
        if row.read_state {
            flags |= MSGFLAG_READ;
        }
        content.proplist.set(PR_MESSAGE_FLAGS, PropValue::Long(flags as i32));
        content.recipients = read_recipients(handle, conn, mid).await?;
        for (attid, num) in attachment_ids(conn, mid).await? {
            let mut bag = read_bag(handle, conn, PropTable::Attachment, attid).await?;
            bag.set(PR_ATTACH_NUM, PropValue::Long(num as i32));
            let embedded_mid: Option<i64> =
                sqlx::query_scalar("SELECT message_id FROM messages WHERE parent_attid = ?")
                    .bind(attid as i64)
                    .fetch_optional(&mut *conn)
                    .await?;
            let embedded = match embedded_mid {
                Some(emid) => read_message_tx(handle, conn, emid as u64).await?.map(Box::new),
                None => None,
            };
            content.attachments.push(AttachmentContent { proplist: bag, embedded });
        }
        Ok(Some(content))
    })
}

pub(crate) struct WriteOutcome {
    pub message_id: u64,
    pub size: u64,
    pub is_associated: bool,
}

/// Write a full message tree. Replaces the stored tree if the mid already
/// exists (read state is preserved); embedded messages hang off
/// `parent_attid` instead of a folder.
pub(crate) fn write_message_tx<'a>(
    handle: &'a DbHandle,
    tx: &'a mut Transaction<'static, Sqlite>,
    parent_fid: Option<u64>,
    parent_attid: Option<u64>,
    content: &'a MessageContent,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<WriteOutcome>> + Send + 'a>> {
    Box::pin(async move {
        let is_associated = content.is_associated();
        let mid = match content.mid() {
            Some(mid) => mid,
            None => match parent_fid {
                Some(fid) => handle.allocate_eid_from_folder(&mut *tx, fid).await?,
                None => handle.allocate_eid(&mut *tx).await?,
            },
        };
        let old = message_row(&mut *tx, mid).await?;
        let old_size = old.as_ref().map(|r| r.message_size).unwrap_or(0);
        let read_state = old.as_ref().map(|r| r.read_state).unwrap_or(false);
        if old.is_some() {
            purge_message_children(&mut *tx, mid).await?;
        }
        let size = content.size();
        sqlx::query(
            "REPLACE INTO messages (message_id, parent_fid, parent_attid, is_associated, \
             is_deleted, change_number, read_state, message_size) \
             VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(mid as i64)
        .bind(parent_fid.map(|v| v as i64))
        .bind(parent_attid.map(|v| v as i64))
        .bind(is_associated as i64)
        .bind(read_state as i64)
        .bind(size as i64)
        .execute(&mut **tx)
        .await?;
        for (tag, value) in content.proplist.iter() {
            if matches!(
                tag,
                PR_MID | PR_PARENT_FOLDER_ID | PR_CHANGE_NUMBER | PR_MESSAGE_SIZE
                    | PR_MESSAGE_SIZE_EXTENDED | PR_HASATTACH | PR_READ
                    | PR_DISPLAY_TO | PR_DISPLAY_CC | PR_DISPLAY_BCC
            ) {
                continue;
            }
            properties::set_property(handle, &mut *tx, PropTable::Message, mid, tag, value).await?;
        }
        for rcpt in &content.recipients {
            let rid: i64 =
                sqlx::query_scalar("INSERT INTO recipients (message_id) VALUES (?) RETURNING recipient_id")
                    .bind(mid as i64)
                    .fetch_one(&mut **tx)
                    .await?;
            for (tag, value) in rcpt.iter() {
                if tag == PR_ROWID {
                    continue;
                }
                properties::set_property(
                    handle,
                    &mut *tx,
                    PropTable::Recipient,
                    rid as u64,
                    tag,
                    value,
                )
                .await?;
            }
        }
        for att in &content.attachments {
            let attid: i64 =
                sqlx::query_scalar("INSERT INTO attachments (message_id) VALUES (?) RETURNING attachment_id")
                    .bind(mid as i64)
                    .fetch_one(&mut **tx)
                    .await?;
            for (tag, value) in att.proplist.iter() {
                if tag == PR_ATTACH_NUM {
                    continue;
                }
                properties::set_property(
                    handle,
                    &mut *tx,
                    PropTable::Attachment,
                    attid as u64,
                    tag,
                    value,
                )
                .await?;
            }
            if let Some(embedded) = &att.embedded {
                write_message_tx(handle, tx, None, Some(attid as u64), embedded).await?;
            }
        }
        let cn = handle.allocate_cn(&mut *tx).await?;
        properties::stamp_change(handle, &mut *tx, PropTable::Message, mid, cn).await?;
        if !content.proplist.contains(PR_SOURCE_KEY) {
            let key = crate::props::pcl::Xid::new(handle.mailbox_guid, mid).to_source_key();
            properties::set_property(
                handle,
                &mut *tx,
                PropTable::Message,
                mid,
                PR_SOURCE_KEY,
                &PropValue::Binary(key),
            )
            .await?;
        }
        if let Some(fid) = parent_fid {
            properties::touch_folder_commit_time(handle, &mut *tx, fid).await?;
            let (nd, fd) = if is_associated {
                (0i64, size as i64 - old_size as i64)
            } else {
                (size as i64 - old_size as i64, 0i64)
            };
            handle.adjust_store_size(&mut *tx, nd, fd).await?;
            if let Err(e) = crate::search::on_message_changed(handle, &mut *tx, fid, mid).await {
                warn!(mid, err = %e, "dynamic search update failed");
            }
        }
        Ok(WriteOutcome { message_id: mid, size, is_associated })
    })
}

/// Transitive closure of messages embedded under `root`'s attachments.
async fn collect_embedded(conn: &mut SqliteConnection, root: u64) -> Result<Vec<u64>> {
    let mut queue = vec![root];
    let mut found = Vec::new();
    while let Some(mid) = queue.pop() {
        let attids: Vec<i64> =
            sqlx::query_scalar("SELECT attachment_id FROM attachments WHERE message_id = ?")
                .bind(mid as i64)
                .fetch_all(&mut *conn)
                .await?;
        for attid in attids {
            let embedded: Vec<i64> =
                sqlx::query_scalar("SELECT message_id FROM messages WHERE parent_attid = ?")
                    .bind(attid)
                    .fetch_all(&mut *conn)
                    .await?;
            for emid in embedded {
                found.push(emid as u64);
                queue.push(emid as u64);
            }
        }
    }
    Ok(found)
}

/// Delete the child rows of one message (recipients, attachments,
/// properties); the `messages` row itself stays.
async fn strip_message_rows(conn: &mut SqliteConnection, mid: u64) -> Result<()> {
    sqlx::query(
        "DELETE FROM recipients_properties WHERE recipient_id IN \
         (SELECT recipient_id FROM recipients WHERE message_id = ?)",
    )
    .bind(mid as i64)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM recipients WHERE message_id = ?")
        .bind(mid as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "DELETE FROM attachment_properties WHERE attachment_id IN \
         (SELECT attachment_id FROM attachments WHERE message_id = ?)",
    )
    .bind(mid as i64)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM attachments WHERE message_id = ?")
        .bind(mid as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM message_properties WHERE message_id = ?")
        .bind(mid as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn drop_message_row(conn: &mut SqliteConnection, mid: u64) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE message_id = ?")
        .bind(mid as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM search_result WHERE message_id = ?")
        .bind(mid as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM read_states WHERE message_id = ?")
        .bind(mid as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM read_cns WHERE message_id = ?")
        .bind(mid as i64)
        .execute(conn)
        .await?;
    Ok(())
}

/// Clear a message's subtree ahead of a rewrite. Embedded messages of any
/// nesting depth go away entirely; the root's row survives.
async fn purge_message_children(conn: &mut SqliteConnection, mid: u64) -> Result<()> {
    for emid in collect_embedded(conn, mid).await? {
        strip_message_rows(conn, emid).await?;
        drop_message_row(conn, emid).await?;
    }
    strip_message_rows(conn, mid).await
}

pub(crate) async fn hard_delete_message(conn: &mut SqliteConnection, mid: u64) -> Result<()> {
    purge_message_children(conn, mid).await?;
    drop_message_row(conn, mid).await
}

/// Deep-copy a stored message into another folder under a fresh mid.
pub(crate) async fn copy_message_tx(
    handle: &DbHandle,
    tx: &mut Transaction<'static, Sqlite>,
    src_mid: u64,
    dst_fid: u64,
) -> Result<WriteOutcome> {
    let Some(mut content) = read_message_tx(handle, &mut *tx, src_mid).await? else {
        return Err(StoreError::NotFound);
    };
    content.proplist.remove(PR_MID);
    content.proplist.remove(PR_SOURCE_KEY);
    content.proplist.remove(PR_CHANGE_KEY);
    content.proplist.remove(PR_PREDECESSOR_CHANGE_LIST);
    write_message_tx(handle, tx, Some(dst_fid), None, &content).await
}

// ─── Public operation surface ────────────────────────────────────────────────

impl DbHandle {
    pub async fn check_message(&self, folder_id: u64, message_id: u64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(message_row(&mut conn, message_id)
            .await?
            .map(|r| r.parent_fid == Some(folder_id) && !r.is_deleted)
            .unwrap_or(false))
    }

    pub async fn check_message_deleted(&self, message_id: u64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(message_row(&mut conn, message_id)
            .await?
            .map(|r| r.is_deleted)
            .unwrap_or(true))
    }

    pub async fn get_message_properties(
        &self,
        message_id: u64,
        proptags: &[u32],
    ) -> Result<PropvalBag> {
        let mut conn = self.pool.acquire().await?;
        if message_row(&mut conn, message_id).await?.is_none() {
            return Err(StoreError::NotFound);
        }
        properties::get_properties(self, &mut conn, PropTable::Message, message_id, proptags).await
    }

    /// Client-facing property write: readonly tags are rejected, the change
    /// number advances, the parent folder's commit time moves.
    pub async fn set_message_properties(&self, message_id: u64, bag: &PropvalBag) -> Result<()> {
        for (tag, _) in bag.iter() {
            if is_readonly_message_tag(tag) || tag == PR_MESSAGE_FLAGS {
                return Err(StoreError::AccessDenied);
            }
        }
        let mut tx = self.pool.begin().await?;
        let Some(row) = message_row(&mut tx, message_id).await? else {
            return Err(StoreError::NotFound);
        };
        properties::set_properties(self, &mut tx, PropTable::Message, message_id, bag).await?;
        let cn = self.allocate_cn(&mut tx).await?;
        properties::stamp_change(self, &mut tx, PropTable::Message, message_id, cn).await?;
        if let Some(fid) = row.parent_fid {
            properties::touch_folder_commit_time(self, &mut tx, fid).await?;
            if let Err(e) = crate::search::on_message_changed(self, &mut tx, fid, message_id).await
            {
                warn!(message_id, err = %e, "dynamic search update failed");
            }
        }
        tx.commit().await?;
        self.touch();
        if let Some(fid) = row.parent_fid {
            self.notifier.post(StoreEvent::MessageModified {
                folder_id: fid,
                message_id,
            });
            crate::table::notify_tables_message_modified(self, fid, message_id).await;
        }
        Ok(())
    }

    pub async fn remove_message_properties(
        &self,
        message_id: u64,
        proptags: &[u32],
    ) -> Result<()> {
        if proptags.iter().any(|t| is_readonly_message_tag(*t)) {
            return Err(StoreError::AccessDenied);
        }
        let mut tx = self.pool.begin().await?;
        let Some(row) = message_row(&mut tx, message_id).await? else {
            return Err(StoreError::NotFound);
        };
        for &tag in proptags {
            properties::remove_property(&mut tx, PropTable::Message, message_id, tag).await?;
        }
        let cn = self.allocate_cn(&mut tx).await?;
        properties::stamp_change(self, &mut tx, PropTable::Message, message_id, cn).await?;
        tx.commit().await?;
        self.touch();
        if let Some(fid) = row.parent_fid {
            self.notifier.post(StoreEvent::MessageModified {
                folder_id: fid,
                message_id,
            });
        }
        Ok(())
    }

    /// Subject, sender, delivery time and the recipient list — the summary
    /// surface bounce/DEM production renders from.
    pub async fn get_message_brief(&self, message_id: u64) -> Result<Option<MessageContent>> {
        let mut conn = self.pool.acquire().await?;
        if message_row(&mut conn, message_id).await?.is_none() {
            return Ok(None);
        }
        let mut content = MessageContent::new();
        content.proplist = properties::get_properties(
            self,
            &mut conn,
            PropTable::Message,
            message_id,
            &[
                PR_SUBJECT,
                PR_SENDER_SMTP_ADDRESS,
                PR_SENT_REPRESENTING_SMTP_ADDRESS,
                PR_MESSAGE_DELIVERY_TIME,
                PR_MESSAGE_CLASS,
                PR_MESSAGE_SIZE,
            ],
        )
        .await?;
        content.recipients = read_recipients(self, &mut conn, message_id).await?;
        Ok(Some(content))
    }

    /// Set read/unread. Allocates a read change number — the watermark the
    /// ICS read-state stream keys off. Public stores track state per user.
    pub async fn set_message_read_state(
        &self,
        username: Option<&str>,
        message_id: u64,
        read: bool,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = message_row(&mut tx, message_id).await? else {
            return Err(StoreError::NotFound);
        };
        let read_cn = self.allocate_cn(&mut tx).await?;
        if self.private {
            sqlx::query("UPDATE messages SET read_state = ?, read_cn = ? WHERE message_id = ?")
                .bind(read as i64)
                .bind(read_cn as i64)
                .bind(message_id as i64)
                .execute(&mut *tx)
                .await?;
        } else {
            let user = username.ok_or(StoreError::InvalidParam(
                "public read state requires a username",
            ))?;
            if read {
                sqlx::query("REPLACE INTO read_states (message_id, username) VALUES (?, ?)")
                    .bind(message_id as i64)
                    .bind(user)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("DELETE FROM read_states WHERE message_id = ? AND username = ?")
                    .bind(message_id as i64)
                    .bind(user)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("REPLACE INTO read_cns (message_id, username, read_cn) VALUES (?, ?, ?)")
                .bind(message_id as i64)
                .bind(user)
                .bind(read_cn as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.touch();
        if let Some(fid) = row.parent_fid {
            self.notifier.post(StoreEvent::ReadStateChanged {
                folder_id: fid,
                message_id,
                read,
            });
        }
        Ok(read_cn)
    }

    /// Pre-assign a message id inside the folder's reserved range.
    pub async fn allocate_message_id(&self, folder_id: u64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mid = self.allocate_eid_from_folder(&mut tx, folder_id).await?;
        tx.commit().await?;
        Ok(mid)
    }

    pub async fn get_message_group_id(&self, message_id: u64) -> Result<Option<u64>> {
        let mut conn = self.pool.acquire().await?;
        let v: Option<Option<i64>> =
            sqlx::query_scalar("SELECT group_id FROM messages WHERE message_id = ?")
                .bind(message_id as i64)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(v.flatten().map(|g| g as u64))
    }

    pub async fn set_message_group_id(&self, message_id: u64, group_id: u64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE messages SET group_id = ? WHERE message_id = ?")
            .bind(group_id as i64)
            .bind(message_id as i64)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Record which property-group indices changed under a change number —
    /// the partial-replication hint ICS download consumers read back.
    pub async fn save_change_indices(
        &self,
        message_id: u64,
        cn: u64,
        indices: &[u32],
        proptags: &[u32],
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "REPLACE INTO message_changes (message_id, change_number, indices, proptags) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(message_id as i64)
        .bind(crate::ids::gc_of(cn) as i64)
        .bind(serde_json::to_string(indices).unwrap_or_default())
        .bind(serde_json::to_string(proptags).unwrap_or_default())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Union of change-group hints recorded above `cn`.
    pub async fn get_change_indices(
        &self,
        message_id: u64,
        cn: u64,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT indices, proptags FROM message_changes WHERE message_id = ? \
             AND change_number > ?",
        )
        .bind(message_id as i64)
        .bind(crate::ids::gc_of(cn) as i64)
        .fetch_all(&mut *conn)
        .await?;
        let mut indices = Vec::new();
        let mut proptags = Vec::new();
        for row in rows {
            let i: Vec<u32> =
                serde_json::from_str(&row.get::<String, _>(0)).unwrap_or_default();
            let p: Vec<u32> =
                serde_json::from_str(&row.get::<String, _>(1)).unwrap_or_default();
            for v in i {
                if !indices.contains(&v) {
                    indices.push(v);
                }
            }
            for v in p {
                if !proptags.contains(&v) {
                    proptags.push(v);
                }
            }
        }
        Ok((indices, proptags))
    }

    /// Drop the UNMODIFIED bit and advance the change number.
    pub async fn mark_modified(&self, message_id: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let flags = properties::get_property(self, &mut tx, PropTable::Message, message_id, PR_MESSAGE_FLAGS)
            .await?
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u32;
        if flags & MSGFLAG_UNMODIFIED != 0 {
            properties::set_property(
                self,
                &mut tx,
                PropTable::Message,
                message_id,
                PR_MESSAGE_FLAGS,
                &PropValue::Long((flags & !MSGFLAG_UNMODIFIED) as i32),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomically set the SUBMITTED flag; false when already submitted.
    pub async fn try_mark_submit(&self, message_id: u64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let flags = properties::get_property(self, &mut tx, PropTable::Message, message_id, PR_MESSAGE_FLAGS)
            .await?
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u32;
        if flags & MSGFLAG_SUBMITTED != 0 {
            return Ok(false);
        }
        properties::set_property(
            self,
            &mut tx,
            PropTable::Message,
            message_id,
            PR_MESSAGE_FLAGS,
            &PropValue::Long(((flags | MSGFLAG_SUBMITTED) & !MSGFLAG_UNSENT) as i32),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn clear_submit(&self, message_id: u64, unsent: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let flags = properties::get_property(self, &mut tx, PropTable::Message, message_id, PR_MESSAGE_FLAGS)
            .await?
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u32;
        let mut flags = flags & !MSGFLAG_SUBMITTED;
        if unsent {
            flags |= MSGFLAG_UNSENT;
        } else {
            flags &= !MSGFLAG_UNSENT;
        }
        properties::set_property(
            self,
            &mut tx,
            PropTable::Message,
            message_id,
            PR_MESSAGE_FLAGS,
            &PropValue::Long(flags as i32),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Add a message to a search folder's result set.
    pub async fn link_message(&self, search_fid: u64, message_id: u64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !folder::is_search_folder(&mut conn, search_fid).await? {
            return Err(StoreError::NotSupported);
        }
        sqlx::query("REPLACE INTO search_result (folder_id, message_id) VALUES (?, ?)")
            .bind(search_fid as i64)
            .bind(message_id as i64)
            .execute(&mut *conn)
            .await?;
        self.notifier.post(StoreEvent::SearchFolderChanged {
            folder_id: search_fid,
            message_id,
            added: true,
        });
        Ok(())
    }

    pub async fn unlink_message(&self, search_fid: u64, message_id: u64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("DELETE FROM search_result WHERE folder_id = ? AND message_id = ?")
            .bind(search_fid as i64)
            .bind(message_id as i64)
            .execute(&mut *conn)
            .await?;
        self.notifier.post(StoreEvent::SearchFolderChanged {
            folder_id: search_fid,
            message_id,
            added: false,
        });
        Ok(())
    }

    pub async fn set_message_timer(&self, message_id: u64, timer_id: u32) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE messages SET timer_id = ? WHERE message_id = ?")
            .bind(timer_id as i64)
            .bind(message_id as i64)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_message_timer(&self, message_id: u64) -> Result<Option<u32>> {
        let mut conn = self.pool.acquire().await?;
        let v: Option<Option<i64>> =
            sqlx::query_scalar("SELECT timer_id FROM messages WHERE message_id = ?")
                .bind(message_id as i64)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(v.flatten().map(|t| t as u32))
    }

    /// Move or copy one message. Returns the destination mid.
    pub async fn movecopy_message(
        &self,
        username: &str,
        message_id: u64,
        dst_fid: u64,
        b_move: bool,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = message_row(&mut tx, message_id).await? else {
            return Err(StoreError::NotFound);
        };
        let src_fid = row.parent_fid.ok_or(StoreError::NotFound)?;
        self.check_movecopy_rights(&mut tx, username, src_fid, dst_fid, message_id, b_move)
            .await?;
        let outcome = copy_message_tx(self, &mut tx, message_id, dst_fid).await?;
        if b_move {
            self.remove_source_message(&mut tx, &row).await?;
        }
        properties::touch_folder_commit_time(self, &mut tx, dst_fid).await?;
        tx.commit().await?;
        self.touch();
        if b_move {
            self.notifier.post(StoreEvent::MessageMoved {
                old_fid: src_fid,
                old_mid: message_id,
                folder_id: dst_fid,
                message_id: outcome.message_id,
            });
        } else {
            self.notifier.post(StoreEvent::MessageCopied {
                src_fid,
                src_mid: message_id,
                folder_id: dst_fid,
                message_id: outcome.message_id,
            });
        }
        crate::table::notify_tables_folder_changed(self, src_fid).await;
        crate::table::notify_tables_folder_changed(self, dst_fid).await;
        Ok(outcome.message_id)
    }

    /// Batch move/copy. Failures on single messages set the partial flag
    /// instead of aborting the batch; batches at or above the configured
    /// threshold run in one transaction.
    pub async fn movecopy_messages(
        &self,
        username: &str,
        src_fid: u64,
        dst_fid: u64,
        message_ids: &[u64],
        b_copy: bool,
    ) -> Result<bool> {
        let mut partial = false;
        let batched = message_ids.len() >= self.config.batch_threshold;
        if batched {
            let mut tx = self.pool.begin().await?;
            for &mid in message_ids {
                match self
                    .movecopy_one_in_tx(&mut tx, username, src_fid, dst_fid, mid, !b_copy)
                    .await
                {
                    Ok(_) => {}
                    Err(StoreError::Sql(e)) => return Err(StoreError::Sql(e)),
                    Err(e) => {
                        debug!(mid, err = %e, "movecopy batch: skipping message");
                        partial = true;
                    }
                }
            }
            properties::touch_folder_commit_time(self, &mut tx, dst_fid).await?;
            tx.commit().await?;
        } else {
            for &mid in message_ids {
                match self.movecopy_message(username, mid, dst_fid, !b_copy).await {
                    Ok(_) => {}
                    Err(StoreError::Sql(e)) => return Err(StoreError::Sql(e)),
                    Err(e) => {
                        debug!(mid, err = %e, "movecopy: skipping message");
                        partial = true;
                    }
                }
            }
        }
        self.touch();
        Ok(partial)
    }

    async fn movecopy_one_in_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        username: &str,
        src_fid: u64,
        dst_fid: u64,
        message_id: u64,
        b_move: bool,
    ) -> Result<u64> {
        let Some(row) = message_row(&mut *tx, message_id).await? else {
            return Err(StoreError::NotFound);
        };
        if row.parent_fid != Some(src_fid) {
            return Err(StoreError::NotFound);
        }
        self.check_movecopy_rights(&mut *tx, username, src_fid, dst_fid, message_id, b_move)
            .await?;
        let outcome = copy_message_tx(self, tx, message_id, dst_fid).await?;
        if b_move {
            self.remove_source_message(&mut *tx, &row).await?;
        }
        Ok(outcome.message_id)
    }

    async fn check_movecopy_rights(
        &self,
        conn: &mut SqliteConnection,
        username: &str,
        src_fid: u64,
        dst_fid: u64,
        message_id: u64,
        b_move: bool,
    ) -> Result<()> {
        let dst_rights = folder::folder_rights(self, conn, dst_fid, username).await?;
        if dst_rights & (RIGHTS_CREATE | RIGHTS_OWNER) == 0 {
            return Err(StoreError::AccessDenied);
        }
        let src_rights = folder::folder_rights(self, conn, src_fid, username).await?;
        if src_rights & (RIGHTS_READ_ANY | RIGHTS_OWNER) == 0 {
            return Err(StoreError::AccessDenied);
        }
        if b_move && src_rights & (RIGHTS_DELETE_ANY | RIGHTS_OWNER) == 0 {
            let owned = self.message_owned_by(conn, message_id, username).await?;
            if !(owned && src_rights & RIGHTS_DELETE_OWNED != 0) {
                return Err(StoreError::AccessDenied);
            }
        }
        Ok(())
    }

    async fn message_owned_by(
        &self,
        conn: &mut SqliteConnection,
        message_id: u64,
        username: &str,
    ) -> Result<bool> {
        let sender = properties::get_property(
            self,
            conn,
            PropTable::Message,
            message_id,
            PR_SENDER_SMTP_ADDRESS,
        )
        .await?;
        Ok(sender
            .and_then(|v| v.as_str().map(|s| s.eq_ignore_ascii_case(username)))
            .unwrap_or(false))
    }

    async fn remove_source_message(
        &self,
        conn: &mut SqliteConnection,
        row: &MessageRow,
    ) -> Result<()> {
        let (nd, fd) = if row.is_associated {
            (0i64, -(row.message_size as i64))
        } else {
            (-(row.message_size as i64), 0i64)
        };
        if self.private {
            hard_delete_message(conn, row.message_id).await?;
        } else {
            sqlx::query("UPDATE messages SET is_deleted = 1 WHERE message_id = ?")
                .bind(row.message_id as i64)
                .execute(&mut *conn)
                .await?;
        }
        self.adjust_store_size(conn, nd, fd).await?;
        if let Some(fid) = row.parent_fid {
            if let Err(e) = crate::search::on_message_deleted(self, conn, fid, row.message_id).await
            {
                warn!(mid = row.message_id, err = %e, "dynamic search update failed");
            }
        }
        Ok(())
    }

    /// Delete messages from a folder. `hard` forces row removal even in a
    /// public store. Per-message permission failures set the partial flag.
    pub async fn delete_messages(
        &self,
        username: &str,
        folder_id: u64,
        message_ids: &[u64],
        hard: bool,
    ) -> Result<bool> {
        let mut partial = false;
        let mut tx = self.pool.begin().await?;
        let rights = folder::folder_rights(self, &mut tx, folder_id, username).await?;
        let mut deleted = Vec::new();
        for &mid in message_ids {
            let Some(row) = message_row(&mut tx, mid).await? else {
                partial = true;
                continue;
            };
            if row.parent_fid != Some(folder_id) {
                partial = true;
                continue;
            }
            if rights & (RIGHTS_DELETE_ANY | RIGHTS_OWNER) == 0 {
                let owned = self.message_owned_by(&mut tx, mid, username).await?;
                if !(owned && rights & RIGHTS_DELETE_OWNED != 0) {
                    partial = true;
                    continue;
                }
            }
            let (nd, fd) = if row.is_associated {
                (0i64, -(row.message_size as i64))
            } else {
                (-(row.message_size as i64), 0i64)
            };
            if self.private || hard {
                hard_delete_message(&mut tx, mid).await?;
            } else {
                let cn = self.allocate_cn(&mut tx).await?;
                sqlx::query(
                    "UPDATE messages SET is_deleted = 1, change_number = ? WHERE message_id = ?",
                )
                .bind(cn as i64)
                .bind(mid as i64)
                .execute(&mut *tx)
                .await?;
            }
            self.adjust_store_size(&mut tx, nd, fd).await?;
            if let Err(e) = crate::search::on_message_deleted(self, &mut tx, folder_id, mid).await {
                warn!(mid, err = %e, "dynamic search update failed");
            }
            deleted.push(mid);
        }
        if !deleted.is_empty() {
            properties::touch_folder_commit_time(self, &mut tx, folder_id).await?;
        }
        tx.commit().await?;
        self.touch();
        for mid in deleted {
            self.notifier.post(StoreEvent::MessageDeleted {
                folder_id,
                message_id: mid,
            });
        }
        crate::table::notify_tables_folder_changed(self, folder_id).await;
        Ok(partial)
    }

    /// Full-tree read with blobs resolved.
    pub async fn read_message(&self, message_id: u64) -> Result<Option<MessageContent>> {
        let mut conn = self.pool.acquire().await?;
        read_message_tx(self, &mut conn, message_id).await
    }

    /// Full-tree write into a folder (no rule pass; delivery owns that).
    pub async fn write_message(
        &self,
        folder_id: u64,
        content: &MessageContent,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        if !folder::folder_exists(&mut tx, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        self.check_quota(&mut tx, content.size()).await?;
        let outcome = write_message_tx(self, &mut tx, Some(folder_id), None, content).await?;
        tx.commit().await?;
        self.touch();
        self.notifier.post(StoreEvent::MessageCreated {
            folder_id,
            message_id: outcome.message_id,
        });
        crate::table::notify_tables_folder_changed(self, folder_id).await;
        Ok(outcome.message_id)
    }

    /// Client-write quota gate: store size + incoming > limit → over-quota.
    pub(crate) async fn check_quota(
        &self,
        conn: &mut SqliteConnection,
        incoming: u64,
    ) -> Result<()> {
        let limit_kb = properties::get_property(self, conn, PropTable::Store, 0, PR_STORAGE_QUOTA_LIMIT)
            .await?
            .and_then(|v| v.as_int());
        let Some(limit_kb) = limit_kb else {
            return Ok(());
        };
        let limit = (limit_kb as u64).saturating_mul(1024);
        let used = self.store_size(conn).await?;
        if used.saturating_add(incoming) > limit {
            return Err(StoreError::QuotaExceeded);
        }
        Ok(())
    }

    /// Delivery quota gate, keyed off the receive quota.
    pub(crate) async fn check_receive_quota(
        &self,
        conn: &mut SqliteConnection,
        incoming: u64,
    ) -> Result<bool> {
        let limit_kb = properties::get_property(
            self,
            conn,
            PropTable::Store,
            0,
            PR_PROHIBIT_RECEIVE_QUOTA,
        )
        .await?
        .and_then(|v| v.as_int());
        let Some(limit_kb) = limit_kb else {
            return Ok(true);
        };
        let limit = (limit_kb as u64).saturating_mul(1024);
        let used = self.store_size(conn).await?;
        Ok(used.saturating_add(incoming) <= limit)
    }
}
