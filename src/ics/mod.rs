// SPDX-License-Identifier: MIT
//! Incremental change synchronization: delta downloads driven entirely by
//! change numbers against caller-supplied ID-set watermarks.

pub mod upload;

use std::collections::HashSet;

use sqlx::{Connection, Row, SqliteConnection};

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::folder;
use crate::ids::{make_local_eid, REPLID_LOCAL};
use crate::message;
use crate::props::idset::IdSet;
use crate::props::restriction::Restriction;
use crate::props::*;

// Sync flag bits.
pub const SYNC_FLAG_NORMAL: u32 = 0x1;
pub const SYNC_FLAG_FAI: u32 = 0x2;
pub const SYNC_FLAG_READSTATE: u32 = 0x4;
pub const SYNC_FLAG_NODELETIONS: u32 = 0x10;
pub const SYNC_FLAG_IGNORENOLONGERINSCOPE: u32 = 0x20;
pub const SYNC_FLAG_PROGRESS: u32 = 0x100;
pub const SYNC_FLAG_ONLYSPECIFIEDPROPERTIES: u32 = 0x200;
pub const SYNC_FLAG_NOFOREIGNIDENTIFIERS: u32 = 0x400;

/// Extra-flags bit: order changes by delivery time.
pub const SYNC_EXTRA_ORDER_BY_DELIVERY_TIME: u32 = 0x1;

#[derive(Debug, Default)]
pub struct ContentSyncResult {
    pub fai_count: u32,
    pub fai_total: u64,
    pub normal_count: u32,
    pub normal_total: u64,
    /// Messages in scope with changes past the watermark, EID form.
    pub chg_messages: Vec<u64>,
    /// Subset of `chg_messages` the client already holds.
    pub updated_messages: Vec<u64>,
    /// Complete in-scope set after this sync — the client's next `given`.
    pub given_messages: Vec<u64>,
    pub deleted_messages: Vec<u64>,
    pub nolonger_messages: Vec<u64>,
    pub read_messages: Vec<u64>,
    pub unread_messages: Vec<u64>,
    /// New seen watermark (EID form), 0 when nothing was seen.
    pub last_cn: u64,
    pub last_readcn: u64,
}

#[derive(Debug, Default)]
pub struct HierarchySyncResult {
    /// One property bag per changed folder, parent-before-child order.
    pub folder_changes: Vec<PropvalBag>,
    pub last_cn: u64,
    pub given_folders: Vec<u64>,
    pub deleted_folders: Vec<u64>,
}

struct CandidateRow {
    mid: u64,
    change_number: u64,
    is_fai: bool,
    size: u64,
    read_state: bool,
    read_cn: u64,
    delivery_time: u64,
    mod_time: u64,
}

impl DbHandle {
    /// Content synchronization over one folder. `username` carries the
    /// per-user read state for public stores.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_content_sync(
        &self,
        folder_id: u64,
        username: Option<&str>,
        given: &IdSet,
        seen: &IdSet,
        seen_fai: &IdSet,
        read: &IdSet,
        sync_flags: u32,
        extra_flags: u32,
        restriction: Option<&Restriction>,
    ) -> Result<ContentSyncResult> {
        let want_normal = sync_flags & SYNC_FLAG_NORMAL != 0;
        let want_fai = sync_flags & SYNC_FLAG_FAI != 0;
        let want_read = sync_flags & SYNC_FLAG_READSTATE != 0;
        let ordered = extra_flags & SYNC_EXTRA_ORDER_BY_DELIVERY_TIME != 0;
        let mut result = ContentSyncResult::default();
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let sql = if self.private {
            "SELECT message_id, change_number, is_associated, message_size, read_state, read_cn \
             FROM messages WHERE parent_fid = ?"
        } else {
            "SELECT message_id, change_number, is_associated, message_size, 0, NULL \
             FROM messages WHERE parent_fid = ? AND is_deleted = 0"
        };
        let rows = sqlx::query(sql)
            .bind(folder_id as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut existence: HashSet<u64> = HashSet::new();
        let mut changes: Vec<CandidateRow> = Vec::new();
        let mut reads: Vec<(u64, bool)> = Vec::new();
        let mut last_cn = 0u64;
        let mut last_readcn = 0u64;

        for row in rows {
            let mid = row.get::<i64, _>(0) as u64;
            let change_number = row.get::<i64, _>(1) as u64;
            let is_fai = row.get::<i64, _>(2) != 0;
            let size = row.get::<i64, _>(3) as u64;
            if is_fai && !want_fai {
                continue;
            }
            if !is_fai && !want_normal {
                continue;
            }
            if let Some(res) = restriction {
                if !message::eval_message_restriction(self, &mut tx, mid, res).await? {
                    continue;
                }
            }
            existence.insert(mid);
            if change_number > last_cn {
                last_cn = change_number;
            }
            let (read_state, read_cn) = if self.private {
                (
                    row.get::<i64, _>(4) != 0,
                    row.get::<Option<i64>, _>(5).unwrap_or(0) as u64,
                )
            } else {
                let user = username.unwrap_or("");
                let cn: Option<i64> = sqlx::query_scalar(
                    "SELECT read_cn FROM read_cns WHERE message_id = ? AND username = ?",
                )
                .bind(mid as i64)
                .bind(user)
                .fetch_optional(&mut *tx)
                .await?;
                let state: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM read_states WHERE message_id = ? AND username = ?",
                )
                .bind(mid as i64)
                .bind(user)
                .fetch_one(&mut *tx)
                .await?;
                (state > 0, cn.unwrap_or(0) as u64)
            };
            if read_cn > last_readcn {
                last_readcn = read_cn;
            }
            let in_given = given.hint(REPLID_LOCAL, mid);
            if is_fai {
                if in_given && seen_fai.hint(REPLID_LOCAL, change_number) {
                    continue;
                }
            } else if in_given && seen.hint(REPLID_LOCAL, change_number) {
                // Unchanged; it may still carry a read-state transition.
                if want_read && read_cn != 0 && !read.hint(REPLID_LOCAL, read_cn) {
                    reads.push((mid, read_state));
                }
                continue;
            }
            let (delivery_time, mod_time) = if ordered {
                let dt = properties::get_property(
                    self,
                    &mut tx,
                    PropTable::Message,
                    mid,
                    PR_MESSAGE_DELIVERY_TIME,
                )
                .await?
                .and_then(|v| v.as_int())
                .unwrap_or(0) as u64;
                let mt = properties::get_property(
                    self,
                    &mut tx,
                    PropTable::Message,
                    mid,
                    PR_LAST_MODIFICATION_TIME,
                )
                .await?
                .and_then(|v| v.as_int())
                .unwrap_or(0) as u64;
                (dt, mt)
            } else {
                (0, 0)
            };
            if is_fai {
                result.fai_count += 1;
                result.fai_total += size;
            } else {
                result.normal_count += 1;
                result.normal_total += size;
            }
            changes.push(CandidateRow {
                mid,
                change_number,
                is_fai,
                size,
                read_state,
                read_cn,
                delivery_time,
                mod_time,
            });
        }
        tx.commit().await?;

        if ordered {
            changes.sort_by(|a, b| {
                b.delivery_time
                    .cmp(&a.delivery_time)
                    .then(b.mod_time.cmp(&a.mod_time))
            });
        }
        for c in &changes {
            result.chg_messages.push(make_local_eid(c.mid));
            if given.hint(REPLID_LOCAL, c.mid) {
                result.updated_messages.push(make_local_eid(c.mid));
            }
        }

        // Deletions: ids the client holds that fell out of existence. Still
        // present in the store means out-of-scope rather than deleted.
        if sync_flags & SYNC_FLAG_NODELETIONS == 0 {
            let mut held: Vec<u64> = Vec::new();
            given.enumerate_repl(REPLID_LOCAL, |mid| held.push(mid));
            for mid in held {
                if existence.contains(&mid) {
                    continue;
                }
                let still_there: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE message_id = ?")
                        .bind(mid as i64)
                        .fetch_one(&mut *conn)
                        .await?;
                if still_there > 0 {
                    if sync_flags & SYNC_FLAG_IGNORENOLONGERINSCOPE == 0 {
                        result.nolonger_messages.push(make_local_eid(mid));
                    }
                } else {
                    result.deleted_messages.push(make_local_eid(mid));
                }
            }
        }

        let mut given_out: Vec<u64> = existence.iter().copied().collect();
        given_out.sort_unstable_by(|a, b| b.cmp(a));
        result.given_messages = given_out.into_iter().map(make_local_eid).collect();

        if want_read {
            for (mid, read_state) in reads {
                if read_state {
                    result.read_messages.push(make_local_eid(mid));
                } else {
                    result.unread_messages.push(make_local_eid(mid));
                }
            }
        }
        if last_cn != 0 {
            result.last_cn = make_local_eid(last_cn);
        }
        if last_readcn != 0 {
            result.last_readcn = make_local_eid(last_readcn);
        }
        self.touch();
        Ok(result)
    }

    /// Hierarchy synchronization over the subtree rooted at `folder_id`.
    pub async fn get_hierarchy_sync(
        &self,
        folder_id: u64,
        username: Option<&str>,
        given: &IdSet,
        seen: &IdSet,
    ) -> Result<HierarchySyncResult> {
        let mut result = HierarchySyncResult::default();
        let mut conn = self.pool.acquire().await?;
        let mut existence: HashSet<u64> = HashSet::new();
        let mut changed: Vec<u64> = Vec::new();
        let mut last_cn = 0u64;
        self.load_folder_changes(
            &mut conn,
            folder_id,
            username,
            given,
            seen,
            &mut existence,
            &mut changed,
            &mut last_cn,
        )
        .await?;
        if last_cn != 0 {
            result.last_cn = make_local_eid(last_cn);
        }
        for fid in &changed {
            let mut tags = properties::all_proptags(&mut conn, PropTable::Folder, *fid).await?;
            tags.0.retain(|t| {
                !matches!(
                    *t,
                    PR_HAS_RULES
                        | PR_CHANGE_NUMBER
                        | PR_LOCAL_COMMIT_TIME
                        | PR_LOCAL_COMMIT_TIME_MAX
                        | PR_DELETED_COUNT_TOTAL
                        | PR_NORMAL_MESSAGE_SIZE
                        | PR_HIERARCHY_CHANGE_NUM
                        | PR_FOLDER_PATHNAME
                )
            });
            tags.append_unique(PR_PARENT_FOLDER_ID);
            tags.append_unique(PR_SOURCE_KEY);
            let mut bag =
                properties::get_properties(self, &mut conn, PropTable::Folder, *fid, &tags.0)
                    .await?;
            bag.set(PR_FOLDER_ID, PropValue::I8(make_local_eid(*fid) as i64));
            // Canonical entry id for consumers that address well-known
            // folders without a table lookup.
            bag.set(
                PR_ENTRYID,
                PropValue::Binary(crate::ids::eid_to_wire(make_local_eid(*fid)).to_vec()),
            );
            result.folder_changes.push(bag);
        }
        let mut given_out: Vec<u64> = existence.iter().copied().collect();
        given_out.sort_unstable_by(|a, b| b.cmp(a));
        result.given_folders = given_out.into_iter().map(make_local_eid).collect();
        for replid in given.replids() {
            given.enumerate_repl(replid, |gc| {
                if replid != REPLID_LOCAL || !existence.contains(&gc) {
                    result.deleted_folders.push(make_eid_for(replid, gc));
                }
            });
        }
        self.touch();
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn load_folder_changes<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        folder_id: u64,
        username: Option<&'a str>,
        given: &'a IdSet,
        seen: &'a IdSet,
        existence: &'a mut HashSet<u64>,
        changed: &'a mut Vec<u64>,
        last_cn: &'a mut u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let sql = if self.private {
                "SELECT folder_id, change_number FROM folders WHERE parent_id = ?"
            } else {
                "SELECT folder_id, change_number FROM folders WHERE parent_id = ? AND is_deleted = 0"
            };
            let rows = sqlx::query(sql)
                .bind(folder_id as i64)
                .fetch_all(&mut *conn)
                .await?;
            let mut children = Vec::new();
            for row in rows {
                let fid = row.get::<i64, _>(0) as u64;
                let cn = row.get::<i64, _>(1) as u64;
                if let Some(user) = username {
                    let rights = folder::folder_rights(self, conn, fid, user).await?;
                    if rights & (RIGHTS_READ_ANY | RIGHTS_VISIBLE | RIGHTS_OWNER) == 0 {
                        continue;
                    }
                }
                children.push(fid);
                existence.insert(fid);
                if cn > *last_cn {
                    *last_cn = cn;
                }
                // cn 0 marks a provisioned folder that never changed.
                if given.hint(REPLID_LOCAL, fid) && (cn == 0 || seen.hint(REPLID_LOCAL, cn)) {
                    continue;
                }
                changed.push(fid);
            }
            for child in children {
                self.load_folder_changes(
                    conn, child, username, given, seen, existence, changed, last_cn,
                )
                .await?;
            }
            Ok(())
        })
    }

    // ── ICS state streams ────────────────────────────────────────────────────

    /// Start assembling a serialized ID set for a state slot.
    pub async fn begin_state_stream(&self, proptag: u32) -> Result<()> {
        if !matches!(
            proptag,
            META_TAG_IDSET_GIVEN
                | META_TAG_IDSET_GIVEN1
                | META_TAG_CNSET_SEEN
                | META_TAG_CNSET_SEEN_FAI
                | META_TAG_CNSET_READ
        ) {
            return Err(StoreError::InvalidParam("unknown state stream slot"));
        }
        self.ics_stream_bufs.lock().await.insert(proptag, Vec::new());
        Ok(())
    }

    pub async fn continue_state_stream(&self, proptag: u32, chunk: &[u8]) -> Result<()> {
        let mut bufs = self.ics_stream_bufs.lock().await;
        let buf = bufs.get_mut(&proptag).ok_or(StoreError::NullObject)?;
        buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Finish the stream: deserialize and register the set under its slot.
    pub async fn end_state_stream(&self, proptag: u32) -> Result<()> {
        let buf = self
            .ics_stream_bufs
            .lock()
            .await
            .remove(&proptag)
            .ok_or(StoreError::NullObject)?;
        let set = IdSet::deserialize(&buf)?;
        self.ics_states.lock().await.insert(proptag, set);
        Ok(())
    }

    /// Fetch (cloning) a registered state slot; empty set when absent.
    pub async fn get_state_slot(&self, proptag: u32) -> IdSet {
        self.ics_states
            .lock()
            .await
            .get(&proptag)
            .cloned()
            .unwrap_or_default()
    }
}

fn make_eid_for(replid: u16, gc: u64) -> u64 {
    crate::ids::make_eid(replid, gc)
}
