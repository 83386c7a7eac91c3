// SPDX-License-Identifier: MIT
//! Folder tree: well-known folders, permissions, create/move/delete.

use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::props::*;

// Well-known private-store folder ids.
pub const PRIVATE_FID_ROOT: u64 = 1;
pub const PRIVATE_FID_DEFERRED_ACTION: u64 = 2;
pub const PRIVATE_FID_SPOOLER_QUEUE: u64 = 3;
pub const PRIVATE_FID_IPMSUBTREE: u64 = 5;
pub const PRIVATE_FID_INBOX: u64 = 6;
pub const PRIVATE_FID_OUTBOX: u64 = 7;
pub const PRIVATE_FID_SENT_ITEMS: u64 = 8;
pub const PRIVATE_FID_DELETED_ITEMS: u64 = 9;
pub const PRIVATE_FID_COMMON_VIEWS: u64 = 10;
pub const PRIVATE_FID_SCHEDULE: u64 = 11;
pub const PRIVATE_FID_FINDER: u64 = 12;
pub const PRIVATE_FID_VIEWS: u64 = 13;
pub const PRIVATE_FID_SHORTCUTS: u64 = 14;
pub const PRIVATE_FID_DRAFT: u64 = 16;
pub const PRIVATE_FID_CONTACTS: u64 = 17;
pub const PRIVATE_FID_CALENDAR: u64 = 18;
pub const PRIVATE_FID_JOURNAL: u64 = 19;
pub const PRIVATE_FID_NOTES: u64 = 20;
pub const PRIVATE_FID_TASKS: u64 = 21;
pub const PRIVATE_FID_JUNK: u64 = 23;
pub const PRIVATE_FID_CONFLICTS: u64 = 24;
pub const PRIVATE_FID_SYNC_ISSUES: u64 = 25;
pub const PRIVATE_FID_LOCAL_FAILURES: u64 = 26;
pub const PRIVATE_FID_SERVER_FAILURES: u64 = 27;
pub const PRIVATE_FID_CONVERSATION_ACTION_SETTINGS: u64 = 28;
pub const PRIVATE_FID_IMCONTACTLIST: u64 = 29;
pub const PRIVATE_FID_QUICKCONTACTS: u64 = 30;
pub const PRIVATE_FID_LOCAL_FREEBUSY: u64 = 31;

// Well-known public-store folder ids.
pub const PUBLIC_FID_ROOT: u64 = 1;
pub const PUBLIC_FID_IPMSUBTREE: u64 = 2;
pub const PUBLIC_FID_NONIPMSUBTREE: u64 = 3;
pub const PUBLIC_FID_EFORMSREGISTRY: u64 = 4;

/// Highest id reserved for well-known folders; dynamic allocation starts
/// above the provisioned range.
pub const CUSTOM_EID_BEGIN: u64 = 0x100;

pub struct DefaultFolder {
    pub folder_id: u64,
    pub parent_id: Option<u64>,
    pub name: &'static str,
    pub container_class: Option<&'static str>,
}

const fn df(
    folder_id: u64,
    parent_id: Option<u64>,
    name: &'static str,
    container_class: Option<&'static str>,
) -> DefaultFolder {
    DefaultFolder { folder_id, parent_id, name, container_class }
}

pub fn private_default_folders() -> &'static [DefaultFolder] {
    const FOLDERS: &[DefaultFolder] = &[
        df(PRIVATE_FID_ROOT, None, "Root Container", None),
        df(PRIVATE_FID_DEFERRED_ACTION, Some(PRIVATE_FID_ROOT), "Deferred Action", None),
        df(PRIVATE_FID_SPOOLER_QUEUE, Some(PRIVATE_FID_ROOT), "Spooler Queue", None),
        df(PRIVATE_FID_IPMSUBTREE, Some(PRIVATE_FID_ROOT), "Top of Information Store", None),
        df(PRIVATE_FID_INBOX, Some(PRIVATE_FID_IPMSUBTREE), "Inbox", Some("IPF.Note")),
        df(PRIVATE_FID_OUTBOX, Some(PRIVATE_FID_IPMSUBTREE), "Outbox", Some("IPF.Note")),
        df(PRIVATE_FID_SENT_ITEMS, Some(PRIVATE_FID_IPMSUBTREE), "Sent Items", Some("IPF.Note")),
        df(PRIVATE_FID_DELETED_ITEMS, Some(PRIVATE_FID_IPMSUBTREE), "Deleted Items", Some("IPF.Note")),
        df(PRIVATE_FID_COMMON_VIEWS, Some(PRIVATE_FID_ROOT), "Common Views", None),
        df(PRIVATE_FID_SCHEDULE, Some(PRIVATE_FID_ROOT), "Schedule", None),
        df(PRIVATE_FID_FINDER, Some(PRIVATE_FID_ROOT), "Finder", None),
        df(PRIVATE_FID_VIEWS, Some(PRIVATE_FID_ROOT), "Views", None),
        df(PRIVATE_FID_SHORTCUTS, Some(PRIVATE_FID_ROOT), "Shortcuts", None),
        df(PRIVATE_FID_DRAFT, Some(PRIVATE_FID_IPMSUBTREE), "Drafts", Some("IPF.Note")),
        df(PRIVATE_FID_CONTACTS, Some(PRIVATE_FID_IPMSUBTREE), "Contacts", Some("IPF.Contact")),
        df(PRIVATE_FID_CALENDAR, Some(PRIVATE_FID_IPMSUBTREE), "Calendar", Some("IPF.Appointment")),
        df(PRIVATE_FID_JOURNAL, Some(PRIVATE_FID_IPMSUBTREE), "Journal", Some("IPF.Journal")),
        df(PRIVATE_FID_NOTES, Some(PRIVATE_FID_IPMSUBTREE), "Notes", Some("IPF.StickyNote")),
        df(PRIVATE_FID_TASKS, Some(PRIVATE_FID_IPMSUBTREE), "Tasks", Some("IPF.Task")),
        df(PRIVATE_FID_JUNK, Some(PRIVATE_FID_IPMSUBTREE), "Junk E-mail", Some("IPF.Note")),
        df(PRIVATE_FID_CONFLICTS, Some(PRIVATE_FID_IPMSUBTREE), "Conflicts", Some("IPF.Note")),
        df(PRIVATE_FID_SYNC_ISSUES, Some(PRIVATE_FID_IPMSUBTREE), "Sync Issues", Some("IPF.Note")),
        df(PRIVATE_FID_LOCAL_FAILURES, Some(PRIVATE_FID_SYNC_ISSUES), "Local Failures", Some("IPF.Note")),
        df(PRIVATE_FID_SERVER_FAILURES, Some(PRIVATE_FID_SYNC_ISSUES), "Server Failures", Some("IPF.Note")),
        df(
            PRIVATE_FID_CONVERSATION_ACTION_SETTINGS,
            Some(PRIVATE_FID_IPMSUBTREE),
            "Conversation Action Settings",
            Some("IPF.Configuration"),
        ),
        df(PRIVATE_FID_IMCONTACTLIST, Some(PRIVATE_FID_CONTACTS), "IM Contact List", Some("IPF.Contact.MOC.ImContactList")),
        df(PRIVATE_FID_QUICKCONTACTS, Some(PRIVATE_FID_CONTACTS), "Quick Contacts", Some("IPF.Contact.MOC.QuickContacts")),
        df(PRIVATE_FID_LOCAL_FREEBUSY, Some(PRIVATE_FID_ROOT), "Freebusy Data", None),
    ];
    FOLDERS
}

pub fn public_default_folders() -> &'static [DefaultFolder] {
    const FOLDERS: &[DefaultFolder] = &[
        df(PUBLIC_FID_ROOT, None, "Root Container", None),
        df(PUBLIC_FID_IPMSUBTREE, Some(PUBLIC_FID_ROOT), "IPM_SUBTREE", None),
        df(PUBLIC_FID_NONIPMSUBTREE, Some(PUBLIC_FID_ROOT), "NON_IPM_SUBTREE", None),
        df(PUBLIC_FID_EFORMSREGISTRY, Some(PUBLIC_FID_NONIPMSUBTREE), "EFORMS REGISTRY", None),
    ];
    FOLDERS
}

/// Seed display name / class / timestamps for a provisioned folder.
pub async fn write_default_folder_props(
    conn: &mut SqliteConnection,
    spec: &DefaultFolder,
) -> Result<()> {
    let now = nttime_now();
    let rows: Vec<(u32, PropValue)> = {
        let mut v = vec![
            (PR_DISPLAY_NAME, PropValue::Unicode(spec.name.to_string())),
            (PR_CREATION_TIME, PropValue::SysTime(now)),
            (PR_LAST_MODIFICATION_TIME, PropValue::SysTime(now)),
            (PR_LOCAL_COMMIT_TIME_MAX, PropValue::SysTime(now)),
            (PR_HIERARCHY_CHANGE_NUM, PropValue::Long(0)),
            (PR_DELETED_COUNT_TOTAL, PropValue::Long(0)),
        ];
        if let Some(class) = spec.container_class {
            v.push((PR_CONTAINER_CLASS, PropValue::Unicode(class.to_string())));
        }
        v
    };
    for (tag, value) in rows {
        // Plain insert: provisioning runs before the handle exists, and no
        // cid-backed tags are involved.
        let cell_text = value.as_str().map(|s| s.to_string());
        let cell_int = value.as_int();
        let q = "REPLACE INTO folder_properties (folder_id, proptag, propval) VALUES (?, ?, ?)";
        if let Some(text) = cell_text {
            sqlx::query(q)
                .bind(spec.folder_id as i64)
                .bind(tag as i64)
                .bind(text)
                .execute(&mut *conn)
                .await?;
        } else if let Some(n) = cell_int {
            sqlx::query(q)
                .bind(spec.folder_id as i64)
                .bind(tag as i64)
                .bind(n)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

// ─── Row lookups ─────────────────────────────────────────────────────────────

pub async fn folder_exists(conn: &mut SqliteConnection, folder_id: u64) -> Result<bool> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE folder_id = ?")
        .bind(folder_id as i64)
        .fetch_one(conn)
        .await?;
    Ok(n > 0)
}

pub async fn folder_parent(conn: &mut SqliteConnection, folder_id: u64) -> Result<Option<u64>> {
    let row = sqlx::query("SELECT parent_id FROM folders WHERE folder_id = ?")
        .bind(folder_id as i64)
        .fetch_optional(conn)
        .await?;
    Ok(row.and_then(|r| r.get::<Option<i64>, _>(0)).map(|p| p as u64))
}

pub async fn is_search_folder(conn: &mut SqliteConnection, folder_id: u64) -> Result<bool> {
    let v: Option<i64> = sqlx::query_scalar("SELECT is_search FROM folders WHERE folder_id = ?")
        .bind(folder_id as i64)
        .fetch_optional(conn)
        .await?;
    Ok(v.unwrap_or(0) != 0)
}

/// Walk up from `folder_id`; true if `ancestor` is on the parent chain.
pub async fn is_descendant(
    conn: &mut SqliteConnection,
    folder_id: u64,
    ancestor: u64,
) -> Result<bool> {
    let mut cur = folder_id;
    loop {
        if cur == ancestor {
            return Ok(true);
        }
        match folder_parent(conn, cur).await? {
            Some(p) if p != cur => cur = p,
            _ => return Ok(false),
        }
    }
}

// ─── Permissions ─────────────────────────────────────────────────────────────

/// Effective rights of `username` on a folder. The store owner holds every
/// right implicitly; other users resolve through the permission rows with
/// the "default" member (empty username) as fallback.
pub async fn folder_rights(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    folder_id: u64,
    username: &str,
) -> Result<u32> {
    if handle.private && username.eq_ignore_ascii_case(&handle.username) {
        return Ok(u32::MAX);
    }
    let exact: Option<i64> = sqlx::query_scalar(
        "SELECT permission FROM permissions WHERE folder_id = ? AND username = ? COLLATE NOCASE",
    )
    .bind(folder_id as i64)
    .bind(username)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(bits) = exact {
        return Ok(bits as u32);
    }
    let fallback: Option<i64> = sqlx::query_scalar(
        "SELECT permission FROM permissions WHERE folder_id = ? AND username = ''",
    )
    .bind(folder_id as i64)
    .fetch_optional(conn)
    .await?;
    Ok(fallback.unwrap_or(0) as u32)
}

pub async fn set_folder_rights(
    conn: &mut SqliteConnection,
    folder_id: u64,
    username: &str,
    permission: u32,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE permissions SET permission = ? WHERE folder_id = ? AND username = ? COLLATE NOCASE",
    )
    .bind(permission as i64)
    .bind(folder_id as i64)
    .bind(username)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        sqlx::query("INSERT INTO permissions (folder_id, username, permission) VALUES (?, ?, ?)")
            .bind(folder_id as i64)
            .bind(username)
            .bind(permission as i64)
            .execute(conn)
            .await?;
    }
    Ok(())
}

// ─── Mutations ───────────────────────────────────────────────────────────────

impl DbHandle {
    /// Create a generic folder under `parent_id`. Returns the new folder id.
    pub async fn create_folder(
        &self,
        parent_id: u64,
        name: &str,
        container_class: Option<&str>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        if !folder_exists(&mut tx, parent_id).await? {
            return Err(StoreError::NotFound);
        }
        let dup: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM folders f JOIN folder_properties p \
             ON p.folder_id = f.folder_id AND p.proptag = ? \
             WHERE f.parent_id = ? AND f.is_deleted = 0 AND p.propval = ? COLLATE NOCASE",
        )
        .bind(PR_DISPLAY_NAME as i64)
        .bind(parent_id as i64)
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;
        if dup > 0 {
            return Err(StoreError::DuplicateName);
        }
        let fid = self
            .create_folder_in_tx(&mut tx, None, parent_id, name, container_class)
            .await?;
        tx.commit().await?;
        self.touch();
        self.notifier.post(crate::notify::StoreEvent::FolderCreated {
            parent_id,
            folder_id: fid,
        });
        Ok(fid)
    }

    /// Insert a folder row. `fixed_id` binds a caller-supplied id (ICS
    /// upload); otherwise a fresh one is allocated.
    pub(crate) async fn create_folder_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        fixed_id: Option<u64>,
        parent_id: u64,
        name: &str,
        container_class: Option<&str>,
    ) -> Result<u64> {
        let fid = match fixed_id {
            Some(fid) => {
                if folder_exists(&mut *tx, fid).await? {
                    return Err(StoreError::DuplicateName);
                }
                fid
            }
            None => self.allocate_eid(&mut *tx).await?,
        };
        let cn = self.allocate_cn(&mut *tx).await?;
        let last_eid = self.config_get_i64(&mut *tx, crate::db::CFG_LAST_EID).await? as u64;
        let max_eid = last_eid + self.config.folder_eid_range;
        self.config_set_i64(&mut *tx, crate::db::CFG_LAST_EID, max_eid as i64).await?;
        sqlx::query(
            "INSERT INTO folders (folder_id, parent_id, change_number, is_search, cur_eid, max_eid) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(fid as i64)
        .bind(parent_id as i64)
        .bind(cn as i64)
        .bind(last_eid as i64)
        .bind(max_eid as i64)
        .execute(&mut **tx)
        .await?;
        let now = nttime_now();
        let mut bag = PropvalBag::new();
        bag.set(PR_DISPLAY_NAME, PropValue::Unicode(name.to_string()));
        bag.set(PR_CREATION_TIME, PropValue::SysTime(now));
        if let Some(class) = container_class {
            bag.set(PR_CONTAINER_CLASS, PropValue::Unicode(class.to_string()));
        }
        properties::set_properties(self, &mut *tx, PropTable::Folder, fid, &bag).await?;
        properties::stamp_change(self, &mut *tx, PropTable::Folder, fid, cn).await?;
        bump_hierarchy_change_number(self, &mut *tx, parent_id).await?;
        debug!(fid, parent_id, name, "created folder");
        Ok(fid)
    }

    /// Reparent a folder, optionally renaming. Public stores refuse moves.
    pub async fn movecopy_folder(
        &self,
        username: &str,
        folder_id: u64,
        dst_parent: u64,
        new_name: Option<&str>,
    ) -> Result<()> {
        if !self.private {
            return Err(StoreError::NotSupported);
        }
        if folder_id < CUSTOM_EID_BEGIN {
            // Well-known folders never move.
            return Err(StoreError::AccessDenied);
        }
        let mut tx = self.pool.begin().await?;
        let rights = folder_rights(self, &mut tx, folder_id, username).await?;
        if rights & RIGHTS_OWNER == 0 {
            return Err(StoreError::AccessDenied);
        }
        if !folder_exists(&mut tx, dst_parent).await? {
            return Err(StoreError::NotFound);
        }
        if is_descendant(&mut tx, dst_parent, folder_id).await? {
            return Err(StoreError::InvalidParam("cannot move folder under itself"));
        }
        let old_parent = folder_parent(&mut tx, folder_id).await?.unwrap_or(0);
        sqlx::query("UPDATE folders SET parent_id = ? WHERE folder_id = ?")
            .bind(dst_parent as i64)
            .bind(folder_id as i64)
            .execute(&mut *tx)
            .await?;
        if let Some(name) = new_name {
            properties::set_property(
                self,
                &mut tx,
                PropTable::Folder,
                folder_id,
                PR_DISPLAY_NAME,
                &PropValue::Unicode(name.to_string()),
            )
            .await?;
        }
        let cn = self.allocate_cn(&mut tx).await?;
        properties::stamp_change(self, &mut tx, PropTable::Folder, folder_id, cn).await?;
        bump_hierarchy_change_number(self, &mut tx, old_parent).await?;
        bump_hierarchy_change_number(self, &mut tx, dst_parent).await?;
        tx.commit().await?;
        self.touch();
        self.notifier.post(crate::notify::StoreEvent::FolderMoved {
            old_pid: old_parent,
            parent_id: dst_parent,
            folder_id,
        });
        Ok(())
    }

    /// Delete a folder subtree. Private stores hard-delete rows; public
    /// stores set the deletion mark that ICS turns into tombstones.
    pub async fn delete_folder(&self, username: &str, folder_id: u64) -> Result<()> {
        if folder_id < CUSTOM_EID_BEGIN {
            return Err(StoreError::AccessDenied);
        }
        let mut tx = self.pool.begin().await?;
        let rights = folder_rights(self, &mut tx, folder_id, username).await?;
        if rights & RIGHTS_OWNER == 0 {
            return Err(StoreError::AccessDenied);
        }
        let parent = folder_parent(&mut tx, folder_id).await?.unwrap_or(0);
        let mut stack = vec![folder_id];
        let mut subtree = Vec::new();
        while let Some(fid) = stack.pop() {
            subtree.push(fid);
            let children: Vec<i64> =
                sqlx::query_scalar("SELECT folder_id FROM folders WHERE parent_id = ?")
                    .bind(fid as i64)
                    .fetch_all(&mut *tx)
                    .await?;
            stack.extend(children.into_iter().map(|c| c as u64));
        }
        for fid in &subtree {
            let sizes = sqlx::query(
                "SELECT COALESCE(SUM(CASE WHEN is_associated = 0 THEN message_size END), 0), \
                 COALESCE(SUM(CASE WHEN is_associated = 1 THEN message_size END), 0) \
                 FROM messages WHERE parent_fid = ? AND is_deleted = 0",
            )
            .bind(*fid as i64)
            .fetch_one(&mut *tx)
            .await?;
            self.adjust_store_size(
                &mut tx,
                -sizes.get::<i64, _>(0),
                -sizes.get::<i64, _>(1),
            )
            .await?;
            if self.private {
                sqlx::query("DELETE FROM messages WHERE parent_fid = ?")
                    .bind(*fid as i64)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM folders WHERE folder_id = ?")
                    .bind(*fid as i64)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM folder_properties WHERE folder_id = ?")
                    .bind(*fid as i64)
                    .execute(&mut *tx)
                    .await?;
            } else {
                let cn = self.allocate_cn(&mut tx).await?;
                sqlx::query("UPDATE folders SET is_deleted = 1, change_number = ? WHERE folder_id = ?")
                    .bind(cn as i64)
                    .bind(*fid as i64)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE messages SET is_deleted = 1 WHERE parent_fid = ?")
                    .bind(*fid as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        bump_hierarchy_change_number(self, &mut tx, parent).await?;
        tx.commit().await?;
        self.touch();
        self.notifier.post(crate::notify::StoreEvent::FolderDeleted {
            parent_id: parent,
            folder_id,
        });
        Ok(())
    }

    /// Turn a freshly created generic folder into a search folder. Only
    /// legal while it has no stored children.
    pub async fn mark_folder_as_search(&self, folder_id: u64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !folder_exists(&mut conn, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        let children: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM folders WHERE parent_id = ?",
        )
        .bind(folder_id as i64)
        .fetch_one(&mut *conn)
        .await?;
        let messages: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE parent_fid = ?")
                .bind(folder_id as i64)
                .fetch_one(&mut *conn)
                .await?;
        if children > 0 || messages > 0 {
            return Err(StoreError::NotSupported);
        }
        sqlx::query("UPDATE folders SET is_search = 1 WHERE folder_id = ?")
            .bind(folder_id as i64)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_folder_properties(
        &self,
        folder_id: u64,
        proptags: &[u32],
    ) -> Result<PropvalBag> {
        let mut conn = self.pool.acquire().await?;
        if !folder_exists(&mut conn, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        properties::get_properties(self, &mut conn, PropTable::Folder, folder_id, proptags).await
    }

    pub async fn set_folder_properties(&self, folder_id: u64, bag: &PropvalBag) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !folder_exists(&mut tx, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        properties::set_properties(self, &mut tx, PropTable::Folder, folder_id, bag).await?;
        let cn = self.allocate_cn(&mut tx).await?;
        properties::stamp_change(self, &mut tx, PropTable::Folder, folder_id, cn).await?;
        tx.commit().await?;
        self.touch();
        self.notifier
            .post(crate::notify::StoreEvent::FolderModified { folder_id });
        Ok(())
    }
}

pub(crate) async fn bump_hierarchy_change_number(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    folder_id: u64,
) -> Result<()> {
    if folder_id == 0 {
        return Ok(());
    }
    let cur = properties::get_property(
        handle,
        conn,
        PropTable::Folder,
        folder_id,
        PR_HIERARCHY_CHANGE_NUM,
    )
    .await?
    .and_then(|v| v.as_int())
    .unwrap_or(0);
    properties::set_property(
        handle,
        conn,
        PropTable::Folder,
        folder_id,
        PR_HIERARCHY_CHANGE_NUM,
        &PropValue::Long((cur + 1) as i32),
    )
    .await
}
