// SPDX-License-Identifier: MIT
//! Dynamic search folders.
//!
//! A search folder stores its criteria (restriction + scope folder list) and
//! materializes membership into `search_result`. The hooks below fire on
//! every message insert/modify/delete; a failing hook logs and continues so
//! mail delivery is never blocked by a broken search folder.

use sqlx::{Row, SqliteConnection};
use tracing::warn;

use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::message;
use crate::notify::StoreEvent;
use crate::props::restriction::Restriction;

pub const SEARCH_FLAG_RECURSIVE: u32 = 0x4;

/// Install search criteria on a folder and (re)build its result set.
pub async fn set_search_criteria(
    handle: &DbHandle,
    folder_id: u64,
    criteria: &Restriction,
    scope: &[u64],
    flags: u32,
) -> Result<()> {
    let mut tx = handle.pool.begin().await?;
    let is_search: Option<i64> =
        sqlx::query_scalar("SELECT is_search FROM folders WHERE folder_id = ?")
            .bind(folder_id as i64)
            .fetch_optional(&mut *tx)
            .await?;
    match is_search {
        None => return Err(StoreError::NotFound),
        Some(0) => return Err(StoreError::NotSupported),
        _ => {}
    }
    let text = serde_json::to_string(criteria)
        .map_err(|_| StoreError::InvalidParam("unserializable search criteria"))?;
    sqlx::query("UPDATE folders SET search_criteria = ?, search_flags = ? WHERE folder_id = ?")
        .bind(text)
        .bind(flags as i64)
        .bind(folder_id as i64)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM search_scopes WHERE folder_id = ?")
        .bind(folder_id as i64)
        .execute(&mut *tx)
        .await?;
    for fid in scope {
        sqlx::query("REPLACE INTO search_scopes (folder_id, included_fid) VALUES (?, ?)")
            .bind(folder_id as i64)
            .bind(*fid as i64)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM search_result WHERE folder_id = ?")
        .bind(folder_id as i64)
        .execute(&mut *tx)
        .await?;
    // Initial population over the scope.
    let mut scope_fids: Vec<u64> = scope.to_vec();
    if flags & SEARCH_FLAG_RECURSIVE != 0 {
        let mut i = 0;
        while i < scope_fids.len() {
            let children: Vec<i64> =
                sqlx::query_scalar("SELECT folder_id FROM folders WHERE parent_id = ?")
                    .bind(scope_fids[i] as i64)
                    .fetch_all(&mut *tx)
                    .await?;
            scope_fids.extend(children.into_iter().map(|c| c as u64));
            i += 1;
        }
    }
    for fid in &scope_fids {
        let mids: Vec<i64> = sqlx::query_scalar(
            "SELECT message_id FROM messages WHERE parent_fid = ? AND is_deleted = 0 \
             AND is_associated = 0",
        )
        .bind(*fid as i64)
        .fetch_all(&mut *tx)
        .await?;
        for mid in mids {
            if message::eval_message_restriction(handle, &mut tx, mid as u64, criteria).await? {
                sqlx::query("REPLACE INTO search_result (folder_id, message_id) VALUES (?, ?)")
                    .bind(folder_id as i64)
                    .bind(mid)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }
    tx.commit().await?;
    handle
        .notifier
        .post(StoreEvent::SearchComplete { folder_id });
    Ok(())
}

impl DbHandle {
    /// Current size of a search folder's result set.
    pub async fn sum_search_result(&self, folder_id: u64) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_result WHERE folder_id = ?")
            .bind(folder_id as i64)
            .fetch_one(&mut *conn)
            .await?;
        Ok(n as u32)
    }

    /// Run the content-id sweeper: delete blob files no property row
    /// references. Returns the number of files reclaimed.
    pub async fn sweep_blobs(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        crate::blob::sweep_unreferenced(&self.dir, &mut conn).await
    }
}

struct WatchingFolder {
    folder_id: u64,
    criteria: Restriction,
}

/// Search folders whose scope covers `parent_fid`.
async fn watchers(
    conn: &mut SqliteConnection,
    parent_fid: u64,
) -> Result<Vec<WatchingFolder>> {
    let rows = sqlx::query(
        "SELECT f.folder_id, f.search_criteria, f.search_flags FROM folders f \
         WHERE f.is_search = 1 AND f.search_criteria IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;
    let mut out = Vec::new();
    for row in rows {
        let fid = row.get::<i64, _>(0) as u64;
        let Some(criteria) = row
            .get::<Option<String>, _>(1)
            .and_then(|t| serde_json::from_str::<Restriction>(&t).ok())
        else {
            continue;
        };
        let recursive = row.get::<i64, _>(2) as u32 & SEARCH_FLAG_RECURSIVE != 0;
        let scope: Vec<i64> =
            sqlx::query_scalar("SELECT included_fid FROM search_scopes WHERE folder_id = ?")
                .bind(fid as i64)
                .fetch_all(&mut *conn)
                .await?;
        let mut in_scope = scope.iter().any(|s| *s as u64 == parent_fid);
        if !in_scope && recursive {
            for s in &scope {
                if crate::folder::is_descendant(&mut *conn, parent_fid, *s as u64).await? {
                    in_scope = true;
                    break;
                }
            }
        }
        if in_scope {
            out.push(WatchingFolder { folder_id: fid, criteria });
        }
    }
    Ok(out)
}

/// Hook: a message in `parent_fid` was inserted or modified.
pub(crate) async fn on_message_changed(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    parent_fid: u64,
    message_id: u64,
) -> Result<()> {
    for watcher in watchers(conn, parent_fid).await? {
        let matched =
            match message::eval_message_restriction(handle, conn, message_id, &watcher.criteria)
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(fid = watcher.folder_id, err = %e, "search criteria evaluation failed");
                    continue;
                }
            };
        let was_member: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM search_result WHERE folder_id = ? AND message_id = ?",
        )
        .bind(watcher.folder_id as i64)
        .bind(message_id as i64)
        .fetch_one(&mut *conn)
        .await?;
        if matched && was_member == 0 {
            sqlx::query("INSERT INTO search_result (folder_id, message_id) VALUES (?, ?)")
                .bind(watcher.folder_id as i64)
                .bind(message_id as i64)
                .execute(&mut *conn)
                .await?;
            handle.notifier.post(StoreEvent::SearchFolderChanged {
                folder_id: watcher.folder_id,
                message_id,
                added: true,
            });
        } else if !matched && was_member > 0 {
            sqlx::query("DELETE FROM search_result WHERE folder_id = ? AND message_id = ?")
                .bind(watcher.folder_id as i64)
                .bind(message_id as i64)
                .execute(&mut *conn)
                .await?;
            handle.notifier.post(StoreEvent::SearchFolderChanged {
                folder_id: watcher.folder_id,
                message_id,
                added: false,
            });
        }
    }
    Ok(())
}

/// Hook: a message was removed from `parent_fid`.
pub(crate) async fn on_message_deleted(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    parent_fid: u64,
    message_id: u64,
) -> Result<()> {
    for watcher in watchers(conn, parent_fid).await? {
        let removed = sqlx::query(
            "DELETE FROM search_result WHERE folder_id = ? AND message_id = ?",
        )
        .bind(watcher.folder_id as i64)
        .bind(message_id as i64)
        .execute(&mut *conn)
        .await?;
        if removed.rows_affected() > 0 {
            handle.notifier.post(StoreEvent::SearchFolderChanged {
                folder_id: watcher.folder_id,
                message_id,
                added: false,
            });
        }
    }
    Ok(())
}
