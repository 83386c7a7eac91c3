// SPDX-License-Identifier: MIT
//! View tables: materialized hierarchy/content/permission/rule views living
//! in the per-handle in-memory tables database.
//!
//! Every materialized table is a `t{id}` SQLite table whose `idx` column
//! provides dense positional addressing over the currently visible rows.

pub mod content;
pub mod query;
pub mod state;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::folder;
use crate::notify::StoreEvent;
use crate::props::restriction::Restriction;
use crate::props::*;

pub const TABLE_FLAG_ASSOCIATED: u8 = 0x02;
pub const TABLE_FLAG_DEPTH: u8 = 0x04;
pub const TABLE_FLAG_SOFTDELETES: u8 = 0x08;
pub const TABLE_FLAG_NONOTIFICATIONS: u8 = 0x10;
pub const TABLE_FLAG_CONVERSATIONMEMBERS: u8 = 0x80;

pub const CONTENT_ROW_HEADER: i64 = 1;
pub const CONTENT_ROW_MESSAGE: i64 = 2;

/// Header rows pack their counter under this bit to stay disjoint from mids
/// inside the `inst_id` column.
pub(crate) const HEADER_ID_BIT: u64 = 0x0100_0000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    Asc,
    Desc,
    /// Category ordered by the maximum of the next sort column.
    MaxCategory,
    /// Category ordered by the minimum of the next sort column.
    MinCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortColumn {
    pub proptag: u32,
    pub dir: SortDir,
}

/// Sort-order set: the first `ccategories` columns group rows into category
/// headers; headers shallower than `cexpanded` start expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOrderSet {
    pub columns: Vec<SortColumn>,
    pub ccategories: usize,
    pub cexpanded: usize,
}

impl SortOrderSet {
    /// The single MVI column, if any.
    pub fn instance_tag(&self) -> Option<u32> {
        self.columns
            .iter()
            .find(|c| prop_type(c.proptag) & MVI_FLAG == MVI_FLAG)
            .map(|c| c.proptag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Hierarchy,
    Content,
    Permission,
    Rule,
}

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub table_id: u32,
    pub kind: TableKind,
    pub folder_id: u64,
    pub table_flags: u8,
    pub cpid: u32,
    pub username: Option<String>,
    pub restriction: Option<Restriction>,
    pub sorts: Option<SortOrderSet>,
    pub b_search: bool,
    pub header_id: u64,
}

#[derive(Debug, Default)]
pub struct TableRegistry {
    last_id: u32,
    tables: Vec<TableMeta>,
}

impl TableRegistry {
    pub fn next_id(&mut self) -> u32 {
        self.last_id += 1;
        self.last_id
    }

    pub fn insert(&mut self, meta: TableMeta) {
        self.tables.push(meta);
    }

    pub fn get(&self, table_id: u32) -> Option<&TableMeta> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }

    pub fn get_mut(&mut self, table_id: u32) -> Option<&mut TableMeta> {
        self.tables.iter_mut().find(|t| t.table_id == table_id)
    }

    pub fn remove(&mut self, table_id: u32) -> Option<TableMeta> {
        let pos = self.tables.iter().position(|t| t.table_id == table_id)?;
        Some(self.tables.remove(pos))
    }

    pub fn table_ids(&self) -> Vec<u32> {
        self.tables.iter().map(|t| t.table_id).collect()
    }

    pub fn on_folder(&self, folder_id: u64, kind: TableKind) -> Vec<u32> {
        self.tables
            .iter()
            .filter(|t| t.folder_id == folder_id && t.kind == kind)
            .map(|t| t.table_id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl DbHandle {
    /// Count folder children without materializing a table.
    pub async fn sum_hierarchy(&self, folder_id: u64, username: Option<&str>, recursive: bool) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        let mut count = 0u32;
        let mut stack = vec![folder_id];
        while let Some(fid) = stack.pop() {
            let children: Vec<i64> = sqlx::query_scalar(
                "SELECT folder_id FROM folders WHERE parent_id = ? AND is_deleted = 0",
            )
            .bind(fid as i64)
            .fetch_all(&mut *conn)
            .await?;
            for child in children {
                if let Some(user) = username {
                    let rights =
                        folder::folder_rights(self, &mut conn, child as u64, user).await?;
                    if rights & (RIGHTS_READ_ANY | RIGHTS_VISIBLE | RIGHTS_OWNER) == 0 {
                        continue;
                    }
                }
                count += 1;
                if recursive {
                    stack.push(child as u64);
                }
            }
        }
        Ok(count)
    }

    /// Count folder contents without materializing a table.
    pub async fn sum_content(&self, folder_id: u64, associated: bool) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE parent_fid = ? AND is_associated = ? \
             AND is_deleted = 0",
        )
        .bind(folder_id as i64)
        .bind(associated as i64)
        .fetch_one(&mut *conn)
        .await?;
        Ok(n as u32)
    }

    /// Materialize a hierarchy table. Returns (table id, row count).
    pub async fn load_hierarchy_table(
        &self,
        folder_id: u64,
        username: Option<&str>,
        table_flags: u8,
    ) -> Result<(u32, u32)> {
        let tables = self.tables_pool().await?.clone();
        let table_id = {
            let mut registry = self.table_registry.lock().await;
            registry.next_id()
        };
        sqlx::query(&format!(
            "CREATE TABLE t{table_id} (idx INTEGER PRIMARY KEY AUTOINCREMENT, \
             folder_id INTEGER UNIQUE NOT NULL, depth INTEGER NOT NULL)"
        ))
        .execute(&tables)
        .await?;
        let mut conn = self.pool.acquire().await?;
        let mut count = 0u32;
        self.load_hierarchy_rows(
            &mut conn,
            &tables,
            table_id,
            folder_id,
            username,
            table_flags,
            0,
            &mut count,
        )
        .await?;
        let mut registry = self.table_registry.lock().await;
        registry.insert(TableMeta {
            table_id,
            kind: TableKind::Hierarchy,
            folder_id,
            table_flags,
            cpid: 0,
            username: username.map(String::from),
            restriction: None,
            sorts: None,
            b_search: false,
            header_id: 0,
        });
        self.touch();
        Ok((table_id, count))
    }

    #[allow(clippy::too_many_arguments)]
    fn load_hierarchy_rows<'a>(
        &'a self,
        conn: &'a mut sqlx::SqliteConnection,
        tables: &'a sqlx::SqlitePool,
        table_id: u32,
        folder_id: u64,
        username: Option<&'a str>,
        table_flags: u8,
        depth: u32,
        count: &'a mut u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let sql = if self.private {
                "SELECT folder_id FROM folders WHERE parent_id = ? ORDER BY folder_id"
            } else if table_flags & TABLE_FLAG_SOFTDELETES != 0 {
                "SELECT folder_id FROM folders WHERE parent_id = ? AND is_deleted = 1 \
                 ORDER BY folder_id"
            } else {
                "SELECT folder_id FROM folders WHERE parent_id = ? AND is_deleted = 0 \
                 ORDER BY folder_id"
            };
            let children: Vec<i64> = sqlx::query_scalar(sql)
                .bind(folder_id as i64)
                .fetch_all(&mut *conn)
                .await?;
            for child in children {
                let child = child as u64;
                if let Some(user) = username {
                    let rights = folder::folder_rights(self, conn, child, user).await?;
                    if rights & (RIGHTS_READ_ANY | RIGHTS_VISIBLE | RIGHTS_OWNER) == 0 {
                        continue;
                    }
                }
                sqlx::query(&format!(
                    "INSERT INTO t{table_id} (folder_id, depth) VALUES (?, ?)"
                ))
                .bind(child as i64)
                .bind(depth as i64)
                .execute(tables)
                .await?;
                *count += 1;
                if table_flags & TABLE_FLAG_DEPTH != 0 {
                    self.load_hierarchy_rows(
                        conn,
                        tables,
                        table_id,
                        child,
                        username,
                        table_flags,
                        depth + 1,
                        count,
                    )
                    .await?;
                }
            }
            Ok(())
        })
    }

    /// Materialize a permission table. The two synthetic members (default,
    /// anonymous) are created on the folder if absent.
    pub async fn load_permission_table(&self, folder_id: u64) -> Result<(u32, u32)> {
        let mut conn = self.pool.acquire().await?;
        if !folder::folder_exists(&mut conn, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        for member in ["", "default"] {
            let present: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM permissions WHERE folder_id = ? AND username = ?",
            )
            .bind(folder_id as i64)
            .bind(member)
            .fetch_one(&mut *conn)
            .await?;
            if present == 0 {
                sqlx::query(
                    "INSERT INTO permissions (folder_id, username, permission) VALUES (?, ?, 0)",
                )
                .bind(folder_id as i64)
                .bind(member)
                .execute(&mut *conn)
                .await?;
            }
        }
        let tables = self.tables_pool().await?.clone();
        let table_id = {
            let mut registry = self.table_registry.lock().await;
            registry.next_id()
        };
        sqlx::query(&format!(
            "CREATE TABLE t{table_id} (idx INTEGER PRIMARY KEY AUTOINCREMENT, \
             member_id INTEGER UNIQUE NOT NULL)"
        ))
        .execute(&tables)
        .await?;
        let members: Vec<i64> = sqlx::query_scalar(
            "SELECT member_id FROM permissions WHERE folder_id = ? ORDER BY member_id",
        )
        .bind(folder_id as i64)
        .fetch_all(&mut *conn)
        .await?;
        let count = members.len() as u32;
        for member in members {
            sqlx::query(&format!("INSERT INTO t{table_id} (member_id) VALUES (?)"))
                .bind(member)
                .execute(&tables)
                .await?;
        }
        let mut registry = self.table_registry.lock().await;
        registry.insert(TableMeta {
            table_id,
            kind: TableKind::Permission,
            folder_id,
            table_flags: 0,
            cpid: 0,
            username: None,
            restriction: None,
            sorts: None,
            b_search: false,
            header_id: 0,
        });
        self.touch();
        Ok((table_id, count))
    }

    /// Materialize a rule table.
    pub async fn load_rule_table(&self, folder_id: u64) -> Result<(u32, u32)> {
        let mut conn = self.pool.acquire().await?;
        if !folder::folder_exists(&mut conn, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        let tables = self.tables_pool().await?.clone();
        let table_id = {
            let mut registry = self.table_registry.lock().await;
            registry.next_id()
        };
        sqlx::query(&format!(
            "CREATE TABLE t{table_id} (idx INTEGER PRIMARY KEY AUTOINCREMENT, \
             rule_id INTEGER UNIQUE NOT NULL)"
        ))
        .execute(&tables)
        .await?;
        let rules: Vec<i64> = sqlx::query_scalar(
            "SELECT rule_id FROM rules WHERE folder_id = ? ORDER BY sequence",
        )
        .bind(folder_id as i64)
        .fetch_all(&mut *conn)
        .await?;
        let count = rules.len() as u32;
        for rule in rules {
            sqlx::query(&format!("INSERT INTO t{table_id} (rule_id) VALUES (?)"))
                .bind(rule)
                .execute(&tables)
                .await?;
        }
        let mut registry = self.table_registry.lock().await;
        registry.insert(TableMeta {
            table_id,
            kind: TableKind::Rule,
            folder_id,
            table_flags: 0,
            cpid: 0,
            username: None,
            restriction: None,
            sorts: None,
            b_search: false,
            header_id: 0,
        });
        self.touch();
        Ok((table_id, count))
    }

    /// Drop a materialized table and forget its registration.
    pub async fn unload_table(&self, table_id: u32) -> Result<()> {
        let mut registry = self.table_registry.lock().await;
        if registry.remove(table_id).is_none() {
            return Ok(());
        }
        drop(registry);
        let tables = self.tables_pool().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS t{table_id}"))
            .execute(tables)
            .await?;
        Ok(())
    }

    /// Visible row count of a materialized table.
    pub async fn sum_table(&self, table_id: u32) -> Result<u32> {
        let registry = self.table_registry.lock().await;
        let Some(_) = registry.get(table_id) else {
            return Err(StoreError::NullObject);
        };
        drop(registry);
        let tables = self.tables_pool().await?;
        let n: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(idx) FROM t{table_id} WHERE idx IS NOT NULL"))
                .fetch_one(tables)
                .await?;
        Ok(n as u32)
    }
}

/// Rebuild open content tables over a folder after a content mutation and
/// tell subscribers. Failures log and continue — view staleness must not
/// block the mutation path.
pub(crate) async fn notify_tables_folder_changed(handle: &DbHandle, folder_id: u64) {
    let table_ids = {
        let registry = handle.table_registry.lock().await;
        registry.on_folder(folder_id, TableKind::Content)
    };
    for table_id in table_ids {
        match content::reload_content_table(handle, table_id).await {
            Ok(()) => handle.notifier.post(StoreEvent::TableReloaded { table_id }),
            Err(e) => warn!(table_id, err = %e, "content table reload failed"),
        }
    }
}

/// Row-level modification signal for open content tables.
pub(crate) async fn notify_tables_message_modified(
    handle: &DbHandle,
    folder_id: u64,
    message_id: u64,
) {
    let table_ids = {
        let registry = handle.table_registry.lock().await;
        registry.on_folder(folder_id, TableKind::Content)
    };
    for table_id in table_ids {
        handle.notifier.post(StoreEvent::TableRowModified {
            table_id,
            inst_id: crate::ids::make_local_eid(message_id),
            inst_num: 0,
        });
    }
}

/// Decode a cell from a `t{id}` table `value`/`extremum` column according
/// to the sort column's type.
pub(crate) fn decode_table_value(
    proptag: u32,
    row: &sqlx::sqlite::SqliteRow,
    idx: usize,
) -> Option<PropValue> {
    let base = prop_type(proptag) & !MVI_FLAG;
    crate::db::properties::decode_cell(make_proptag(prop_id(proptag), base), row, idx)
}
