// SPDX-License-Identifier: MIT
//! Content-table materialization: the two-stage build (wide scratch table,
//! then category/message emission), visibility indexing, expand/collapse.

use sqlx::{Connection, Row, SqliteConnection};
use tracing::debug;

use crate::db::properties::{self, bind_value, PropTable};
use crate::db::{open_scratch, DbHandle};
use crate::error::{Result, StoreError};
use crate::folder;
use crate::ids::{gc_of, replid_of, REPLID_HEADER};
use crate::props::restriction::Restriction;
use crate::props::*;

use super::*;

fn stbl_column_type(proptag: u32) -> Result<&'static str> {
    match prop_type(proptag) & !MVI_FLAG {
        PT_STRING8 | PT_UNICODE => Ok("TEXT COLLATE NOCASE"),
        PT_FLOAT | PT_DOUBLE | PT_APPTIME => Ok("REAL"),
        PT_CURRENCY | PT_I8 | PT_SYSTIME | PT_SHORT | PT_LONG | PT_BOOLEAN => Ok("INTEGER"),
        PT_CLSID | PT_SVREID | PT_OBJECT | PT_BINARY => Ok("BLOB"),
        _ => Err(StoreError::InvalidParam("unsupported sort column type")),
    }
}

fn base_tag(proptag: u32) -> u32 {
    make_proptag(prop_id(proptag), prop_type(proptag) & !MVI_FLAG)
}

impl DbHandle {
    /// Materialize a content table over a folder. Returns (table id, count
    /// of visible rows).
    pub async fn load_content_table(
        &self,
        cpid: u32,
        folder_id: u64,
        username: Option<&str>,
        table_flags: u8,
        restriction: Option<Restriction>,
        sorts: Option<SortOrderSet>,
    ) -> Result<(u32, u32)> {
        let b_search = {
            let mut conn = self.pool.acquire().await?;
            if !folder::folder_exists(&mut conn, folder_id).await? {
                return Err(StoreError::NotFound);
            }
            folder::is_search_folder(&mut conn, folder_id).await?
        };
        let table_id = {
            let mut registry = self.table_registry.lock().await;
            registry.next_id()
        };
        let mut meta = TableMeta {
            table_id,
            kind: TableKind::Content,
            folder_id,
            table_flags,
            cpid,
            username: username.map(String::from),
            restriction,
            sorts,
            b_search,
            header_id: 0,
        };
        let count = build_content_table(self, &mut meta).await?;
        let mut registry = self.table_registry.lock().await;
        registry.insert(meta);
        self.touch();
        Ok((table_id, count))
    }

    /// Flip a collapsed category header open. Returns (found, position,
    /// number of rows that became visible).
    pub async fn expand_table(&self, table_id: u32, inst_id: u64) -> Result<(bool, i32, u32)> {
        let registry = self.table_registry.lock().await;
        let Some(meta) = registry.get(table_id) else {
            return Ok((false, -1, 0));
        };
        if meta.kind != TableKind::Content || replid_of(inst_id) != REPLID_HEADER {
            return Ok((false, -1, 0));
        }
        let ccategories = meta.sorts.as_ref().map(|s| s.ccategories).unwrap_or(0);
        drop(registry);
        let tables = self.tables_pool().await?.clone();
        let header = gc_of(inst_id) | HEADER_ID_BIT;
        let row = sqlx::query(&format!(
            "SELECT row_id, row_type, row_stat, depth, idx FROM t{table_id} \
             WHERE inst_id = ? AND inst_num = 0"
        ))
        .bind(header as i64)
        .fetch_optional(&tables)
        .await?;
        let Some(row) = row else {
            return Ok((false, -1, 0));
        };
        if row.get::<i64, _>(1) != CONTENT_ROW_HEADER {
            return Ok((false, -1, 0));
        }
        if row.get::<i64, _>(2) != 0 {
            // Already expanded.
            return Ok((true, -1, 0));
        }
        let row_id: i64 = row.get(0);
        let depth = row.get::<i64, _>(3) as usize;
        let idx = row.get::<Option<i64>, _>(4).unwrap_or(0) as u32;
        let position = idx as i32 - 1;
        // Rows that become visible: direct messages, or subheaders plus
        // their own expanded contents.
        let mut newly_visible =
            count_visible_descendants(&tables, table_id, ccategories.saturating_sub(depth + 1), row_id)
                .await?;
        sqlx::query(&format!("UPDATE t{table_id} SET row_stat = 1 WHERE row_id = ?"))
            .bind(row_id)
            .execute(&tables)
            .await?;
        if newly_visible == 0 {
            return Ok((true, position, 0));
        }
        // Shift everything after the header, then index the subtree.
        let following: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT row_id FROM t{table_id} WHERE idx > ? ORDER BY idx DESC"
        ))
        .bind(idx as i64)
        .fetch_all(&tables)
        .await?;
        for rid in following {
            sqlx::query(&format!("UPDATE t{table_id} SET idx = idx + ? WHERE row_id = ?"))
                .bind(newly_visible as i64)
                .bind(rid)
                .execute(&tables)
                .await?;
        }
        let mut cursor = idx;
        index_sub_contents(&tables, table_id, row_id, &mut cursor).await?;
        newly_visible = cursor - idx;
        self.touch();
        Ok((true, position, newly_visible))
    }

    /// Collapse an expanded category header. Returns (found, position,
    /// number of rows hidden).
    pub async fn collapse_table(&self, table_id: u32, inst_id: u64) -> Result<(bool, i32, u32)> {
        let registry = self.table_registry.lock().await;
        let Some(meta) = registry.get(table_id) else {
            return Ok((false, -1, 0));
        };
        if meta.kind != TableKind::Content || replid_of(inst_id) != REPLID_HEADER {
            return Ok((false, -1, 0));
        }
        drop(registry);
        let tables = self.tables_pool().await?.clone();
        let header = gc_of(inst_id) | HEADER_ID_BIT;
        let row = sqlx::query(&format!(
            "SELECT row_id, row_type, row_stat, depth, idx FROM t{table_id} \
             WHERE inst_id = ? AND inst_num = 0"
        ))
        .bind(header as i64)
        .fetch_optional(&tables)
        .await?;
        let Some(row) = row else {
            return Ok((false, -1, 0));
        };
        if row.get::<i64, _>(1) != CONTENT_ROW_HEADER {
            return Ok((false, -1, 0));
        }
        if row.get::<i64, _>(2) == 0 {
            return Ok((true, -1, 0));
        }
        let depth: i64 = row.get(3);
        let idx = row.get::<Option<i64>, _>(4).unwrap_or(0) as u32;
        let position = idx as i32 - 1;
        sqlx::query(&format!("UPDATE t{table_id} SET row_stat = 0 WHERE row_id = ?"))
            .bind(row.get::<i64, _>(0))
            .execute(&tables)
            .await?;
        // Walk forward: rows deeper than the header vanish, everything after
        // shifts left by the hidden count.
        let following = sqlx::query(&format!(
            "SELECT row_id, depth FROM t{table_id} WHERE idx > ? ORDER BY idx ASC"
        ))
        .bind(idx as i64)
        .fetch_all(&tables)
        .await?;
        let mut hidden = 0u32;
        let mut new_idx = idx;
        let mut inside = true;
        for r in following {
            let rid: i64 = r.get(0);
            let rdepth: i64 = r.get(1);
            if inside && rdepth <= depth {
                inside = false;
            }
            if inside {
                hidden += 1;
                sqlx::query(&format!("UPDATE t{table_id} SET idx = NULL WHERE row_id = ?"))
                    .bind(rid)
                    .execute(&tables)
                    .await?;
            } else {
                new_idx += 1;
                sqlx::query(&format!("UPDATE t{table_id} SET idx = ? WHERE row_id = ?"))
                    .bind(new_idx as i64)
                    .bind(rid)
                    .execute(&tables)
                    .await?;
            }
        }
        self.touch();
        Ok((true, position, hidden))
    }
}

/// Visible rows under a header before expansion: messages directly below,
/// or subheaders (plus their expanded descendants).
fn count_visible_descendants<'a>(
    tables: &'a sqlx::SqlitePool,
    table_id: u32,
    depth_budget: usize,
    parent_row: i64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32>> + Send + 'a>> {
    Box::pin(async move {
        let children = sqlx::query(&format!(
            "SELECT row_id, row_stat, row_type FROM t{table_id} WHERE parent_id = ?"
        ))
        .bind(parent_row)
        .fetch_all(tables)
        .await?;
        let mut count = 0u32;
        for child in children {
            count += 1;
            if depth_budget == 0 {
                continue;
            }
            let expanded: i64 = child.get::<Option<i64>, _>(1).unwrap_or(0);
            if child.get::<i64, _>(2) == CONTENT_ROW_HEADER && expanded != 0 {
                count += count_visible_descendants(
                    tables,
                    table_id,
                    depth_budget - 1,
                    child.get::<i64, _>(0),
                )
                .await?;
            }
        }
        Ok(count)
    })
}

/// Assign `idx` to the visible subtree chained under `parent_row`.
pub(crate) fn index_sub_contents<'a>(
    tables: &'a sqlx::SqlitePool,
    table_id: u32,
    parent_row: i64,
    idx: &'a mut u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut cursor = -parent_row;
        loop {
            let row = sqlx::query(&format!(
                "SELECT row_id, row_type, row_stat FROM t{table_id} WHERE prev_id = ?"
            ))
            .bind(cursor)
            .fetch_optional(tables)
            .await?;
            let Some(row) = row else {
                return Ok(());
            };
            let row_id: i64 = row.get(0);
            *idx += 1;
            sqlx::query(&format!("UPDATE t{table_id} SET idx = ? WHERE row_id = ?"))
                .bind(*idx as i64)
                .bind(row_id)
                .execute(tables)
                .await?;
            let expanded = row.get::<Option<i64>, _>(2).unwrap_or(0) != 0;
            if row.get::<i64, _>(1) == CONTENT_ROW_HEADER && expanded {
                index_sub_contents(tables, table_id, row_id, idx).await?;
            }
            cursor = row_id;
        }
    })
}

/// Full (re)build of a content table into `t{meta.table_id}`.
pub(crate) async fn build_content_table(handle: &DbHandle, meta: &mut TableMeta) -> Result<u32> {
    let table_id = meta.table_id;
    let tables = handle.tables_pool().await?.clone();
    sqlx::query(&format!("DROP TABLE IF EXISTS t{table_id}"))
        .execute(&tables)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE t{table_id} \
         (row_id INTEGER PRIMARY KEY AUTOINCREMENT, \
         idx INTEGER UNIQUE DEFAULT NULL, \
         prev_id INTEGER UNIQUE DEFAULT NULL, \
         inst_id INTEGER NOT NULL, \
         row_type INTEGER NOT NULL, \
         row_stat INTEGER DEFAULT NULL, \
         parent_id INTEGER DEFAULT NULL, \
         depth INTEGER NOT NULL, \
         count INTEGER DEFAULT NULL, \
         unread INTEGER DEFAULT NULL, \
         inst_num INTEGER NOT NULL, \
         value DEFAULT NULL, \
         extremum DEFAULT NULL)"
    ))
    .execute(&tables)
    .await?;
    if meta.sorts.as_ref().map(|s| s.ccategories > 0).unwrap_or(false) {
        for ddl in [
            format!("CREATE UNIQUE INDEX t{table_id}_1 ON t{table_id} (inst_id, inst_num)"),
            format!("CREATE INDEX t{table_id}_2 ON t{table_id} (parent_id)"),
            format!("CREATE INDEX t{table_id}_3 ON t{table_id} (parent_id, value)"),
        ] {
            sqlx::query(&ddl).execute(&tables).await?;
        }
    }

    let mut conn = handle.pool.acquire().await?;
    let candidates = candidate_mids(handle, &mut conn, meta).await?;

    let Some(sorts) = meta.sorts.clone() else {
        // Unsorted: plain insertion order.
        let mut last_row: i64 = 0;
        let mut idx: i64 = 0;
        for mid in &candidates {
            if !passes_restriction(handle, &mut conn, meta, *mid).await? {
                continue;
            }
            idx += 1;
            let res = sqlx::query(&format!(
                "INSERT INTO t{table_id} (inst_id, prev_id, row_type, depth, inst_num, idx) \
                 VALUES (?, ?, {CONTENT_ROW_MESSAGE}, 0, 0, ?)"
            ))
            .bind(*mid as i64)
            .bind(last_row)
            .bind(idx)
            .execute(&tables)
            .await?;
            last_row = res.last_insert_rowid();
        }
        return visible_count(&tables, table_id).await;
    };

    // Stage 1: the wide scratch table, one column per sort key.
    let instance_tag = sorts.instance_tag().unwrap_or(0);
    let mut scratch_tags: Vec<u32> = Vec::new();
    for (i, col) in sorts.columns.iter().enumerate() {
        if i >= sorts.ccategories && scratch_tags.contains(&col.proptag) {
            continue;
        }
        scratch_tags.push(col.proptag);
    }
    let mut scratch = open_scratch().await?;
    let mut ddl = String::from("CREATE TABLE stbl (message_id INTEGER");
    for tag in &scratch_tags {
        ddl.push_str(&format!(", v{:x} {}", tag, stbl_column_type(*tag)?));
    }
    if sorts.ccategories > 0 {
        ddl.push_str(", read_state INTEGER");
    }
    if instance_tag != 0 {
        ddl.push_str(", inst_num INTEGER");
    }
    ddl.push(')');
    sqlx::query(&ddl).execute(&mut scratch).await?;
    for (i, tag) in scratch_tags.iter().enumerate() {
        sqlx::query(&format!("CREATE INDEX stbl_{i} ON stbl (v{:x})", tag))
            .execute(&mut scratch)
            .await?;
    }
    let unique = if instance_tag == 0 { "UNIQUE " } else { "" };
    sqlx::query(&format!(
        "CREATE {unique}INDEX t{table_id}_4 ON t{table_id} (inst_id)"
    ))
    .execute(&tables)
    .await?;

    let mut insert_cols = String::from("message_id");
    let mut placeholders = String::from("?");
    for tag in &scratch_tags {
        insert_cols.push_str(&format!(", v{:x}", tag));
        placeholders.push_str(", ?");
    }
    if sorts.ccategories > 0 {
        insert_cols.push_str(", read_state");
        placeholders.push_str(", ?");
    }
    if instance_tag != 0 {
        insert_cols.push_str(", inst_num");
        placeholders.push_str(", ?");
    }
    let insert_sql = format!("INSERT INTO stbl ({insert_cols}) VALUES ({placeholders})");

    for mid in &candidates {
        if !passes_restriction(handle, &mut conn, meta, *mid).await? {
            continue;
        }
        let mut values: Vec<Option<PropValue>> = Vec::with_capacity(scratch_tags.len());
        for tag in &scratch_tags {
            if *tag == instance_tag {
                values.push(None);
                continue;
            }
            values.push(
                properties::get_property(handle, &mut conn, PropTable::Message, *mid, base_tag(*tag))
                    .await?,
            );
        }
        let read_state = if sorts.ccategories > 0 {
            Some(
                properties::get_property(handle, &mut conn, PropTable::Message, *mid, PR_READ)
                    .await?
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            )
        } else {
            None
        };
        // One scratch row per element of the MVI property, or a single
        // null-instance row.
        let instances: Vec<(Option<PropValue>, i64)> = if instance_tag != 0 {
            let mv_tag = make_proptag(prop_id(instance_tag), prop_type(instance_tag) & !MV_INSTANCE);
            let mv = properties::get_property(handle, &mut conn, PropTable::Message, *mid, mv_tag)
                .await?;
            explode_instances(mv)
        } else {
            vec![(None, 0)]
        };
        for (inst_value, inst_num) in instances {
            let mut q = sqlx::query(&insert_sql).bind(*mid as i64);
            for (tag, value) in scratch_tags.iter().zip(values.iter()) {
                let effective = if *tag == instance_tag { &inst_value } else { value };
                q = match effective {
                    Some(v) => bind_value(q, v)?,
                    None => q.bind(None::<i64>),
                };
            }
            if let Some(rs) = read_state {
                q = q.bind(rs as i64);
            }
            if instance_tag != 0 {
                q = q.bind(inst_num);
            }
            q.execute(&mut scratch).await?;
        }
    }

    // Stage 2: emit category headers and message rows.
    let mut header_id = meta.header_id;
    let mut unread_total = 0u32;
    emit_content_rows(
        &tables,
        &mut scratch,
        table_id,
        &sorts,
        instance_tag,
        0,
        0,
        &mut Vec::new(),
        &mut header_id,
        &mut unread_total,
    )
    .await?;
    meta.header_id = header_id;
    scratch.close().await.ok();

    if sorts.ccategories > 0 {
        let mut idx = 0u32;
        index_sub_contents(&tables, table_id, 0, &mut idx).await?;
    } else {
        sqlx::query(&format!("UPDATE t{table_id} SET idx = row_id"))
            .execute(&tables)
            .await?;
    }
    let count = visible_count(&tables, table_id).await?;
    debug!(table_id, folder_id = meta.folder_id, count, "content table built");
    Ok(count)
}

fn explode_instances(mv: Option<PropValue>) -> Vec<(Option<PropValue>, i64)> {
    let Some(mv) = mv else {
        return vec![(None, 0)];
    };
    let scalars: Vec<PropValue> = match mv {
        PropValue::MvShort(v) => v.into_iter().map(PropValue::Short).collect(),
        PropValue::MvLong(v) => v.into_iter().map(PropValue::Long).collect(),
        PropValue::MvI8(v) => v.into_iter().map(PropValue::I8).collect(),
        PropValue::MvSysTime(v) => v.into_iter().map(PropValue::SysTime).collect(),
        PropValue::MvUnicode(v) => v.into_iter().map(PropValue::Unicode).collect(),
        PropValue::MvString8(v) => v.into_iter().map(PropValue::String8).collect(),
        PropValue::MvGuid(v) => v.into_iter().map(PropValue::Guid).collect(),
        PropValue::MvBinary(v) => v.into_iter().map(PropValue::Binary).collect(),
        single => vec![single],
    };
    if scalars.is_empty() {
        return vec![(None, 0)];
    }
    scalars
        .into_iter()
        .enumerate()
        .map(|(i, v)| (Some(v), i as i64 + 1))
        .collect()
}

async fn candidate_mids(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    meta: &TableMeta,
) -> Result<Vec<u64>> {
    let associated = meta.table_flags & TABLE_FLAG_ASSOCIATED != 0;
    let soft_deleted = meta.table_flags & TABLE_FLAG_SOFTDELETES != 0;
    if handle.private && soft_deleted {
        return Ok(Vec::new());
    }
    let rows: Vec<i64> = if meta.b_search {
        sqlx::query_scalar(
            "SELECT m.message_id FROM messages m JOIN search_result s \
             ON s.folder_id = ? AND s.message_id = m.message_id \
             WHERE m.is_associated = ?",
        )
        .bind(meta.folder_id as i64)
        .bind(associated as i64)
        .fetch_all(conn)
        .await?
    } else if handle.private {
        sqlx::query_scalar(
            "SELECT message_id FROM messages WHERE parent_fid = ? AND is_associated = ?",
        )
        .bind(meta.folder_id as i64)
        .bind(associated as i64)
        .fetch_all(conn)
        .await?
    } else {
        sqlx::query_scalar(
            "SELECT message_id FROM messages WHERE parent_fid = ? AND is_associated = ? \
             AND is_deleted = ?",
        )
        .bind(meta.folder_id as i64)
        .bind(associated as i64)
        .bind(soft_deleted as i64)
        .fetch_all(conn)
        .await?
    };
    Ok(rows.into_iter().map(|m| m as u64).collect())
}

async fn passes_restriction(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    meta: &TableMeta,
    mid: u64,
) -> Result<bool> {
    match &meta.restriction {
        Some(res) => crate::message::eval_message_restriction(handle, conn, mid, res).await,
        None => Ok(true),
    }
}

async fn visible_count(tables: &sqlx::SqlitePool, table_id: u32) -> Result<u32> {
    let n: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(idx) FROM t{table_id} WHERE idx IS NOT NULL"))
            .fetch_one(tables)
            .await?;
    Ok(n as u32)
}

/// Recursive category emission over the scratch table. At each category
/// depth, GROUP BY the column and insert one header per distinct value;
/// below the last category, insert the message rows in sort order.
#[allow(clippy::too_many_arguments)]
fn emit_content_rows<'a>(
    tables: &'a sqlx::SqlitePool,
    scratch: &'a mut SqliteConnection,
    table_id: u32,
    sorts: &'a SortOrderSet,
    instance_tag: u32,
    depth: usize,
    parent_row: i64,
    conditions: &'a mut Vec<(u32, Option<PropValue>)>,
    header_id: &'a mut u64,
    unread_out: &'a mut u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32>> + Send + 'a>> {
    Box::pin(async move {
        let mut where_clause = String::new();
        for (tag, value) in conditions.iter() {
            let prefix = if where_clause.is_empty() { "WHERE " } else { " AND " };
            if value.is_some() {
                where_clause.push_str(&format!("{prefix}v{:x} = ?", tag));
            } else {
                where_clause.push_str(&format!("{prefix}v{:x} IS NULL", tag));
            }
        }
        if depth == sorts.ccategories {
            // Message level.
            let select_cols = if instance_tag != 0 {
                format!("message_id, read_state, inst_num, v{:x}", instance_tag)
            } else if sorts.ccategories > 0 {
                "message_id, read_state".to_string()
            } else {
                "message_id".to_string()
            };
            let mut order = String::new();
            for col in sorts.columns.iter().skip(sorts.ccategories) {
                if matches!(col.dir, SortDir::MaxCategory | SortDir::MinCategory) {
                    continue;
                }
                order.push_str(if order.is_empty() { " ORDER BY " } else { ", " });
                order.push_str(&format!(
                    "v{:x} {}",
                    col.proptag,
                    if col.dir == SortDir::Asc { "ASC" } else { "DESC" }
                ));
            }
            let sql = format!("SELECT {select_cols} FROM stbl {where_clause}{order}");
            let mut q = sqlx::query(&sql);
            for (_, value) in conditions.iter() {
                if let Some(v) = value {
                    q = bind_value(q, v)?;
                }
            }
            let rows = q.fetch_all(&mut *scratch).await?;
            let mut prev = -parent_row;
            let mut unread = 0u32;
            let mut count = 0u32;
            for row in rows {
                count += 1;
                let mid: i64 = row.get(0);
                let (read_flag, inst_num, inst_value): (Option<i64>, i64, Option<PropValue>) =
                    if instance_tag != 0 {
                        (
                            Some(row.get::<i64, _>(1)),
                            row.get::<i64, _>(2),
                            decode_table_value(instance_tag, &row, 3),
                        )
                    } else if sorts.ccategories > 0 {
                        (Some(row.get::<i64, _>(1)), 0, None)
                    } else {
                        (None, 0, None)
                    };
                if let Some(flag) = read_flag {
                    if flag == 0 {
                        unread += 1;
                    }
                }
                let sql = format!(
                    "INSERT INTO t{table_id} (inst_id, row_type, parent_id, depth, inst_num, \
                     value, extremum, prev_id) VALUES (?, {CONTENT_ROW_MESSAGE}, ?, ?, ?, ?, ?, ?)"
                );
                let mut q = sqlx::query(&sql)
                    .bind(mid)
                    .bind(parent_row)
                    .bind(depth as i64);
                q = q.bind(inst_num);
                q = match &inst_value {
                    Some(v) => bind_value(q, v)?,
                    None => q.bind(None::<i64>),
                };
                // extremum carries read(1)/unread(0) for message rows.
                q = match read_flag {
                    Some(flag) => q.bind(flag),
                    None => q.bind(None::<i64>),
                };
                q = q.bind(prev);
                let res = q.execute(tables).await?;
                prev = res.last_insert_rowid();
            }
            *unread_out += unread;
            return Ok(count);
        }

        // Category level.
        let cat_tag = sorts.columns[depth].proptag;
        let extremum = depth == sorts.ccategories - 1
            && sorts.columns.len() > sorts.ccategories
            && matches!(
                sorts.columns[sorts.ccategories].dir,
                SortDir::MaxCategory | SortDir::MinCategory
            );
        let sql = if extremum {
            let agg_tag = sorts.columns[sorts.ccategories].proptag;
            let agg = if sorts.columns[sorts.ccategories].dir == SortDir::MaxCategory {
                "MAX"
            } else {
                "MIN"
            };
            format!(
                "SELECT v{cat:x}, COUNT(*), {agg}(v{agg_tag:x}) AS ext FROM stbl {where_clause} \
                 GROUP BY v{cat:x} ORDER BY ext {dir}",
                cat = cat_tag,
                agg_tag = agg_tag,
                dir = if sorts.columns[depth].dir == SortDir::Asc { "ASC" } else { "DESC" },
            )
        } else {
            format!(
                "SELECT v{cat:x}, COUNT(*) FROM stbl {where_clause} GROUP BY v{cat:x} \
                 ORDER BY v{cat:x} {dir}",
                cat = cat_tag,
                dir = if sorts.columns[depth].dir == SortDir::Asc { "ASC" } else { "DESC" },
            )
        };
        let mut q = sqlx::query(&sql);
        for (_, value) in conditions.iter() {
            if let Some(v) = value {
                q = bind_value(q, v)?;
            }
        }
        let groups = q.fetch_all(&mut *scratch).await?;
        let mut prev = -parent_row;
        let mut total = 0u32;
        for group in groups {
            *header_id += 1;
            let inst_id = *header_id | HEADER_ID_BIT;
            let value = decode_table_value(cat_tag, &group, 0);
            let group_count: i64 = group.get(1);
            let ext_value = if extremum {
                decode_table_value(sorts.columns[sorts.ccategories].proptag, &group, 2)
            } else {
                None
            };
            let sql = format!(
                "INSERT INTO t{table_id} (inst_id, row_type, row_stat, parent_id, depth, count, \
                 inst_num, value, extremum, prev_id) \
                 VALUES (?, {CONTENT_ROW_HEADER}, ?, ?, ?, ?, 0, ?, ?, ?)"
            );
            let mut q = sqlx::query(&sql)
                .bind(inst_id as i64)
                .bind((depth < sorts.cexpanded) as i64)
                .bind(parent_row)
                .bind(depth as i64)
                .bind(group_count);
            q = match &value {
                Some(v) => bind_value(q, v)?,
                None => q.bind(None::<i64>),
            };
            q = match &ext_value {
                Some(v) => bind_value(q, v)?,
                None => q.bind(None::<i64>),
            };
            q = q.bind(prev);
            let res = q.execute(tables).await?;
            let header_row = res.last_insert_rowid();
            prev = header_row;
            conditions.push((cat_tag, value));
            let mut unread = 0u32;
            let children = emit_content_rows(
                tables,
                scratch,
                table_id,
                sorts,
                instance_tag,
                depth + 1,
                header_row,
                conditions,
                header_id,
                &mut unread,
            )
            .await?;
            conditions.pop();
            let _ = children;
            sqlx::query(&format!("UPDATE t{table_id} SET unread = ? WHERE row_id = ?"))
                .bind(unread as i64)
                .bind(header_row)
                .execute(tables)
                .await?;
            *unread_out += unread;
            total += group_count as u32;
        }
        Ok(total)
    })
}

/// Drop and rebuild an open content table with its remembered parameters.
pub(crate) async fn reload_content_table(handle: &DbHandle, table_id: u32) -> Result<()> {
    let mut meta = {
        let registry = handle.table_registry.lock().await;
        match registry.get(table_id) {
            Some(meta) if meta.kind == TableKind::Content => meta.clone(),
            _ => return Ok(()),
        }
    };
    meta.header_id = 0;
    build_content_table(handle, &mut meta).await?;
    let mut registry = handle.table_registry.lock().await;
    if let Some(live) = registry.get_mut(table_id) {
        live.header_id = meta.header_id;
    }
    Ok(())
}
