// SPDX-License-Identifier: MIT
//! Table bookmarks: persisted expand/collapse pattern plus highlighted row,
//! stored in `tmp/state.sqlite3` and reinstated after a table reopens.

use sqlx::{Connection, Row};

use crate::db::{open_state_db, DbHandle};
use crate::error::{Result, StoreError};
use crate::ids::{gc_of, replid_of, REPLID_HEADER, REPLID_LOCAL};
use crate::props::*;

use super::content::index_sub_contents;
use super::query::translate_inst_id;
use super::{TableKind, CONTENT_ROW_HEADER, HEADER_ID_BIT};

fn state_column_type(proptag: u32) -> &'static str {
    match prop_type(proptag) & !MVI_FLAG {
        PT_STRING8 | PT_UNICODE => "TEXT",
        PT_FLOAT | PT_DOUBLE | PT_APPTIME => "REAL",
        PT_CLSID | PT_SVREID | PT_OBJECT | PT_BINARY => "BLOB",
        _ => "INTEGER",
    }
}

impl DbHandle {
    /// Persist the table's expand/collapse pattern and current highlight.
    /// Returns the bookmark id.
    pub async fn store_table_state(
        &self,
        table_id: u32,
        inst_id: u64,
        inst_num: u32,
    ) -> Result<u32> {
        let meta = {
            let registry = self.table_registry.lock().await;
            match registry.get(table_id) {
                Some(meta) if meta.kind == TableKind::Content => meta.clone(),
                _ => return Ok(0),
            }
        };
        let sorts_blob: Option<Vec<u8>> = meta
            .sorts
            .as_ref()
            .filter(|s| s.ccategories > 0)
            .map(|s| serde_json::to_vec(s).unwrap_or_default());
        let mut state_db = open_state_db(&self.dir).await?;

        let existing: Option<i64> = if sorts_blob.is_some() {
            sqlx::query_scalar(
                "SELECT state_id FROM state_info WHERE folder_id = ? AND table_flags = ? \
                 AND sorts = ?",
            )
            .bind(meta.folder_id as i64)
            .bind(meta.table_flags as i64)
            .bind(sorts_blob.as_deref())
            .fetch_optional(&mut state_db)
            .await?
        } else {
            sqlx::query_scalar(
                "SELECT state_id FROM state_info WHERE folder_id = ? AND table_flags = ? \
                 AND sorts IS NULL",
            )
            .bind(meta.folder_id as i64)
            .bind(meta.table_flags as i64)
            .fetch_optional(&mut state_db)
            .await?
        };
        let state_id = match existing {
            Some(id) => {
                if sorts_blob.is_some() {
                    sqlx::query(&format!("DROP TABLE IF EXISTS s{id}"))
                        .execute(&mut state_db)
                        .await?;
                }
                if replid_of(inst_id) != REPLID_LOCAL {
                    sqlx::query(
                        "UPDATE state_info SET message_id = NULL, inst_num = NULL \
                         WHERE state_id = ?",
                    )
                    .bind(id)
                    .execute(&mut state_db)
                    .await?;
                }
                id as u32
            }
            None => {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO state_info (folder_id, table_flags, sorts) VALUES (?, ?, ?) \
                     RETURNING state_id",
                )
                .bind(meta.folder_id as i64)
                .bind(meta.table_flags as i64)
                .bind(sorts_blob.as_deref())
                .fetch_one(&mut state_db)
                .await?;
                id as u32
            }
        };
        if replid_of(inst_id) == REPLID_LOCAL {
            sqlx::query(
                "UPDATE state_info SET message_id = ?, inst_num = ? WHERE state_id = ?",
            )
            .bind(gc_of(inst_id) as i64)
            .bind(inst_num as i64)
            .bind(state_id as i64)
            .execute(&mut state_db)
            .await?;
        }
        let Some(sorts) = meta.sorts.as_ref().filter(|s| s.ccategories > 0) else {
            return Ok(state_id);
        };

        // Header pattern table: one row per header whose state deviates from
        // the default, carrying the value tuple down its parent chain.
        let mut ddl = format!("CREATE TABLE s{state_id} (depth INTEGER NOT NULL");
        for col in sorts.columns.iter().take(sorts.ccategories) {
            ddl.push_str(&format!(", v{:x} {}", col.proptag, state_column_type(col.proptag)));
        }
        ddl.push(')');
        sqlx::query(&ddl).execute(&mut state_db).await?;

        let tables = self.tables_pool().await?.clone();
        let headers = sqlx::query(&format!(
            "SELECT row_id, inst_id, row_stat, depth FROM t{table_id} \
             WHERE row_type = {CONTENT_ROW_HEADER} ORDER BY row_id"
        ))
        .fetch_all(&tables)
        .await?;
        let highlighted = if replid_of(inst_id) == REPLID_HEADER {
            gc_of(inst_id) | HEADER_ID_BIT
        } else {
            0
        };
        let insert_cols: String = (0..sorts.ccategories)
            .map(|i| format!(", v{:x}", sorts.columns[i].proptag))
            .collect();
        let insert_marks: String = (0..sorts.ccategories).map(|_| ", ?".to_string()).collect();
        let insert_sql = format!("INSERT INTO s{state_id} (depth{insert_cols}) VALUES (?{insert_marks})");
        let mut stored = 0u64;
        for header in headers {
            let row_id: i64 = header.get(0);
            let h_inst: i64 = header.get(1);
            let row_stat = header.get::<Option<i64>, _>(2).unwrap_or(0);
            let depth = header.get::<i64, _>(3) as usize;
            if depth >= sorts.ccategories {
                continue;
            }
            let is_highlight = h_inst as u64 == highlighted && highlighted != 0;
            if !is_highlight {
                let default_expanded = depth < sorts.cexpanded;
                if (row_stat != 0) == default_expanded {
                    continue;
                }
            }
            // Collect the value tuple by walking up the parent chain.
            let mut values: Vec<Option<PropValue>> = vec![None; sorts.ccategories];
            let mut cur = row_id;
            let mut cur_depth = depth as i64;
            loop {
                let r = sqlx::query(&format!(
                    "SELECT parent_id, value FROM t{table_id} WHERE row_id = ?"
                ))
                .bind(cur)
                .fetch_one(&tables)
                .await?;
                values[cur_depth as usize] =
                    super::decode_table_value(sorts.columns[cur_depth as usize].proptag, &r, 1);
                if cur_depth == 0 {
                    break;
                }
                cur = r.get::<Option<i64>, _>(0).unwrap_or(0);
                cur_depth -= 1;
            }
            let mut q = sqlx::query(&insert_sql).bind(depth as i64);
            for value in &values {
                q = match value {
                    Some(v) => crate::db::properties::bind_value(q, v)?,
                    None => q.bind(None::<i64>),
                };
            }
            q.execute(&mut state_db).await?;
            stored += 1;
            if is_highlight {
                sqlx::query(
                    "UPDATE state_info SET header_id = ?, header_stat = ? WHERE state_id = ?",
                )
                .bind(stored as i64)
                .bind(row_stat)
                .bind(state_id as i64)
                .execute(&mut state_db)
                .await?;
            }
        }
        state_db.close().await.ok();
        self.touch();
        Ok(state_id)
    }

    /// Reinstate a stored bookmark: reset headers to their defaults, replay
    /// the saved pattern, reindex, and return the new position of the saved
    /// highlight (or -1 when it is gone).
    pub async fn restore_table_state(&self, table_id: u32, state_id: u32) -> Result<i32> {
        if state_id == 0 {
            return Ok(-1);
        }
        let meta = {
            let registry = self.table_registry.lock().await;
            match registry.get(table_id) {
                Some(meta) if meta.kind == TableKind::Content => meta.clone(),
                _ => return Ok(-1),
            }
        };
        let mut state_db = open_state_db(&self.dir).await?;
        let info = sqlx::query(
            "SELECT folder_id, table_flags, sorts, message_id, inst_num, header_id, header_stat \
             FROM state_info WHERE state_id = ?",
        )
        .bind(state_id as i64)
        .fetch_optional(&mut state_db)
        .await?;
        let Some(info) = info else {
            return Ok(-1);
        };
        let message_id = info.get::<Option<i64>, _>(3).unwrap_or(0);
        let saved_inst_num = info.get::<Option<i64>, _>(4).unwrap_or(0);
        let tables = self.tables_pool().await?.clone();
        if info.get::<i64, _>(0) as u64 != meta.folder_id
            || info.get::<i64, _>(1) as u8 != meta.table_flags
        {
            return locate_saved(&tables, table_id, message_id, saved_inst_num, 0).await;
        }
        let sorts_blob: Option<Vec<u8>> = info.get(2);
        let meta_blob = meta
            .sorts
            .as_ref()
            .filter(|s| s.ccategories > 0)
            .map(|s| serde_json::to_vec(s).unwrap_or_default());
        if sorts_blob != meta_blob {
            return locate_saved(&tables, table_id, message_id, saved_inst_num, 0).await;
        }
        let Some(sorts) = meta.sorts.as_ref().filter(|s| s.ccategories > 0) else {
            return locate_saved(&tables, table_id, message_id, saved_inst_num, 0).await;
        };
        let header_ordinal = info.get::<Option<i64>, _>(5).unwrap_or(0);
        let header_stat = info.get::<Option<i64>, _>(6).unwrap_or(0);

        // Reset every header to its default state.
        let headers = sqlx::query(&format!(
            "SELECT row_id, row_stat, depth FROM t{table_id} WHERE row_type = {CONTENT_ROW_HEADER}"
        ))
        .fetch_all(&tables)
        .await?;
        for header in headers {
            let depth = header.get::<i64, _>(2) as usize;
            let row_stat = header.get::<Option<i64>, _>(1).unwrap_or(0) != 0;
            let default_expanded = depth < sorts.cexpanded;
            if row_stat != default_expanded {
                sqlx::query(&format!("UPDATE t{table_id} SET row_stat = ? WHERE row_id = ?"))
                    .bind(default_expanded as i64)
                    .bind(header.get::<i64, _>(0))
                    .execute(&tables)
                    .await?;
            }
        }

        // Replay the saved pattern.
        let pattern = sqlx::query(&format!("SELECT * FROM s{state_id} ORDER BY ROWID ASC"))
            .fetch_all(&mut state_db)
            .await?;
        let mut highlight_row: i64 = 0;
        for (ordinal, row) in pattern.iter().enumerate() {
            let depth = row.get::<i64, _>(0) as usize;
            let mut cur: i64 = 0;
            let mut found = true;
            let by_value = format!(
                "SELECT row_id FROM t{table_id} WHERE parent_id = ? AND value = ?"
            );
            let by_null = format!(
                "SELECT row_id FROM t{table_id} WHERE parent_id = ? AND value IS NULL"
            );
            for level in 0..=depth {
                let value = super::decode_table_value(sorts.columns[level].proptag, row, level + 1);
                let next: Option<i64> = match &value {
                    Some(v) => {
                        let q = sqlx::query(&by_value).bind(cur);
                        crate::db::properties::bind_value(q, v)?
                            .fetch_optional(&tables)
                            .await?
                            .map(|r| r.get::<i64, _>(0))
                    }
                    None => sqlx::query(&by_null)
                        .bind(cur)
                        .fetch_optional(&tables)
                        .await?
                        .map(|r| r.get::<i64, _>(0)),
                };
                match next {
                    Some(row_id) => cur = row_id,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if !found {
                continue;
            }
            let row_stat = if (ordinal + 1) as i64 == header_ordinal {
                highlight_row = cur;
                header_stat != 0
            } else {
                // A stored row means "deviates from default".
                depth >= sorts.cexpanded
            };
            sqlx::query(&format!("UPDATE t{table_id} SET row_stat = ? WHERE row_id = ?"))
                .bind(row_stat as i64)
                .bind(cur)
                .execute(&tables)
                .await?;
        }
        state_db.close().await.ok();

        // Reindex visibility from scratch.
        sqlx::query(&format!("UPDATE t{table_id} SET idx = NULL"))
            .execute(&tables)
            .await?;
        let mut idx = 0u32;
        index_sub_contents(&tables, table_id, 0, &mut idx).await?;
        self.touch();
        locate_saved(&tables, table_id, message_id, saved_inst_num, highlight_row).await
    }
}

async fn locate_saved(
    tables: &sqlx::SqlitePool,
    table_id: u32,
    message_id: i64,
    inst_num: i64,
    highlight_row: i64,
) -> Result<i32> {
    let idx: Option<Option<i64>> = if message_id != 0 {
        sqlx::query_scalar(&format!(
            "SELECT idx FROM t{table_id} WHERE inst_id = ? AND inst_num = ?"
        ))
        .bind(translate_inst_id(crate::ids::make_local_eid(message_id as u64)) as i64)
        .bind(inst_num)
        .fetch_optional(tables)
        .await?
    } else if highlight_row != 0 {
        sqlx::query_scalar(&format!("SELECT idx FROM t{table_id} WHERE row_id = ?"))
            .bind(highlight_row)
            .fetch_optional(tables)
            .await?
    } else {
        None
    };
    Ok(idx.flatten().map(|i| i as i32 - 1).unwrap_or(-1))
}
