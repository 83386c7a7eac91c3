// SPDX-License-Identifier: MIT
//! Positional reads over materialized tables: windowed fetch, match, locate,
//! single-row read and identity at position.

use sqlx::Row;

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::ids::{gc_of, make_eid, make_local_eid, replid_of, REPLID_HEADER};
use crate::props::restriction::Restriction;
use crate::props::*;

use super::*;

impl DbHandle {
    /// Fetch `needed` rows starting at visible position `start` (0-based),
    /// projecting `proptags` per row. String/binary cells obey the row
    /// truncation contract.
    pub async fn query_table(
        &self,
        table_id: u32,
        proptags: &[u32],
        start: u32,
        needed: u32,
    ) -> Result<Vec<PropvalBag>> {
        let meta = {
            let registry = self.table_registry.lock().await;
            registry.get(table_id).cloned().ok_or(StoreError::NullObject)?
        };
        let tables = self.tables_pool().await?.clone();
        let mut out = Vec::new();
        match meta.kind {
            TableKind::Content => {
                let rows = sqlx::query(&format!(
                    "SELECT inst_id, row_type, row_stat, depth, count, unread, inst_num, value, \
                     extremum FROM t{table_id} WHERE idx >= ? ORDER BY idx LIMIT ?"
                ))
                .bind(start as i64 + 1)
                .bind(needed as i64)
                .fetch_all(&tables)
                .await?;
                let mut conn = self.pool.acquire().await?;
                for row in rows {
                    out.push(
                        self.content_row_bag(&mut conn, &meta, &row, proptags).await?,
                    );
                }
            }
            TableKind::Hierarchy => {
                let rows = sqlx::query(&format!(
                    "SELECT folder_id, depth FROM t{table_id} WHERE idx >= ? ORDER BY idx LIMIT ?"
                ))
                .bind(start as i64 + 1)
                .bind(needed as i64)
                .fetch_all(&tables)
                .await?;
                let mut conn = self.pool.acquire().await?;
                for row in rows {
                    let fid = row.get::<i64, _>(0) as u64;
                    let mut bag =
                        properties::get_properties(self, &mut conn, PropTable::Folder, fid, proptags)
                            .await?;
                    if proptags.contains(&PR_DEPTH) {
                        bag.set(PR_DEPTH, PropValue::Long(row.get::<i64, _>(1) as i32));
                    }
                    if proptags.contains(&PR_FOLDER_ID) {
                        bag.set(PR_FOLDER_ID, PropValue::I8(make_local_eid(fid) as i64));
                    }
                    for (_, v) in bag.values_mut() {
                        truncate_for_row(v);
                    }
                    out.push(bag);
                }
            }
            TableKind::Permission => {
                let rows = sqlx::query(&format!(
                    "SELECT member_id FROM t{table_id} WHERE idx >= ? ORDER BY idx LIMIT ?"
                ))
                .bind(start as i64 + 1)
                .bind(needed as i64)
                .fetch_all(&tables)
                .await?;
                let mut conn = self.pool.acquire().await?;
                for row in rows {
                    out.push(self.permission_row_bag(&mut conn, row.get::<i64, _>(0), proptags).await?);
                }
            }
            TableKind::Rule => {
                let rows = sqlx::query(&format!(
                    "SELECT rule_id FROM t{table_id} WHERE idx >= ? ORDER BY idx LIMIT ?"
                ))
                .bind(start as i64 + 1)
                .bind(needed as i64)
                .fetch_all(&tables)
                .await?;
                let mut conn = self.pool.acquire().await?;
                for row in rows {
                    out.push(self.rule_row_bag(&mut conn, row.get::<i64, _>(0), proptags).await?);
                }
            }
        }
        self.touch();
        Ok(out)
    }

    async fn content_row_bag(
        &self,
        conn: &mut sqlx::SqliteConnection,
        meta: &TableMeta,
        row: &sqlx::sqlite::SqliteRow,
        proptags: &[u32],
    ) -> Result<PropvalBag> {
        let inst_id = row.get::<i64, _>(0) as u64;
        let row_type: i64 = row.get(1);
        let depth = row.get::<i64, _>(3) as usize;
        let inst_num: i64 = row.get(6);
        let mut bag = PropvalBag::new();
        let is_header = row_type == CONTENT_ROW_HEADER;
        for &tag in proptags {
            match tag {
                PR_INST_ID => {
                    let eid = if is_header {
                        make_eid(REPLID_HEADER, inst_id & !HEADER_ID_BIT)
                    } else {
                        make_local_eid(inst_id)
                    };
                    bag.set(tag, PropValue::I8(eid as i64));
                }
                PR_INSTANCE_NUM => {
                    bag.set(tag, PropValue::Long(inst_num as i32));
                }
                PR_ROW_TYPE => {
                    bag.set(tag, PropValue::Long(row_type as i32));
                }
                PR_DEPTH => {
                    bag.set(tag, PropValue::Long(depth as i32));
                }
                PR_CONTENT_COUNT if is_header => {
                    let count = row.get::<Option<i64>, _>(4).unwrap_or(0);
                    bag.set(tag, PropValue::Long(count as i32));
                }
                PR_CONTENT_UNREAD if is_header => {
                    let unread = row.get::<Option<i64>, _>(5).unwrap_or(0);
                    bag.set(tag, PropValue::Long(unread as i32));
                }
                _ => {
                    if is_header {
                        if let Some(sorts) = &meta.sorts {
                            if depth < sorts.ccategories
                                && prop_id(sorts.columns[depth].proptag) == prop_id(tag)
                            {
                                if let Some(v) = decode_table_value(tag, row, 7) {
                                    bag.set(tag, v);
                                }
                                continue;
                            }
                            if sorts
                                .columns
                                .get(sorts.ccategories)
                                .map(|c| prop_id(c.proptag) == prop_id(tag))
                                .unwrap_or(false)
                            {
                                if let Some(v) = decode_table_value(tag, row, 8) {
                                    bag.set(tag, v);
                                }
                            }
                        }
                        continue;
                    }
                    // Message row: instance column wins over storage for the
                    // MVI tag, everything else reads through the store.
                    if let Some(sorts) = &meta.sorts {
                        if sorts
                            .instance_tag()
                            .map(|t| prop_id(t) == prop_id(tag))
                            .unwrap_or(false)
                        {
                            if let Some(v) = decode_table_value(tag, row, 7) {
                                bag.set(tag, v);
                            }
                            continue;
                        }
                    }
                    if let Some(mut v) =
                        properties::get_property(self, conn, PropTable::Message, inst_id, tag)
                            .await?
                    {
                        truncate_for_row(&mut v);
                        bag.set(tag, v);
                    }
                }
            }
        }
        Ok(bag)
    }

    async fn permission_row_bag(
        &self,
        conn: &mut sqlx::SqliteConnection,
        member_id: i64,
        proptags: &[u32],
    ) -> Result<PropvalBag> {
        let row = sqlx::query("SELECT username, permission FROM permissions WHERE member_id = ?")
            .bind(member_id)
            .fetch_optional(conn)
            .await?
            .ok_or(StoreError::NotFound)?;
        let username: String = row.get(0);
        let rights: i64 = row.get(1);
        let (wire_member, display) = match username.as_str() {
            "" => (0i64, "default".to_string()),
            "default" => (-1i64, "anonymous".to_string()),
            other => (member_id, other.to_string()),
        };
        let mut bag = PropvalBag::new();
        for &tag in proptags {
            match tag {
                PR_MEMBER_ID => bag.set(tag, PropValue::I8(wire_member)),
                PR_MEMBER_NAME => bag.set(tag, PropValue::Unicode(display.clone())),
                PR_MEMBER_RIGHTS => bag.set(tag, PropValue::Long(rights as i32)),
                _ => {}
            }
        }
        Ok(bag)
    }

    async fn rule_row_bag(
        &self,
        conn: &mut sqlx::SqliteConnection,
        rule_id: i64,
        proptags: &[u32],
    ) -> Result<PropvalBag> {
        let row = sqlx::query(
            "SELECT sequence, state, name, provider, user_flags FROM rules WHERE rule_id = ?",
        )
        .bind(rule_id)
        .fetch_optional(conn)
        .await?
        .ok_or(StoreError::NotFound)?;
        let mut bag = PropvalBag::new();
        for &tag in proptags {
            match tag {
                PR_RULE_ID => bag.set(tag, PropValue::I8(make_local_eid(rule_id as u64) as i64)),
                PR_RULE_SEQUENCE => bag.set(tag, PropValue::Long(row.get::<i64, _>(0) as i32)),
                PR_RULE_STATE => bag.set(tag, PropValue::Long(row.get::<i64, _>(1) as i32)),
                PR_RULE_NAME => {
                    if let Some(name) = row.get::<Option<String>, _>(2) {
                        bag.set(tag, PropValue::Unicode(name));
                    }
                }
                PR_RULE_PROVIDER => bag.set(tag, PropValue::Unicode(row.get::<String, _>(3))),
                PR_RULE_USER_FLAGS => bag.set(tag, PropValue::Long(row.get::<i64, _>(4) as i32)),
                _ => {}
            }
        }
        Ok(bag)
    }

    /// Scan visible rows from `start` in the requested direction and return
    /// the position of the first row matching the restriction, with its
    /// identity bag, or -1.
    pub async fn match_table(
        &self,
        table_id: u32,
        forward: bool,
        start: u32,
        res: &Restriction,
    ) -> Result<(i32, PropvalBag)> {
        let meta = {
            let registry = self.table_registry.lock().await;
            registry.get(table_id).cloned().ok_or(StoreError::NullObject)?
        };
        if meta.kind != TableKind::Content && meta.kind != TableKind::Hierarchy {
            return Err(StoreError::NotSupported);
        }
        let tables = self.tables_pool().await?.clone();
        let order = if forward { "ASC" } else { "DESC" };
        let cmp = if forward { ">=" } else { "<=" };
        let mut conn = self.pool.acquire().await?;
        match meta.kind {
            TableKind::Content => {
                let rows = sqlx::query(&format!(
                    "SELECT idx, inst_id, row_type, inst_num, depth, count, unread, value \
                     FROM t{table_id} WHERE idx {cmp} ? ORDER BY idx {order}"
                ))
                .bind(start as i64 + 1)
                .fetch_all(&tables)
                .await?;
                for row in rows {
                    let idx: i64 = row.get(0);
                    let inst_id = row.get::<i64, _>(1) as u64;
                    let row_type: i64 = row.get(2);
                    let matched = if row_type == CONTENT_ROW_HEADER {
                        let mut bag = PropvalBag::new();
                        let depth = row.get::<i64, _>(4) as usize;
                        if let Some(sorts) = &meta.sorts {
                            if depth < sorts.ccategories {
                                if let Some(v) =
                                    decode_table_value(sorts.columns[depth].proptag, &row, 7)
                                {
                                    bag.set(base_of(sorts.columns[depth].proptag), v);
                                }
                            }
                        }
                        bag.set(
                            PR_CONTENT_COUNT,
                            PropValue::Long(row.get::<Option<i64>, _>(5).unwrap_or(0) as i32),
                        );
                        bag.set(
                            PR_CONTENT_UNREAD,
                            PropValue::Long(row.get::<Option<i64>, _>(6).unwrap_or(0) as i32),
                        );
                        res.matches(&bag)
                    } else {
                        crate::message::eval_message_restriction(self, &mut conn, inst_id, res)
                            .await?
                    };
                    if matched {
                        let bag = self
                            .content_row_bag(
                                &mut conn,
                                &meta,
                                &sqlx::query(&format!(
                                    "SELECT inst_id, row_type, row_stat, depth, count, unread, \
                                     inst_num, value, extremum FROM t{table_id} WHERE idx = ?"
                                ))
                                .bind(idx)
                                .fetch_one(&tables)
                                .await?,
                                &[PR_INST_ID, PR_INSTANCE_NUM, PR_ROW_TYPE],
                            )
                            .await?;
                        return Ok(((idx - 1) as i32, bag));
                    }
                }
            }
            TableKind::Hierarchy => {
                let rows = sqlx::query(&format!(
                    "SELECT idx, folder_id FROM t{table_id} WHERE idx {cmp} ? ORDER BY idx {order}"
                ))
                .bind(start as i64 + 1)
                .fetch_all(&tables)
                .await?;
                let mut wanted = Vec::new();
                res.proptags(&mut wanted);
                for row in rows {
                    let fid = row.get::<i64, _>(1) as u64;
                    let bag =
                        properties::get_properties(self, &mut conn, PropTable::Folder, fid, &wanted)
                            .await?;
                    if res.matches(&bag) {
                        let mut out = PropvalBag::new();
                        out.set(PR_FOLDER_ID, PropValue::I8(make_local_eid(fid) as i64));
                        return Ok(((row.get::<i64, _>(0) - 1) as i32, out));
                    }
                }
            }
            _ => unreachable!(),
        }
        Ok((-1, PropvalBag::new()))
    }

    /// Inverse positional lookup by row identity.
    pub async fn locate_table(
        &self,
        table_id: u32,
        inst_id: u64,
        inst_num: u32,
    ) -> Result<(i32, u32)> {
        let meta = {
            let registry = self.table_registry.lock().await;
            registry.get(table_id).cloned().ok_or(StoreError::NullObject)?
        };
        let tables = self.tables_pool().await?.clone();
        match meta.kind {
            TableKind::Content => {
                let raw = translate_inst_id(inst_id);
                let row = sqlx::query(&format!(
                    "SELECT idx, row_type FROM t{table_id} WHERE inst_id = ? AND inst_num = ?"
                ))
                .bind(raw as i64)
                .bind(inst_num as i64)
                .fetch_optional(&tables)
                .await?;
                Ok(match row {
                    Some(r) => (
                        r.get::<Option<i64>, _>(0).map(|i| i as i32 - 1).unwrap_or(-1),
                        r.get::<i64, _>(1) as u32,
                    ),
                    None => (-1, 0),
                })
            }
            TableKind::Hierarchy => {
                let row = sqlx::query(&format!(
                    "SELECT idx FROM t{table_id} WHERE folder_id = ?"
                ))
                .bind(gc_of(inst_id) as i64)
                .fetch_optional(&tables)
                .await?;
                Ok((
                    row.and_then(|r| r.get::<Option<i64>, _>(0))
                        .map(|i| i as i32 - 1)
                        .unwrap_or(-1),
                    0,
                ))
            }
            _ => Err(StoreError::NotSupported),
        }
    }

    /// Read one row by identity, projecting `proptags`.
    pub async fn read_table_row(
        &self,
        table_id: u32,
        proptags: &[u32],
        inst_id: u64,
        inst_num: u32,
    ) -> Result<PropvalBag> {
        let meta = {
            let registry = self.table_registry.lock().await;
            registry.get(table_id).cloned().ok_or(StoreError::NullObject)?
        };
        if meta.kind != TableKind::Content {
            return Err(StoreError::NotSupported);
        }
        let tables = self.tables_pool().await?.clone();
        let raw = translate_inst_id(inst_id);
        let row = sqlx::query(&format!(
            "SELECT inst_id, row_type, row_stat, depth, count, unread, inst_num, value, extremum \
             FROM t{table_id} WHERE inst_id = ? AND inst_num = ?"
        ))
        .bind(raw as i64)
        .bind(inst_num as i64)
        .fetch_optional(&tables)
        .await?
        .ok_or(StoreError::NotFound)?;
        let mut conn = self.pool.acquire().await?;
        self.content_row_bag(&mut conn, &meta, &row, proptags).await
    }

    /// Identity of the row at a visible position.
    pub async fn mark_table(&self, table_id: u32, position: u32) -> Result<(u64, u32, u32)> {
        let meta = {
            let registry = self.table_registry.lock().await;
            registry.get(table_id).cloned().ok_or(StoreError::NullObject)?
        };
        if meta.kind != TableKind::Content {
            return Err(StoreError::NotSupported);
        }
        let tables = self.tables_pool().await?.clone();
        let row = sqlx::query(&format!(
            "SELECT inst_id, inst_num, row_type FROM t{table_id} WHERE idx = ?"
        ))
        .bind(position as i64 + 1)
        .fetch_optional(&tables)
        .await?
        .ok_or(StoreError::NotFound)?;
        let inst_id = row.get::<i64, _>(0) as u64;
        let row_type = row.get::<i64, _>(2) as u32;
        let eid = if row_type as i64 == CONTENT_ROW_HEADER {
            make_eid(REPLID_HEADER, inst_id & !HEADER_ID_BIT)
        } else {
            make_local_eid(inst_id)
        };
        Ok((eid, row.get::<i64, _>(1) as u32, row_type))
    }

    /// Union of proptags observable through the table's rows.
    pub async fn get_table_all_proptags(&self, table_id: u32) -> Result<PropTagArray> {
        let meta = {
            let registry = self.table_registry.lock().await;
            registry.get(table_id).cloned().ok_or(StoreError::NullObject)?
        };
        let mut tags = PropTagArray::default();
        match meta.kind {
            TableKind::Content => {
                let tables = self.tables_pool().await?.clone();
                let mids: Vec<i64> = sqlx::query_scalar(&format!(
                    "SELECT inst_id FROM t{table_id} WHERE row_type = {CONTENT_ROW_MESSAGE}"
                ))
                .fetch_all(&tables)
                .await?;
                let mut conn = self.pool.acquire().await?;
                for mid in mids {
                    let stored =
                        properties::all_proptags(&mut conn, PropTable::Message, mid as u64).await?;
                    for tag in stored.0 {
                        tags.append_unique(tag);
                    }
                }
                for tag in [PR_INST_ID, PR_INSTANCE_NUM, PR_ROW_TYPE, PR_DEPTH, PR_CONTENT_COUNT,
                    PR_CONTENT_UNREAD]
                {
                    tags.append_unique(tag);
                }
            }
            TableKind::Hierarchy => {
                let tables = self.tables_pool().await?.clone();
                let fids: Vec<i64> =
                    sqlx::query_scalar(&format!("SELECT folder_id FROM t{table_id}"))
                        .fetch_all(&tables)
                        .await?;
                let mut conn = self.pool.acquire().await?;
                for fid in fids {
                    let stored =
                        properties::all_proptags(&mut conn, PropTable::Folder, fid as u64).await?;
                    for tag in stored.0 {
                        tags.append_unique(tag);
                    }
                }
                tags.append_unique(PR_FOLDER_ID);
                tags.append_unique(PR_DEPTH);
            }
            TableKind::Permission => {
                for tag in [PR_MEMBER_ID, PR_MEMBER_NAME, PR_MEMBER_RIGHTS] {
                    tags.append_unique(tag);
                }
            }
            TableKind::Rule => {
                for tag in [PR_RULE_ID, PR_RULE_SEQUENCE, PR_RULE_STATE, PR_RULE_NAME,
                    PR_RULE_PROVIDER, PR_RULE_USER_FLAGS]
                {
                    tags.append_unique(tag);
                }
            }
        }
        Ok(tags)
    }
}

/// Header inst ids arrive as replid-2 EIDs; message rows as local EIDs.
pub(crate) fn translate_inst_id(inst_id: u64) -> u64 {
    if replid_of(inst_id) == REPLID_HEADER {
        gc_of(inst_id) | HEADER_ID_BIT
    } else {
        gc_of(inst_id)
    }
}

fn base_of(proptag: u32) -> u32 {
    make_proptag(prop_id(proptag), prop_type(proptag) & !MVI_FLAG)
}
