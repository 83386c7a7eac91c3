// SPDX-License-Identifier: MIT
//! Property row storage shared by store, folder, message, attachment and
//! recipient objects.
//!
//! Scalar values live natively in the dynamically-typed `propval` column so
//! SQL can index and order them; multi-value payloads are stored as JSON
//! text. A handful of large-blob tags (bodies, HTML, RTF, transport headers,
//! attachment data) are stored out-of-line in the content-id store with the
//! cid in the column.

use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::blob;
use crate::error::{Result, StoreError};
use crate::ids::make_local_eid;
use crate::props::*;

use super::DbHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropTable {
    Store,
    Folder,
    Message,
    Attachment,
    Recipient,
}

impl PropTable {
    pub fn table(&self) -> &'static str {
        match self {
            PropTable::Store => "store_properties",
            PropTable::Folder => "folder_properties",
            PropTable::Message => "message_properties",
            PropTable::Attachment => "attachment_properties",
            PropTable::Recipient => "recipients_properties",
        }
    }

    fn id_col(&self) -> Option<&'static str> {
        match self {
            PropTable::Store => None,
            PropTable::Folder => Some("folder_id"),
            PropTable::Message => Some("message_id"),
            PropTable::Attachment => Some("attachment_id"),
            PropTable::Recipient => Some("recipient_id"),
        }
    }
}

/// Is this tag stored out-of-line in the cid blob store?
pub fn is_cid_tag(table: PropTable, proptag: u32) -> bool {
    match table {
        PropTable::Message => matches!(
            proptag,
            PR_BODY | PR_BODY_A | PR_HTML | PR_RTF_COMPRESSED | PR_TRANSPORT_MESSAGE_HEADERS
                | PR_TRANSPORT_MESSAGE_HEADERS_A
        ),
        PropTable::Attachment => matches!(proptag, PR_ATTACH_DATA_BIN | PR_ATTACH_DATA_OBJ),
        _ => false,
    }
}

/// cid blobs for text-typed tags carry a 4-byte codepage prefix.
fn cid_is_text(proptag: u32) -> bool {
    matches!(
        proptag,
        PR_BODY | PR_BODY_A | PR_TRANSPORT_MESSAGE_HEADERS | PR_TRANSPORT_MESSAGE_HEADERS_A
    )
}

/// The SQLite cell a property value maps to.
pub(crate) enum Cell {
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Bind a property value as its native SQLite cell.
pub(crate) fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &PropValue,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>> {
    Ok(match to_cell(value)? {
        Cell::Int(v) => q.bind(v),
        Cell::Real(v) => q.bind(v),
        Cell::Text(v) => q.bind(v),
        Cell::Blob(v) => q.bind(v),
    })
}

pub(crate) fn to_cell(value: &PropValue) -> Result<Cell> {
    Ok(match value {
        PropValue::Short(v) => Cell::Int(*v as i64),
        PropValue::Long(v) => Cell::Int(*v as i64),
        PropValue::Currency(v) | PropValue::I8(v) => Cell::Int(*v),
        PropValue::Bool(v) => Cell::Int(*v as i64),
        PropValue::SysTime(v) => Cell::Int(*v as i64),
        PropValue::Float(v) => Cell::Real(*v as f64),
        PropValue::Double(v) | PropValue::AppTime(v) => Cell::Real(*v),
        PropValue::Unicode(s) | PropValue::String8(s) => Cell::Text(s.clone()),
        PropValue::Binary(b) | PropValue::SvrEid(b) | PropValue::Object(b) => Cell::Blob(b.clone()),
        PropValue::Guid(g) => Cell::Blob(g.as_bytes().to_vec()),
        mv => Cell::Text(serde_json::to_string(mv).map_err(|_| StoreError::OutOfMemory)?),
    })
}

/// Decode a `propval` column according to the tag's declared type.
pub fn decode_cell(proptag: u32, row: &sqlx::sqlite::SqliteRow, idx: usize) -> Option<PropValue> {
    let ptype = prop_type(proptag);
    if ptype & MV_FLAG != 0 {
        let text: Option<String> = row.try_get(idx).ok()?;
        return serde_json::from_str(&text?).ok();
    }
    match ptype {
        PT_SHORT => row.try_get::<Option<i64>, _>(idx).ok()?.map(|v| PropValue::Short(v as i16)),
        PT_LONG => row.try_get::<Option<i64>, _>(idx).ok()?.map(|v| PropValue::Long(v as i32)),
        PT_CURRENCY => row.try_get::<Option<i64>, _>(idx).ok()?.map(PropValue::Currency),
        PT_I8 => row.try_get::<Option<i64>, _>(idx).ok()?.map(PropValue::I8),
        PT_BOOLEAN => row.try_get::<Option<i64>, _>(idx).ok()?.map(|v| PropValue::Bool(v != 0)),
        PT_SYSTIME => row.try_get::<Option<i64>, _>(idx).ok()?.map(|v| PropValue::SysTime(v as u64)),
        PT_FLOAT => row.try_get::<Option<f64>, _>(idx).ok()?.map(|v| PropValue::Float(v as f32)),
        PT_DOUBLE => row.try_get::<Option<f64>, _>(idx).ok()?.map(PropValue::Double),
        PT_APPTIME => row.try_get::<Option<f64>, _>(idx).ok()?.map(PropValue::AppTime),
        PT_UNICODE => row.try_get::<Option<String>, _>(idx).ok()?.map(PropValue::Unicode),
        PT_STRING8 => row.try_get::<Option<String>, _>(idx).ok()?.map(PropValue::String8),
        PT_CLSID => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()?
            .and_then(|b| Uuid::from_slice(&b).ok())
            .map(PropValue::Guid),
        PT_SVREID => row.try_get::<Option<Vec<u8>>, _>(idx).ok()?.map(PropValue::SvrEid),
        PT_OBJECT => row.try_get::<Option<Vec<u8>>, _>(idx).ok()?.map(PropValue::Object),
        _ => row.try_get::<Option<Vec<u8>>, _>(idx).ok()?.map(PropValue::Binary),
    }
}

async fn fetch_raw(
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
) -> Result<Option<PropValue>> {
    let row = match table.id_col() {
        Some(col) => {
            let sql = format!(
                "SELECT propval FROM {} WHERE {} = ? AND proptag = ?",
                table.table(),
                col
            );
            sqlx::query(&sql)
                .bind(id as i64)
                .bind(proptag as i64)
                .fetch_optional(conn)
                .await?
        }
        None => {
            sqlx::query("SELECT propval FROM store_properties WHERE proptag = ?")
                .bind(proptag as i64)
                .fetch_optional(conn)
                .await?
        }
    };
    Ok(row.and_then(|r| decode_cell(proptag, &r, 0)))
}

async fn fetch_cid(
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
) -> Result<Option<i64>> {
    let col = table.id_col().unwrap();
    let sql = format!(
        "SELECT propval FROM {} WHERE {} = ? AND proptag = ?",
        table.table(),
        col
    );
    let row = sqlx::query(&sql)
        .bind(id as i64)
        .bind(proptag as i64)
        .fetch_optional(conn)
        .await?;
    Ok(row.and_then(|r| r.try_get::<Option<i64>, _>(0).ok().flatten()))
}

/// Fetch one property, resolving cid indirection and computed tags.
pub async fn get_property(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
) -> Result<Option<PropValue>> {
    if let Some(v) = computed_property(handle, conn, table, id, proptag).await? {
        return Ok(Some(v));
    }
    if is_cid_tag(table, proptag) {
        let Some(cid) = fetch_cid(conn, table, id, proptag).await? else {
            return Ok(None);
        };
        let data = blob::read_blob(&handle.dir, cid as u64).await?;
        let Some(data) = data else { return Ok(None) };
        return Ok(Some(if cid_is_text(proptag) {
            let text = blob::strip_text_prefix(&data);
            if prop_type(proptag) == PT_STRING8 {
                PropValue::String8(text)
            } else {
                PropValue::Unicode(text)
            }
        } else {
            PropValue::Binary(data)
        }));
    }
    // Tolerate the sibling codepage variant for strings.
    if let Some(v) = fetch_raw(conn, table, id, proptag).await? {
        return Ok(Some(v));
    }
    match prop_type(proptag) {
        PT_UNICODE => fetch_raw(conn, table, id, retag(proptag, PT_STRING8)).await,
        PT_STRING8 => fetch_raw(conn, table, id, retag(proptag, PT_UNICODE)).await,
        _ => Ok(None),
    }
}

pub async fn get_properties(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptags: &[u32],
) -> Result<PropvalBag> {
    let mut bag = PropvalBag::new();
    for &tag in proptags {
        if let Some(v) = get_property(handle, conn, table, id, tag).await? {
            bag.set(tag, v);
        }
    }
    Ok(bag)
}

/// All stored proptags of an object (computed tags not included).
pub async fn all_proptags(
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
) -> Result<PropTagArray> {
    let rows = match table.id_col() {
        Some(col) => {
            let sql = format!("SELECT proptag FROM {} WHERE {} = ?", table.table(), col);
            sqlx::query(&sql).bind(id as i64).fetch_all(conn).await?
        }
        None => {
            sqlx::query("SELECT proptag FROM store_properties")
                .fetch_all(conn)
                .await?
        }
    };
    let mut tags = PropTagArray::default();
    for row in rows {
        tags.append_unique(row.get::<i64, _>(0) as u32);
    }
    Ok(tags)
}

/// Write one property row. String writes clear the sibling codepage variant
/// first so an object never carries both encodings of one id.
pub async fn set_property(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
    value: &PropValue,
) -> Result<()> {
    match prop_type(proptag) {
        PT_UNICODE => remove_property(conn, table, id, retag(proptag, PT_STRING8)).await?,
        PT_STRING8 => remove_property(conn, table, id, retag(proptag, PT_UNICODE)).await?,
        _ => {}
    }
    if is_cid_tag(table, proptag) {
        let bytes = match value {
            PropValue::Unicode(s) | PropValue::String8(s) if cid_is_text(proptag) => {
                blob::frame_text(s)
            }
            v => v
                .as_bytes()
                .map(|b| b.to_vec())
                .or_else(|| v.as_str().map(|s| blob::frame_text(s)))
                .ok_or(StoreError::InvalidParam("blob tag requires bytes or text"))?,
        };
        let cid = handle.allocate_cid(conn).await?;
        blob::write_blob(&handle.dir, cid, &bytes).await?;
        return upsert_cell(conn, table, id, proptag, Cell::Int(cid as i64)).await;
    }
    upsert_cell(conn, table, id, proptag, to_cell(value)?).await
}

async fn upsert_cell(
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
    cell: Cell,
) -> Result<()> {
    let sql = match table.id_col() {
        Some(col) => format!(
            "REPLACE INTO {} ({}, proptag, propval) VALUES (?, ?, ?)",
            table.table(),
            col
        ),
        None => "REPLACE INTO store_properties (proptag, propval) VALUES (?, ?)".to_string(),
    };
    let mut q = sqlx::query(&sql);
    if table.id_col().is_some() {
        q = q.bind(id as i64);
    }
    q = q.bind(proptag as i64);
    q = match cell {
        Cell::Int(v) => q.bind(v),
        Cell::Real(v) => q.bind(v),
        Cell::Text(v) => q.bind(v),
        Cell::Blob(v) => q.bind(v),
    };
    q.execute(conn).await?;
    Ok(())
}

pub async fn set_properties(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    bag: &PropvalBag,
) -> Result<()> {
    for (tag, value) in bag.iter() {
        set_property(handle, conn, table, id, tag, value).await?;
    }
    Ok(())
}

pub async fn remove_property(
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
) -> Result<()> {
    match table.id_col() {
        Some(col) => {
            let sql = format!(
                "DELETE FROM {} WHERE {} = ? AND proptag = ?",
                table.table(),
                col
            );
            sqlx::query(&sql)
                .bind(id as i64)
                .bind(proptag as i64)
                .execute(conn)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM store_properties WHERE proptag = ?")
                .bind(proptag as i64)
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

/// The write contract applied to every folder/message mutation: bump the
/// row's change number, append the XID to PR_CHANGE_KEY, merge it into the
/// predecessor change list, rewrite PR_LAST_MODIFICATION_TIME.
pub async fn stamp_change(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    cn: u64,
) -> Result<()> {
    let (row_table, id_col) = match table {
        PropTable::Folder => ("folders", "folder_id"),
        PropTable::Message => ("messages", "message_id"),
        _ => return Err(StoreError::InvalidParam("change stamp on non-syncable object")),
    };
    let sql = format!("UPDATE {row_table} SET change_number = ? WHERE {id_col} = ?");
    sqlx::query(&sql)
        .bind(cn as i64)
        .bind(id as i64)
        .execute(&mut *conn)
        .await?;
    let xid = crate::props::pcl::Xid::new(handle.mailbox_guid, cn);
    set_property(
        handle,
        conn,
        table,
        id,
        PR_CHANGE_KEY,
        &PropValue::Binary(xid.to_source_key()),
    )
    .await?;
    let existing = fetch_raw(conn, table, id, PR_PREDECESSOR_CHANGE_LIST).await?;
    let merged = crate::props::pcl::pcl_append(
        existing.as_ref().and_then(|v| v.as_bytes()),
        xid,
    )?;
    set_property(
        handle,
        conn,
        table,
        id,
        PR_PREDECESSOR_CHANGE_LIST,
        &PropValue::Binary(merged),
    )
    .await?;
    set_property(
        handle,
        conn,
        table,
        id,
        PR_LAST_MODIFICATION_TIME,
        &PropValue::SysTime(nttime_now()),
    )
    .await?;
    Ok(())
}

/// Stamp the parent folder's LOCAL_COMMIT_TIME_MAX after a content mutation.
pub async fn touch_folder_commit_time(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    folder_id: u64,
) -> Result<()> {
    set_property(
        handle,
        conn,
        PropTable::Folder,
        folder_id,
        PR_LOCAL_COMMIT_TIME_MAX,
        &PropValue::SysTime(nttime_now()),
    )
    .await
}

// ─── Computed properties ─────────────────────────────────────────────────────

async fn computed_property(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    table: PropTable,
    id: u64,
    proptag: u32,
) -> Result<Option<PropValue>> {
    match table {
        PropTable::Message => computed_message_property(handle, conn, id, proptag).await,
        PropTable::Folder => computed_folder_property(handle, conn, id, proptag).await,
        PropTable::Store => computed_store_property(handle, conn, proptag).await,
        _ => Ok(None),
    }
}

async fn computed_message_property(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    mid: u64,
    proptag: u32,
) -> Result<Option<PropValue>> {
    match proptag {
        PR_MID => Ok(Some(PropValue::I8(make_local_eid(mid) as i64))),
        PR_PARENT_FOLDER_ID | PR_CHANGE_NUMBER | PR_MESSAGE_SIZE | PR_MESSAGE_SIZE_EXTENDED
        | PR_READ | PR_HASATTACH | PR_MESSAGE_FLAGS => {
            let row = sqlx::query(
                "SELECT parent_fid, change_number, message_size, read_state FROM messages \
                 WHERE message_id = ?",
            )
            .bind(mid as i64)
            .fetch_optional(&mut *conn)
            .await?;
            let Some(row) = row else { return Ok(None) };
            match proptag {
                PR_PARENT_FOLDER_ID => Ok(row
                    .get::<Option<i64>, _>(0)
                    .map(|fid| PropValue::I8(make_local_eid(fid as u64) as i64))),
                PR_CHANGE_NUMBER => Ok(Some(PropValue::I8(
                    make_local_eid(row.get::<i64, _>(1) as u64) as i64,
                ))),
                PR_MESSAGE_SIZE => Ok(Some(PropValue::Long(row.get::<i64, _>(2) as i32))),
                PR_MESSAGE_SIZE_EXTENDED => Ok(Some(PropValue::I8(row.get::<i64, _>(2)))),
                PR_READ => Ok(Some(PropValue::Bool(row.get::<i64, _>(3) != 0))),
                PR_HASATTACH => {
                    let n: i64 =
                        sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE message_id = ?")
                            .bind(mid as i64)
                            .fetch_one(conn)
                            .await?;
                    Ok(Some(PropValue::Bool(n > 0)))
                }
                PR_MESSAGE_FLAGS => {
                    let stored = fetch_raw(conn, PropTable::Message, mid, PR_MESSAGE_FLAGS)
                        .await?
                        .and_then(|v| v.as_int())
                        .unwrap_or(0) as u32;
                    let read = row.get::<i64, _>(3) != 0;
                    let flags = if read { stored | MSGFLAG_READ } else { stored & !MSGFLAG_READ };
                    Ok(Some(PropValue::Long(flags as i32)))
                }
                _ => unreachable!(),
            }
        }
        PR_DISPLAY_TO | PR_DISPLAY_CC | PR_DISPLAY_BCC => {
            let wanted = match proptag {
                PR_DISPLAY_TO => RECIPIENT_TYPE_TO,
                PR_DISPLAY_CC => RECIPIENT_TYPE_CC,
                _ => RECIPIENT_TYPE_BCC,
            };
            Ok(Some(PropValue::Unicode(
                display_recipients(handle, conn, mid, wanted).await?,
            )))
        }
        PR_SUBJECT => {
            if let Some(v) = fetch_raw(conn, PropTable::Message, mid, PR_SUBJECT).await? {
                return Ok(Some(v));
            }
            let prefix = fetch_raw(conn, PropTable::Message, mid, PR_SUBJECT_PREFIX).await?;
            let normalized = fetch_raw(conn, PropTable::Message, mid, PR_NORMALIZED_SUBJECT).await?;
            match (prefix, normalized) {
                (Some(p), Some(n)) => Ok(Some(PropValue::Unicode(format!(
                    "{}{}",
                    p.as_str().unwrap_or(""),
                    n.as_str().unwrap_or("")
                )))),
                (None, Some(n)) => Ok(Some(n)),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

async fn display_recipients(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    mid: u64,
    wanted: u32,
) -> Result<String> {
    let rcpt_ids: Vec<i64> =
        sqlx::query_scalar("SELECT recipient_id FROM recipients WHERE message_id = ? ORDER BY recipient_id")
            .bind(mid as i64)
            .fetch_all(&mut *conn)
            .await?;
    let mut names = Vec::new();
    for rid in rcpt_ids {
        let rtype = Box::pin(get_property(
            handle,
            conn,
            PropTable::Recipient,
            rid as u64,
            PR_RECIPIENT_TYPE,
        ))
        .await?
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u32;
        if rtype != wanted {
            continue;
        }
        let name = match Box::pin(get_property(
            handle,
            conn,
            PropTable::Recipient,
            rid as u64,
            PR_DISPLAY_NAME,
        ))
        .await?
        {
            Some(v) => v.as_str().map(|s| s.to_string()),
            None => Box::pin(get_property(
                handle,
                conn,
                PropTable::Recipient,
                rid as u64,
                PR_SMTP_ADDRESS,
            ))
            .await?
            .and_then(|v| v.as_str().map(|s| s.to_string())),
        };
        if let Some(name) = name {
            names.push(name);
        }
    }
    Ok(names.join("; "))
}

async fn computed_folder_property(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    fid: u64,
    proptag: u32,
) -> Result<Option<PropValue>> {
    match proptag {
        PR_FOLDER_ID => Ok(Some(PropValue::I8(make_local_eid(fid) as i64))),
        PR_PARENT_FOLDER_ID | PR_CHANGE_NUMBER | PR_FOLDER_TYPE => {
            let row = sqlx::query(
                "SELECT parent_id, change_number, is_search FROM folders WHERE folder_id = ?",
            )
            .bind(fid as i64)
            .fetch_optional(&mut *conn)
            .await?;
            let Some(row) = row else { return Ok(None) };
            match proptag {
                PR_PARENT_FOLDER_ID => Ok(row
                    .get::<Option<i64>, _>(0)
                    .map(|p| PropValue::I8(make_local_eid(p as u64) as i64))),
                PR_CHANGE_NUMBER => Ok(Some(PropValue::I8(
                    make_local_eid(row.get::<i64, _>(1) as u64) as i64,
                ))),
                PR_FOLDER_TYPE => Ok(Some(PropValue::Long(if row.get::<i64, _>(2) != 0 {
                    2
                } else {
                    1
                }))),
                _ => unreachable!(),
            }
        }
        PR_CONTENT_COUNT | PR_ASSOC_CONTENT_COUNT => {
            let assoc = (proptag == PR_ASSOC_CONTENT_COUNT) as i64;
            let n: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM messages WHERE parent_fid = ? AND is_associated = ? \
                 AND is_deleted = 0",
            )
            .bind(fid as i64)
            .bind(assoc)
            .fetch_one(conn)
            .await?;
            Ok(Some(PropValue::Long(n as i32)))
        }
        PR_CONTENT_UNREAD => {
            let n: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM messages WHERE parent_fid = ? AND is_associated = 0 \
                 AND is_deleted = 0 AND read_state = 0",
            )
            .bind(fid as i64)
            .fetch_one(conn)
            .await?;
            Ok(Some(PropValue::Long(n as i32)))
        }
        PR_SUBFOLDERS => {
            let n: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM folders WHERE parent_id = ? AND is_deleted = 0",
            )
            .bind(fid as i64)
            .fetch_one(conn)
            .await?;
            Ok(Some(PropValue::Bool(n > 0)))
        }
        PR_SOURCE_KEY => {
            if let Some(v) = fetch_raw(conn, PropTable::Folder, fid, PR_SOURCE_KEY).await? {
                return Ok(Some(v));
            }
            Ok(Some(PropValue::Binary(
                crate::props::pcl::Xid::new(handle.mailbox_guid, fid).to_source_key(),
            )))
        }
        _ => Ok(None),
    }
}

async fn computed_store_property(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    proptag: u32,
) -> Result<Option<PropValue>> {
    match proptag {
        PR_MESSAGE_SIZE_EXTENDED => {
            Ok(Some(PropValue::I8(handle.store_size(conn).await? as i64)))
        }
        _ => Ok(None),
    }
}
