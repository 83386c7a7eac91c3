// SPDX-License-Identifier: MIT
//! Content-id blob store: `<dir>/cid/<id>`.
//!
//! Blobs are append-only — a rewrite of a cid-backed property allocates a
//! fresh cid and leaves the old file for the sweeper, which deletes files no
//! property row references anymore. Text-typed blobs carry a 4-byte
//! little-endian codepage prefix; the reader skips it.

use std::collections::HashSet;
use std::path::Path;

use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use crate::error::Result;
use crate::props::{PR_ATTACH_DATA_BIN, PR_ATTACH_DATA_OBJ};

/// Codepage marker written ahead of UTF-8 text blobs (65001 = UTF-8).
const CP_UTF8: u32 = 65001;

pub fn blob_path(dir: &Path, cid: u64) -> std::path::PathBuf {
    dir.join("cid").join(cid.to_string())
}

/// Prefix UTF-8 text with its codepage marker.
pub fn frame_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + text.len());
    out.extend_from_slice(&CP_UTF8.to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out
}

/// Drop the 4-byte codepage prefix and return the text.
pub fn strip_text_prefix(data: &[u8]) -> String {
    let body = if data.len() >= 4 { &data[4..] } else { data };
    String::from_utf8_lossy(body).into_owned()
}

pub async fn write_blob(dir: &Path, cid: u64, data: &[u8]) -> Result<()> {
    let path = blob_path(dir, cid);
    tokio::fs::write(&path, data).await?;
    Ok(())
}

pub async fn read_blob(dir: &Path, cid: u64) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(blob_path(dir, cid)).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete blob files with no remaining reference from any property row.
/// Deletion is deferred to this sweeper precisely so that readers holding a
/// cid across a property rewrite never observe a vanished file mid-call.
pub async fn sweep_unreferenced(dir: &Path, conn: &mut SqliteConnection) -> Result<u64> {
    let mut live: HashSet<u64> = HashSet::new();
    for (table, filter) in [
        (
            "message_properties",
            format!(
                "proptag IN ({}, {}, {}, {}, {}, {})",
                crate::props::PR_BODY,
                crate::props::PR_BODY_A,
                crate::props::PR_HTML,
                crate::props::PR_RTF_COMPRESSED,
                crate::props::PR_TRANSPORT_MESSAGE_HEADERS,
                crate::props::PR_TRANSPORT_MESSAGE_HEADERS_A
            ),
        ),
        (
            "attachment_properties",
            format!("proptag IN ({PR_ATTACH_DATA_BIN}, {PR_ATTACH_DATA_OBJ})"),
        ),
    ] {
        let sql = format!("SELECT propval FROM {table} WHERE {filter}");
        for row in sqlx::query(&sql).fetch_all(&mut *conn).await? {
            if let Ok(Some(cid)) = row.try_get::<Option<i64>, _>(0) {
                live.insert(cid as u64);
            }
        }
    }
    let mut removed = 0u64;
    let cid_dir = dir.join("cid");
    let mut entries = match tokio::fs::read_dir(&cid_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Some(cid) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        if live.contains(&cid) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(cid, err = %e, "blob sweep: remove failed"),
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "blob sweep complete");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_framing() {
        let framed = frame_text("hello");
        assert_eq!(&framed[..4], &CP_UTF8.to_le_bytes());
        assert_eq!(strip_text_prefix(&framed), "hello");
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("cid")).await.unwrap();
        write_blob(dir.path(), 7, b"payload").await.unwrap();
        assert_eq!(read_blob(dir.path(), 7).await.unwrap().unwrap(), b"payload");
        assert!(read_blob(dir.path(), 8).await.unwrap().is_none());
    }
}
