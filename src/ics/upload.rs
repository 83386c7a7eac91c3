// SPDX-License-Identifier: MIT
//! ICS upload: importing client-side message and folder changes.
//!
//! Every import carries the header quartet — SOURCE_KEY, LAST_MODIFICATION_TIME,
//! CHANGE_KEY, PREDECESSOR_CHANGE_LIST. The SOURCE_KEY resolves through the
//! replica mapping to a local id; the PCL comparison decides between
//! accept, ignore and conflict.

use tracing::debug;

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::folder::{self, CUSTOM_EID_BEGIN};
use crate::message::{self, MessageContent};
use crate::props::pcl::{Pcl, PclCompare, Xid};
use crate::props::*;

pub const IMPORT_FLAG_ASSOCIATED: u32 = 0x10;
pub const IMPORT_FLAG_FAIL_ON_CONFLICT: u32 = 0x40;

/// The four header properties every upload must carry.
#[derive(Debug, Clone)]
pub struct ImportHeader {
    pub source_key: Vec<u8>,
    pub last_modification_time: u64,
    pub change_key: Vec<u8>,
    pub predecessor_change_list: Vec<u8>,
}

impl ImportHeader {
    pub fn from_bag(bag: &PropvalBag) -> Result<Self> {
        let get_bin = |tag: u32| -> Result<Vec<u8>> {
            bag.get(tag)
                .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
                .ok_or(StoreError::InvalidParam("missing import header property"))
        };
        Ok(ImportHeader {
            source_key: get_bin(PR_SOURCE_KEY)?,
            last_modification_time: bag
                .get(PR_LAST_MODIFICATION_TIME)
                .and_then(|v| v.as_int())
                .ok_or(StoreError::InvalidParam("missing import header property"))?
                as u64,
            change_key: get_bin(PR_CHANGE_KEY)?,
            predecessor_change_list: get_bin(PR_PREDECESSOR_CHANGE_LIST)?,
        })
    }
}

impl DbHandle {
    /// Resolve an upload SOURCE_KEY to a local object id. The GUID must be
    /// the mailbox's own or a registered replica.
    async fn resolve_source_key(
        &self,
        conn: &mut sqlx::SqliteConnection,
        source_key: &[u8],
    ) -> Result<u64> {
        let xid = Xid::from_source_key(source_key)?;
        if xid.guid == self.mailbox_guid {
            return Ok(xid.counter);
        }
        let replid = self.get_or_create_replid(conn, xid.guid).await?;
        Ok(crate::ids::gc_of(xid.counter) | ((replid as u64) << 48))
    }

    /// Import one message change. Creates the message when the SOURCE_KEY is
    /// new; otherwise runs the PCL comparison against the stored version.
    /// Returns the local mid for the caller to open as a writable instance.
    pub async fn import_message_change(
        &self,
        username: &str,
        folder_id: u64,
        import_flags: u32,
        header: &ImportHeader,
        content: &MessageContent,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        if !folder::folder_exists(&mut tx, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        let rights = folder::folder_rights(self, &mut tx, folder_id, username).await?;
        if rights & (RIGHTS_CREATE | RIGHTS_OWNER) == 0 {
            return Err(StoreError::AccessDenied);
        }
        let mid = self.resolve_source_key(&mut tx, &header.source_key).await?;
        let incoming_pcl = Pcl::parse(&header.predecessor_change_list)?;
        let existing = message::message_row(&mut tx, mid).await?;
        if let Some(row) = &existing {
            if row.parent_fid != Some(folder_id) {
                return Err(StoreError::NotFound);
            }
            let stored_blob = properties::get_property(
                self,
                &mut tx,
                PropTable::Message,
                mid,
                PR_PREDECESSOR_CHANGE_LIST,
            )
            .await?;
            let stored_pcl = match stored_blob.as_ref().and_then(|v| v.as_bytes()) {
                Some(blob) => Pcl::parse(blob)?,
                None => Pcl::new(),
            };
            match stored_pcl.compare(&incoming_pcl) {
                PclCompare::Include | PclCompare::Equal => {
                    // Stored history dominates: the client re-sent something
                    // the store already has.
                    return Err(StoreError::SyncIgnore);
                }
                PclCompare::Conflict => {
                    if import_flags & IMPORT_FLAG_FAIL_ON_CONFLICT != 0 {
                        return Err(StoreError::SyncConflict);
                    }
                }
                PclCompare::Included => {}
            }
        }
        let mut msg = content.clone();
        msg.proplist
            .set(PR_MID, PropValue::I8(crate::ids::make_local_eid(mid) as i64));
        if import_flags & IMPORT_FLAG_ASSOCIATED != 0 {
            let flags = msg
                .proplist
                .get(PR_MESSAGE_FLAGS)
                .and_then(|v| v.as_int())
                .unwrap_or(0) as u32;
            msg.proplist.set(
                PR_MESSAGE_FLAGS,
                PropValue::Long((flags | MSGFLAG_ASSOCIATED) as i32),
            );
        }
        let outcome = message::write_message_tx(self, &mut tx, Some(folder_id), None, &msg).await?;
        // The accepted header quartet overrides the stamp the write applied;
        // the incoming PCL merges with whatever was stored.
        properties::set_property(
            self,
            &mut tx,
            PropTable::Message,
            mid,
            PR_SOURCE_KEY,
            &PropValue::Binary(header.source_key.clone()),
        )
        .await?;
        properties::set_property(
            self,
            &mut tx,
            PropTable::Message,
            mid,
            PR_CHANGE_KEY,
            &PropValue::Binary(header.change_key.clone()),
        )
        .await?;
        properties::set_property(
            self,
            &mut tx,
            PropTable::Message,
            mid,
            PR_LAST_MODIFICATION_TIME,
            &PropValue::SysTime(header.last_modification_time),
        )
        .await?;
        let stored_blob = properties::get_property(
            self,
            &mut tx,
            PropTable::Message,
            mid,
            PR_PREDECESSOR_CHANGE_LIST,
        )
        .await?;
        let mut merged = match stored_blob.as_ref().and_then(|v| v.as_bytes()) {
            Some(blob) => Pcl::parse(blob)?,
            None => Pcl::new(),
        };
        merged.merge(&incoming_pcl);
        properties::set_property(
            self,
            &mut tx,
            PropTable::Message,
            mid,
            PR_PREDECESSOR_CHANGE_LIST,
            &PropValue::Binary(merged.serialize()),
        )
        .await?;
        tx.commit().await?;
        self.touch();
        debug!(
            mid,
            folder_id,
            created = existing.is_none(),
            source_key = %hex::encode(&header.source_key),
            "imported message change"
        );
        Ok(outcome.message_id)
    }

    /// Import one folder change: create under the parent, or rename/move an
    /// existing folder after the PCL check.
    pub async fn import_folder_change(
        &self,
        username: &str,
        parent_source_key: &[u8],
        header: &ImportHeader,
        display_name: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let parent_fid = self.resolve_source_key(&mut tx, parent_source_key).await?;
        if !folder::folder_exists(&mut tx, parent_fid).await? {
            return Err(StoreError::NotFound);
        }
        let fid = self.resolve_source_key(&mut tx, &header.source_key).await?;
        let incoming_pcl = Pcl::parse(&header.predecessor_change_list)?;
        let exists = folder::folder_exists(&mut tx, fid).await?;
        if !exists {
            let rights = folder::folder_rights(self, &mut tx, parent_fid, username).await?;
            if rights & (RIGHTS_CREATE_SUBFOLDER | RIGHTS_OWNER) == 0 {
                return Err(StoreError::AccessDenied);
            }
            let new_fid = self
                .create_folder_in_tx(&mut tx, Some(fid), parent_fid, display_name, None)
                .await?;
            self.apply_folder_header(&mut tx, new_fid, header, &incoming_pcl)
                .await?;
            tx.commit().await?;
            self.touch();
            return Ok(new_fid);
        }
        let rights = folder::folder_rights(self, &mut tx, fid, username).await?;
        if rights & RIGHTS_OWNER == 0 {
            return Err(StoreError::AccessDenied);
        }
        let stored_blob = properties::get_property(
            self,
            &mut tx,
            PropTable::Folder,
            fid,
            PR_PREDECESSOR_CHANGE_LIST,
        )
        .await?;
        let stored_pcl = match stored_blob.as_ref().and_then(|v| v.as_bytes()) {
            Some(blob) => Pcl::parse(blob)?,
            None => Pcl::new(),
        };
        match stored_pcl.compare(&incoming_pcl) {
            PclCompare::Include | PclCompare::Equal => return Err(StoreError::SyncIgnore),
            PclCompare::Conflict | PclCompare::Included => {}
        }
        let current_parent = folder::folder_parent(&mut tx, fid).await?;
        if current_parent != Some(parent_fid) {
            if !self.private {
                return Err(StoreError::NotSupported);
            }
            if fid < CUSTOM_EID_BEGIN {
                return Err(StoreError::AccessDenied);
            }
            if folder::is_descendant(&mut tx, parent_fid, fid).await? {
                return Err(StoreError::InvalidParam("cannot move folder under itself"));
            }
            sqlx::query("UPDATE folders SET parent_id = ? WHERE folder_id = ?")
                .bind(parent_fid as i64)
                .bind(fid as i64)
                .execute(&mut *tx)
                .await?;
        }
        properties::set_property(
            self,
            &mut tx,
            PropTable::Folder,
            fid,
            PR_DISPLAY_NAME,
            &PropValue::Unicode(display_name.to_string()),
        )
        .await?;
        self.apply_folder_header(&mut tx, fid, header, &incoming_pcl).await?;
        tx.commit().await?;
        self.touch();
        Ok(fid)
    }

    async fn apply_folder_header(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        fid: u64,
        header: &ImportHeader,
        incoming_pcl: &Pcl,
    ) -> Result<()> {
        let cn = self.allocate_cn(&mut *tx).await?;
        sqlx::query("UPDATE folders SET change_number = ? WHERE folder_id = ?")
            .bind(cn as i64)
            .bind(fid as i64)
            .execute(&mut **tx)
            .await?;
        properties::set_property(
            self,
            &mut *tx,
            PropTable::Folder,
            fid,
            PR_SOURCE_KEY,
            &PropValue::Binary(header.source_key.clone()),
        )
        .await?;
        properties::set_property(
            self,
            &mut *tx,
            PropTable::Folder,
            fid,
            PR_CHANGE_KEY,
            &PropValue::Binary(header.change_key.clone()),
        )
        .await?;
        properties::set_property(
            self,
            &mut *tx,
            PropTable::Folder,
            fid,
            PR_LAST_MODIFICATION_TIME,
            &PropValue::SysTime(header.last_modification_time),
        )
        .await?;
        let stored = properties::get_property(
            self,
            &mut *tx,
            PropTable::Folder,
            fid,
            PR_PREDECESSOR_CHANGE_LIST,
        )
        .await?;
        let mut merged = match stored.as_ref().and_then(|v| v.as_bytes()) {
            Some(blob) => Pcl::parse(blob)?,
            None => Pcl::new(),
        };
        merged.merge(incoming_pcl);
        merged.append(Xid::new(self.mailbox_guid, cn));
        properties::set_property(
            self,
            &mut *tx,
            PropTable::Folder,
            fid,
            PR_PREDECESSOR_CHANGE_LIST,
            &PropValue::Binary(merged.serialize()),
        )
        .await?;
        Ok(())
    }
}
