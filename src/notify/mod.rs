// SPDX-License-Identifier: MIT
//! Store event broadcasting.
//!
//! Every mailbox handle owns one broadcaster. Mutations queue their events
//! after the COMMIT; subscribers (the RPC notification layer) receive them
//! in arrival order. Dropped receivers are fine — delivery is best-effort.

use serde::Serialize;
use tokio::sync::broadcast;

/// Subscription filter bits, mirroring the wire-level notification kinds.
pub const NOTIFY_NEW_MAIL: u16 = 0x0002;
pub const NOTIFY_OBJECT_CREATED: u16 = 0x0004;
pub const NOTIFY_OBJECT_DELETED: u16 = 0x0008;
pub const NOTIFY_OBJECT_MODIFIED: u16 = 0x0010;
pub const NOTIFY_OBJECT_MOVED: u16 = 0x0020;
pub const NOTIFY_OBJECT_COPIED: u16 = 0x0040;
pub const NOTIFY_SEARCH_COMPLETE: u16 = 0x0080;
pub const NOTIFY_TABLE_CHANGED: u16 = 0x0100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum StoreEvent {
    NewMail { folder_id: u64, message_id: u64 },
    MessageCreated { folder_id: u64, message_id: u64 },
    MessageModified { folder_id: u64, message_id: u64 },
    MessageDeleted { folder_id: u64, message_id: u64 },
    MessageMoved { old_fid: u64, old_mid: u64, folder_id: u64, message_id: u64 },
    MessageCopied { src_fid: u64, src_mid: u64, folder_id: u64, message_id: u64 },
    FolderCreated { parent_id: u64, folder_id: u64 },
    FolderModified { folder_id: u64 },
    FolderDeleted { parent_id: u64, folder_id: u64 },
    FolderMoved { old_pid: u64, parent_id: u64, folder_id: u64 },
    SearchComplete { folder_id: u64 },
    /// Dynamic search folder membership changed.
    SearchFolderChanged { folder_id: u64, message_id: u64, added: bool },
    TableRowAdded { table_id: u32, inst_id: u64, inst_num: u32 },
    TableRowModified { table_id: u32, inst_id: u64, inst_num: u32 },
    TableRowDeleted { table_id: u32, inst_id: u64, inst_num: u32 },
    TableReloaded { table_id: u32 },
    ReadStateChanged { folder_id: u64, message_id: u64, read: bool },
}

/// A registered subscription: which kinds, scoped to a folder and/or message
/// (0 = whole store).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub sub_id: u32,
    pub kinds: u16,
    pub folder_id: u64,
    pub message_id: u64,
    pub whole_store: bool,
}

impl Subscription {
    pub fn wants(&self, event: &StoreEvent) -> bool {
        let (kind, fid, mid) = match event {
            StoreEvent::NewMail { folder_id, message_id } => {
                (NOTIFY_NEW_MAIL, *folder_id, *message_id)
            }
            StoreEvent::MessageCreated { folder_id, message_id }
            | StoreEvent::MessageCopied { folder_id, message_id, .. } => {
                (NOTIFY_OBJECT_CREATED, *folder_id, *message_id)
            }
            StoreEvent::MessageModified { folder_id, message_id }
            | StoreEvent::ReadStateChanged { folder_id, message_id, .. } => {
                (NOTIFY_OBJECT_MODIFIED, *folder_id, *message_id)
            }
            StoreEvent::MessageDeleted { folder_id, message_id } => {
                (NOTIFY_OBJECT_DELETED, *folder_id, *message_id)
            }
            StoreEvent::MessageMoved { folder_id, message_id, .. } => {
                (NOTIFY_OBJECT_MOVED, *folder_id, *message_id)
            }
            StoreEvent::FolderCreated { folder_id, .. } => (NOTIFY_OBJECT_CREATED, *folder_id, 0),
            StoreEvent::FolderModified { folder_id } => (NOTIFY_OBJECT_MODIFIED, *folder_id, 0),
            StoreEvent::FolderDeleted { folder_id, .. } => (NOTIFY_OBJECT_DELETED, *folder_id, 0),
            StoreEvent::FolderMoved { folder_id, .. } => (NOTIFY_OBJECT_MOVED, *folder_id, 0),
            StoreEvent::SearchComplete { folder_id }
            | StoreEvent::SearchFolderChanged { folder_id, .. } => {
                (NOTIFY_SEARCH_COMPLETE, *folder_id, 0)
            }
            StoreEvent::TableRowAdded { .. }
            | StoreEvent::TableRowModified { .. }
            | StoreEvent::TableRowDeleted { .. }
            | StoreEvent::TableReloaded { .. } => (NOTIFY_TABLE_CHANGED, 0, 0),
        };
        if self.kinds & kind == 0 {
            return false;
        }
        if self.whole_store {
            return true;
        }
        (self.folder_id == 0 || self.folder_id == fid)
            && (self.message_id == 0 || self.message_id == mid)
    }
}

/// Broadcasts store events to all subscribed receivers.
pub struct Notifier {
    tx: broadcast::Sender<StoreEvent>,
    subs: std::sync::Mutex<Vec<Subscription>>,
    next_sub: std::sync::atomic::AtomicU32,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Notifier {
            tx,
            subs: std::sync::Mutex::new(Vec::new()),
            next_sub: std::sync::atomic::AtomicU32::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn register(&self, kinds: u16, folder_id: u64, message_id: u64, whole_store: bool) -> u32 {
        let sub_id = self
            .next_sub
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subs.lock().unwrap().push(Subscription {
            sub_id,
            kinds,
            folder_id,
            message_id,
            whole_store,
        });
        sub_id
    }

    pub fn unregister(&self, sub_id: u32) {
        self.subs.lock().unwrap().retain(|s| s.sub_id != sub_id);
    }

    /// True if at least one registered subscription matches the event.
    pub fn has_audience(&self, event: &StoreEvent) -> bool {
        self.subs.lock().unwrap().iter().any(|s| s.wants(event))
    }

    /// Queue an event. No subscribers is fine.
    pub fn post(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_filter() {
        let sub = Subscription {
            sub_id: 1,
            kinds: NOTIFY_OBJECT_CREATED | NOTIFY_OBJECT_DELETED,
            folder_id: 6,
            message_id: 0,
            whole_store: false,
        };
        assert!(sub.wants(&StoreEvent::MessageCreated { folder_id: 6, message_id: 9 }));
        assert!(!sub.wants(&StoreEvent::MessageCreated { folder_id: 7, message_id: 9 }));
        assert!(!sub.wants(&StoreEvent::MessageModified { folder_id: 6, message_id: 9 }));
    }

    #[tokio::test]
    async fn test_post_and_receive() {
        let n = Notifier::new();
        let mut rx = n.subscribe();
        n.post(StoreEvent::NewMail { folder_id: 6, message_id: 1 });
        match rx.recv().await.unwrap() {
            StoreEvent::NewMail { folder_id, .. } => assert_eq!(folder_id, 6),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
