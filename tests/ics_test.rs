//! ICS content synchronization: completeness, deletion accounting, upload
//! acceptance and conflict detection, state streams.

mod common;

use common::{private_mailbox, simple_message, TEST_ACCOUNT};
use exmstore::folder::PRIVATE_FID_INBOX;
use exmstore::ics::upload::{ImportHeader, IMPORT_FLAG_FAIL_ON_CONFLICT};
use exmstore::ics::{SYNC_FLAG_NORMAL, SYNC_FLAG_READSTATE};
use exmstore::ids::gc_of;
use exmstore::props::idset::IdSet;
use exmstore::props::pcl::{Pcl, Xid};
use exmstore::props::*;
use exmstore::rules::{RuleAction, RULE_STATE_ENABLED};
use exmstore::{DeliveryResult, StoreError};
use uuid::Uuid;

fn empty() -> IdSet {
    IdSet::new()
}

#[tokio::test]
async fn test_fresh_sync_sees_all_then_nothing() {
    let mbox = private_mailbox().await;
    for i in 0..3 {
        let msg = simple_message(&format!("m{i}"), "a@x.example", TEST_ACCOUNT);
        mbox.handle
            .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
            .await
            .unwrap();
    }
    let first = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.chg_messages.len(), 3);
    assert_eq!(first.normal_count, 3);
    assert!(first.updated_messages.is_empty());
    assert!(first.deleted_messages.is_empty());
    assert_eq!(first.given_messages.len(), 3);
    assert!(first.last_cn != 0);

    // Second round with the returned watermarks: pure no-op.
    let mut given = IdSet::new();
    for eid in &first.given_messages {
        given.append(1, gc_of(*eid));
    }
    let mut seen = IdSet::new();
    seen.append_range(1, 1, gc_of(first.last_cn));
    let second = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &given,
            &seen,
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    assert!(second.chg_messages.is_empty());
    assert!(second.deleted_messages.is_empty());
    assert!(second.nolonger_messages.is_empty());
    assert_eq!(second.given_messages.len(), 3);
}

#[tokio::test]
async fn test_deleted_message_reported_once() {
    let mbox = private_mailbox().await;
    let mut mids = Vec::new();
    for i in 0..2 {
        let msg = simple_message(&format!("m{i}"), "a@x.example", TEST_ACCOUNT);
        let DeliveryResult::Delivered(mid) = mbox
            .handle
            .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
            .await
            .unwrap()
        else {
            panic!("delivery rejected");
        };
        mids.push(mid);
    }
    let first = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    mbox.handle
        .delete_messages(TEST_ACCOUNT, PRIVATE_FID_INBOX, &[mids[0]], true)
        .await
        .unwrap();

    let mut given = IdSet::new();
    for eid in &first.given_messages {
        given.append(1, gc_of(*eid));
    }
    let mut seen = IdSet::new();
    seen.append_range(1, 1, gc_of(first.last_cn));
    let second = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &given,
            &seen,
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    assert_eq!(second.deleted_messages.len(), 1);
    assert_eq!(gc_of(second.deleted_messages[0]), mids[0]);
    assert!(second.nolonger_messages.is_empty());
}

#[tokio::test]
async fn test_sync_after_rule_move_shows_empty_inbox() {
    let mbox = private_mailbox().await;
    let dest = mbox
        .handle
        .create_folder(exmstore::folder::PRIVATE_FID_IPMSUBTREE, "Moved", None)
        .await
        .unwrap();
    mbox.handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&exmstore::props::restriction::Restriction::Content {
                fuzzy_level: exmstore::props::restriction::FL_SUBSTRING
                    | exmstore::props::restriction::FL_IGNORECASE,
                proptag: PR_SUBJECT,
                value: PropValue::Unicode("Hi".into()),
            }),
            &[RuleAction::Move { same_store: false, dst_folder: dest }],
        )
        .await
        .unwrap();
    let msg = simple_message("Hi", "a@x.example", TEST_ACCOUNT);
    mbox.handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap();

    let sync = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    assert!(sync.chg_messages.is_empty());
    assert!(sync.deleted_messages.is_empty());
    assert!(sync.nolonger_messages.is_empty());
}

#[tokio::test]
async fn test_read_state_stream() {
    let mbox = private_mailbox().await;
    let msg = simple_message("m", "a@x.example", TEST_ACCOUNT);
    let DeliveryResult::Delivered(mid) = mbox
        .handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap()
    else {
        panic!("delivery rejected");
    };
    let first = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL | SYNC_FLAG_READSTATE,
            0,
            None,
        )
        .await
        .unwrap();
    mbox.handle
        .set_message_read_state(None, mid, true)
        .await
        .unwrap();
    let mut given = IdSet::new();
    for eid in &first.given_messages {
        given.append(1, gc_of(*eid));
    }
    let mut seen = IdSet::new();
    seen.append_range(1, 1, gc_of(first.last_cn));
    let second = mbox
        .handle
        .get_content_sync(
            PRIVATE_FID_INBOX,
            None,
            &given,
            &seen,
            &empty(),
            &empty(),
            SYNC_FLAG_NORMAL | SYNC_FLAG_READSTATE,
            0,
            None,
        )
        .await
        .unwrap();
    assert_eq!(second.read_messages.len(), 1);
    assert_eq!(gc_of(second.read_messages[0]), mid);
    assert!(second.unread_messages.is_empty());
    assert!(second.last_readcn != 0);
}

fn header_for(guid: Uuid, mid: u64, pcl: &Pcl) -> ImportHeader {
    ImportHeader {
        source_key: Xid::new(guid, mid).to_source_key(),
        last_modification_time: nttime_now(),
        change_key: Xid::new(guid, mid).to_source_key(),
        predecessor_change_list: pcl.serialize(),
    }
}

#[tokio::test]
async fn test_upload_accepts_newer_and_rejects_conflict() {
    let mbox = private_mailbox().await;
    let mid = mbox.handle.allocate_message_id(PRIVATE_FID_INBOX).await.unwrap();
    let content = simple_message("uploaded", "a@x.example", TEST_ACCOUNT);

    // Version 1 with PCL {(G,1)}.
    let mut pcl1 = Pcl::new();
    pcl1.append(Xid::new(mbox.guid, 1));
    mbox.handle
        .import_message_change(
            TEST_ACCOUNT,
            PRIVATE_FID_INBOX,
            0,
            &header_for(mbox.guid, mid, &pcl1),
            &content,
        )
        .await
        .unwrap();

    // Version 2 claiming {(G,2)}: strictly newer, accepted, PCLs merge.
    let mut pcl2 = Pcl::new();
    pcl2.append(Xid::new(mbox.guid, 2));
    mbox.handle
        .import_message_change(
            TEST_ACCOUNT,
            PRIVATE_FID_INBOX,
            0,
            &header_for(mbox.guid, mid, &pcl2),
            &content,
        )
        .await
        .unwrap();
    let stored = mbox
        .handle
        .get_message_properties(mid, &[PR_PREDECESSOR_CHANGE_LIST])
        .await
        .unwrap();
    let merged = Pcl::parse(stored.get(PR_PREDECESSOR_CHANGE_LIST).unwrap().as_bytes().unwrap())
        .unwrap();
    assert_eq!(merged.counter_for(&mbox.guid), Some(2));

    // Version 3 from a divergent replica with FAIL_ON_CONFLICT.
    let mut pcl3 = Pcl::new();
    pcl3.append(Xid::new(Uuid::new_v4(), 1));
    let err = mbox
        .handle
        .import_message_change(
            TEST_ACCOUNT,
            PRIVATE_FID_INBOX,
            IMPORT_FLAG_FAIL_ON_CONFLICT,
            &header_for(mbox.guid, mid, &pcl3),
            &content,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SyncConflict));
}

#[tokio::test]
async fn test_upload_replay_is_ignored() {
    let mbox = private_mailbox().await;
    let mid = mbox.handle.allocate_message_id(PRIVATE_FID_INBOX).await.unwrap();
    let content = simple_message("uploaded", "a@x.example", TEST_ACCOUNT);
    let mut pcl = Pcl::new();
    pcl.append(Xid::new(mbox.guid, 5));
    let header = header_for(mbox.guid, mid, &pcl);
    mbox.handle
        .import_message_change(TEST_ACCOUNT, PRIVATE_FID_INBOX, 0, &header, &content)
        .await
        .unwrap();
    let err = mbox
        .handle
        .import_message_change(TEST_ACCOUNT, PRIVATE_FID_INBOX, 0, &header, &content)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SyncIgnore));
}

#[tokio::test]
async fn test_state_stream_round_trip() {
    let mbox = private_mailbox().await;
    let mut set = IdSet::new();
    set.append_range(1, 10, 20);
    set.append(1, 42);
    let blob = set.serialize();
    let (a, b) = blob.split_at(blob.len() / 2);
    mbox.handle.begin_state_stream(META_TAG_IDSET_GIVEN).await.unwrap();
    mbox.handle
        .continue_state_stream(META_TAG_IDSET_GIVEN, a)
        .await
        .unwrap();
    mbox.handle
        .continue_state_stream(META_TAG_IDSET_GIVEN, b)
        .await
        .unwrap();
    mbox.handle.end_state_stream(META_TAG_IDSET_GIVEN).await.unwrap();
    let restored = mbox.handle.get_state_slot(META_TAG_IDSET_GIVEN).await;
    assert_eq!(restored, set);
    // Contents-only slots reject unknown proptags.
    assert!(mbox.handle.begin_state_stream(0x1234_0102).await.is_err());
}

#[tokio::test]
async fn test_hierarchy_sync_reports_new_folders() {
    let mbox = private_mailbox().await;
    let root = exmstore::folder::PRIVATE_FID_IPMSUBTREE;
    let first = mbox
        .handle
        .get_hierarchy_sync(root, None, &empty(), &empty())
        .await
        .unwrap();
    let baseline = first.folder_changes.len();
    assert!(baseline >= 1);

    mbox.handle.create_folder(root, "Projects", None).await.unwrap();
    let mut given = IdSet::new();
    for eid in &first.given_folders {
        given.append(1, gc_of(*eid));
    }
    let mut seen = IdSet::new();
    if first.last_cn != 0 {
        seen.append_range(1, 1, gc_of(first.last_cn));
    }
    let second = mbox
        .handle
        .get_hierarchy_sync(root, None, &given, &seen)
        .await
        .unwrap();
    assert_eq!(second.folder_changes.len(), 1);
    let bag = &second.folder_changes[0];
    assert_eq!(bag.get(PR_DISPLAY_NAME).unwrap().as_str(), Some("Projects"));
    assert!(bag.get(PR_PARENT_FOLDER_ID).is_some());
}

#[tokio::test]
async fn test_folder_import_creates_then_renames() {
    let mbox = private_mailbox().await;
    let parent_key = Xid::new(mbox.guid, exmstore::folder::PRIVATE_FID_IPMSUBTREE).to_source_key();
    let fid_hint = 0x00A0_0000u64;
    let mut pcl = Pcl::new();
    pcl.append(Xid::new(mbox.guid, 1));
    let header = ImportHeader {
        source_key: Xid::new(mbox.guid, fid_hint).to_source_key(),
        last_modification_time: nttime_now(),
        change_key: Xid::new(mbox.guid, fid_hint).to_source_key(),
        predecessor_change_list: pcl.serialize(),
    };
    let fid = mbox
        .handle
        .import_folder_change(TEST_ACCOUNT, &parent_key, &header, "Synced")
        .await
        .unwrap();
    let props = mbox
        .handle
        .get_folder_properties(fid, &[PR_DISPLAY_NAME])
        .await
        .unwrap();
    assert_eq!(props.get(PR_DISPLAY_NAME).unwrap().as_str(), Some("Synced"));

    // A newer upload renames in place.
    let mut pcl2 = Pcl::new();
    pcl2.append(Xid::new(mbox.guid, 99_999));
    let header2 = ImportHeader {
        source_key: header.source_key.clone(),
        last_modification_time: nttime_now(),
        change_key: header.change_key.clone(),
        predecessor_change_list: pcl2.serialize(),
    };
    let fid2 = mbox
        .handle
        .import_folder_change(TEST_ACCOUNT, &parent_key, &header2, "Synced v2")
        .await
        .unwrap();
    assert_eq!(fid2, fid);
    let props = mbox
        .handle
        .get_folder_properties(fid, &[PR_DISPLAY_NAME])
        .await
        .unwrap();
    assert_eq!(props.get(PR_DISPLAY_NAME).unwrap().as_str(), Some("Synced v2"));
}
