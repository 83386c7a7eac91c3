//! Storage-layer behavior: provisioning, folder tree, move/copy,
//! permissions, search folders, blob sweeping.

mod common;

use common::{private_mailbox, simple_message, TEST_ACCOUNT};
use exmstore::folder::{
    PRIVATE_FID_INBOX, PRIVATE_FID_IPMSUBTREE, PRIVATE_FID_ROOT, PRIVATE_FID_SENT_ITEMS,
};
use exmstore::props::restriction::{Restriction, FL_IGNORECASE, FL_SUBSTRING};
use exmstore::props::*;
use exmstore::StoreError;

#[tokio::test]
async fn test_provisioning_creates_well_known_folders() {
    let mbox = private_mailbox().await;
    for fid in [PRIVATE_FID_ROOT, PRIVATE_FID_IPMSUBTREE, PRIVATE_FID_INBOX, PRIVATE_FID_SENT_ITEMS]
    {
        let props = mbox
            .handle
            .get_folder_properties(fid, &[PR_DISPLAY_NAME, PR_FOLDER_ID])
            .await
            .unwrap();
        assert!(props.get(PR_DISPLAY_NAME).is_some(), "folder {fid} missing");
    }
    let inbox = mbox
        .handle
        .get_folder_properties(PRIVATE_FID_INBOX, &[PR_DISPLAY_NAME, PR_PARENT_FOLDER_ID])
        .await
        .unwrap();
    assert_eq!(inbox.get(PR_DISPLAY_NAME).unwrap().as_str(), Some("Inbox"));
    assert_eq!(
        inbox
            .get(PR_PARENT_FOLDER_ID)
            .and_then(|v| v.as_int())
            .map(|v| exmstore::ids::gc_of(v as u64)),
        Some(PRIVATE_FID_IPMSUBTREE)
    );
}

#[tokio::test]
async fn test_folder_create_duplicate_name_rejected() {
    let mbox = private_mailbox().await;
    mbox.handle
        .create_folder(PRIVATE_FID_IPMSUBTREE, "Projects", None)
        .await
        .unwrap();
    let err = mbox
        .handle
        .create_folder(PRIVATE_FID_IPMSUBTREE, "projects", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateName));
}

#[tokio::test]
async fn test_movecopy_message() {
    let mbox = private_mailbox().await;
    let msg = simple_message("mv", "a@x.example", TEST_ACCOUNT);
    let mid = mbox.handle.write_message(PRIVATE_FID_INBOX, &msg).await.unwrap();
    let dest = mbox
        .handle
        .create_folder(PRIVATE_FID_IPMSUBTREE, "Archive", None)
        .await
        .unwrap();

    // Copy leaves the source in place.
    let copied = mbox
        .handle
        .movecopy_message(TEST_ACCOUNT, mid, dest, false)
        .await
        .unwrap();
    assert!(mbox.handle.check_message(PRIVATE_FID_INBOX, mid).await.unwrap());
    assert!(mbox.handle.check_message(dest, copied).await.unwrap());

    // Move removes it.
    let moved = mbox
        .handle
        .movecopy_message(TEST_ACCOUNT, mid, dest, true)
        .await
        .unwrap();
    assert!(!mbox.handle.check_message(PRIVATE_FID_INBOX, mid).await.unwrap());
    assert!(mbox.handle.check_message(dest, moved).await.unwrap());
    assert_eq!(mbox.handle.sum_content(dest, false).await.unwrap(), 2);
}

#[tokio::test]
async fn test_movecopy_denied_without_rights() {
    let mbox = private_mailbox().await;
    let msg = simple_message("locked", "a@x.example", TEST_ACCOUNT);
    let mid = mbox.handle.write_message(PRIVATE_FID_INBOX, &msg).await.unwrap();
    let dest = mbox
        .handle
        .create_folder(PRIVATE_FID_IPMSUBTREE, "Locked", None)
        .await
        .unwrap();
    // A stranger has no rights anywhere.
    let err = mbox
        .handle
        .movecopy_message("intruder@elsewhere.example", mid, dest, true)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AccessDenied));
}

#[tokio::test]
async fn test_folder_move_rejects_cycle() {
    let mbox = private_mailbox().await;
    let outer = mbox
        .handle
        .create_folder(PRIVATE_FID_IPMSUBTREE, "Outer", None)
        .await
        .unwrap();
    let inner = mbox.handle.create_folder(outer, "Inner", None).await.unwrap();
    let err = mbox
        .handle
        .movecopy_folder(TEST_ACCOUNT, outer, inner, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidParam(_)));
    // A legal move reparents the subtree.
    mbox.handle
        .movecopy_folder(TEST_ACCOUNT, inner, PRIVATE_FID_IPMSUBTREE, Some("Promoted"))
        .await
        .unwrap();
    let props = mbox
        .handle
        .get_folder_properties(inner, &[PR_DISPLAY_NAME, PR_PARENT_FOLDER_ID])
        .await
        .unwrap();
    assert_eq!(props.get(PR_DISPLAY_NAME).unwrap().as_str(), Some("Promoted"));
}

#[tokio::test]
async fn test_search_folder_membership_tracks_mutations() {
    let mbox = private_mailbox().await;
    // Search folders are created as such via the folders row.
    let sf = mbox
        .handle
        .create_folder(exmstore::folder::PRIVATE_FID_FINDER, "Wanted", None)
        .await
        .unwrap();
    mbox.handle.mark_folder_as_search(sf).await.unwrap();
    let criteria = Restriction::Content {
        fuzzy_level: FL_SUBSTRING | FL_IGNORECASE,
        proptag: PR_SUBJECT,
        value: PropValue::Unicode("invoice".into()),
    };
    exmstore::search::set_search_criteria(&mbox.handle, sf, &criteria, &[PRIVATE_FID_INBOX], 0)
        .await
        .unwrap();

    let hit = simple_message("Invoice 42", "a@x.example", TEST_ACCOUNT);
    let miss = simple_message("lunch", "a@x.example", TEST_ACCOUNT);
    let hit_mid = mbox.handle.write_message(PRIVATE_FID_INBOX, &hit).await.unwrap();
    mbox.handle.write_message(PRIVATE_FID_INBOX, &miss).await.unwrap();

    let (table, count) = mbox
        .handle
        .load_content_table(0, sf, None, 0, None, None)
        .await
        .unwrap();
    assert_eq!(count, 1);
    let rows = mbox.handle.query_table(table, &[PR_INST_ID], 0, 8).await.unwrap();
    assert_eq!(
        rows[0].get(PR_INST_ID).and_then(|v| v.as_int()).map(|v| exmstore::ids::gc_of(v as u64)),
        Some(hit_mid)
    );

    // Retitling the hit message out of scope removes it from the result set.
    let mut edit = PropvalBag::new();
    edit.set(PR_SUBJECT, PropValue::Unicode("paid".into()));
    mbox.handle.set_message_properties(hit_mid, &edit).await.unwrap();
    assert_eq!(mbox.handle.sum_search_result(sf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_blob_sweeper_reclaims_orphans() {
    let mbox = private_mailbox().await;
    let mut msg = simple_message("blobbed", "a@x.example", TEST_ACCOUNT);
    msg.proplist
        .set(PR_BODY, PropValue::Unicode("first body".into()));
    let mid = mbox.handle.write_message(PRIVATE_FID_INBOX, &msg).await.unwrap();
    // Rewriting the body orphans the first blob file.
    let mut edit = PropvalBag::new();
    edit.set(PR_BODY, PropValue::Unicode("second body".into()));
    mbox.handle.set_message_properties(mid, &edit).await.unwrap();
    let removed = mbox.handle.sweep_blobs().await.unwrap();
    assert!(removed >= 1);
    // The live body is untouched.
    let props = mbox.handle.get_message_properties(mid, &[PR_BODY]).await.unwrap();
    assert_eq!(props.get(PR_BODY).unwrap().as_str(), Some("second body"));
}

#[tokio::test]
async fn test_read_state_allocates_read_cn() {
    let mbox = private_mailbox().await;
    let msg = simple_message("r", "a@x.example", TEST_ACCOUNT);
    let mid = mbox.handle.write_message(PRIVATE_FID_INBOX, &msg).await.unwrap();
    let cn1 = mbox.handle.set_message_read_state(None, mid, true).await.unwrap();
    let cn2 = mbox.handle.set_message_read_state(None, mid, false).await.unwrap();
    assert!(cn2 > cn1);
    let props = mbox.handle.get_message_properties(mid, &[PR_READ]).await.unwrap();
    assert_eq!(props.get(PR_READ).unwrap().as_bool(), Some(false));
}
