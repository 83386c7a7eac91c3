//! Instance buffer: load/write/flush lifecycle, readonly enforcement,
//! attachment and embedded-message nesting.

mod common;

use common::{private_mailbox, simple_message, RecordingEnv, TEST_ACCOUNT};
use exmstore::folder::PRIVATE_FID_DRAFT;
use exmstore::instance::FlushResult;
use exmstore::props::*;
use exmstore::{AttachmentContent, MessageContent, StoreError};

#[tokio::test]
async fn test_compose_and_flush() {
    let mbox = private_mailbox().await;
    let instance = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, 0, true)
        .await
        .unwrap();
    let mut bag = PropvalBag::new();
    bag.set(PR_SUBJECT, PropValue::Unicode("draft".into()));
    bag.set(PR_BODY, PropValue::Unicode("working copy".into()));
    mbox.handle.set_instance_properties(instance, &bag).await.unwrap();

    // Nothing hits storage until the flush.
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_DRAFT, false).await.unwrap(), 0);
    let FlushResult::Ok(mid) = mbox
        .handle
        .flush_instance(instance, &RecordingEnv::default())
        .await
        .unwrap()
    else {
        panic!("over quota");
    };
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_DRAFT, false).await.unwrap(), 1);
    let stored = mbox.handle.read_message(mid).await.unwrap().unwrap();
    assert_eq!(stored.proplist.get(PR_SUBJECT).unwrap().as_str(), Some("draft"));
    assert_eq!(
        stored.proplist.get(PR_BODY).unwrap().as_str(),
        Some("working copy")
    );
    mbox.handle.unload_instance(instance).await.unwrap();
}

#[tokio::test]
async fn test_readonly_tags_rejected() {
    let mbox = private_mailbox().await;
    let instance = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, 0, true)
        .await
        .unwrap();
    let mut bag = PropvalBag::new();
    bag.set(PR_MID, PropValue::I8(99));
    let err = mbox
        .handle
        .set_instance_properties(instance, &bag)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AccessDenied));

    // PR_MESSAGE_FLAGS is write-once: fine on a new instance, rejected on a
    // loaded one.
    let mut flags = PropvalBag::new();
    flags.set(PR_MESSAGE_FLAGS, PropValue::Long(0));
    mbox.handle.set_instance_properties(instance, &flags).await.unwrap();
    let FlushResult::Ok(mid) = mbox
        .handle
        .flush_instance(instance, &RecordingEnv::default())
        .await
        .unwrap()
    else {
        panic!("over quota");
    };
    let reopened = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, mid, false)
        .await
        .unwrap();
    let err = mbox
        .handle
        .set_instance_properties(reopened, &flags)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AccessDenied));
}

#[tokio::test]
async fn test_write_instance_force_semantics() {
    let mbox = private_mailbox().await;
    let instance = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, 0, true)
        .await
        .unwrap();
    let mut first = MessageContent::new();
    first
        .proplist
        .set(PR_SUBJECT, PropValue::Unicode("original".into()));
    mbox.handle
        .write_message_instance(instance, &first, false)
        .await
        .unwrap();
    let mut second = MessageContent::new();
    second
        .proplist
        .set(PR_SUBJECT, PropValue::Unicode("overwrite".into()));
    // Without force the existing subject wins.
    mbox.handle
        .write_message_instance(instance, &second, false)
        .await
        .unwrap();
    let read = mbox.handle.read_message_instance(instance).await.unwrap();
    assert_eq!(read.proplist.get(PR_SUBJECT).unwrap().as_str(), Some("original"));
    mbox.handle
        .write_message_instance(instance, &second, true)
        .await
        .unwrap();
    let read = mbox.handle.read_message_instance(instance).await.unwrap();
    assert_eq!(read.proplist.get(PR_SUBJECT).unwrap().as_str(), Some("overwrite"));
}

#[tokio::test]
async fn test_attachment_and_embedded_round_trip() {
    let mbox = private_mailbox().await;
    let root = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, 0, true)
        .await
        .unwrap();
    let (att_instance, att_num) = mbox.handle.create_attachment_instance(root).await.unwrap();
    assert_eq!(att_num, 0);
    let mut att = AttachmentContent::default();
    att.proplist
        .set(PR_ATTACH_METHOD, PropValue::Long(5));
    let mut embedded = MessageContent::new();
    embedded
        .proplist
        .set(PR_SUBJECT, PropValue::Unicode("inner".into()));
    att.embedded = Some(Box::new(embedded));
    mbox.handle
        .write_attachment_instance(att_instance, &att, true)
        .await
        .unwrap();
    mbox.handle
        .flush_instance(att_instance, &RecordingEnv::default())
        .await
        .unwrap();
    let FlushResult::Ok(mid) = mbox
        .handle
        .flush_instance(root, &RecordingEnv::default())
        .await
        .unwrap()
    else {
        panic!("over quota");
    };
    let stored = mbox.handle.read_message(mid).await.unwrap().unwrap();
    assert_eq!(stored.attachments.len(), 1);
    let inner = stored.attachments[0].embedded.as_ref().unwrap();
    assert_eq!(inner.proplist.get(PR_SUBJECT).unwrap().as_str(), Some("inner"));

    // Instance cycle check: the attachment's parent chain reaches the root.
    assert!(mbox.handle.check_instance_cycle(root, att_instance).await.unwrap());
    assert!(!mbox.handle.check_instance_cycle(att_instance, root).await.unwrap());
}

#[tokio::test]
async fn test_html_body_derivation_on_flush() {
    let mbox = private_mailbox().await;
    let instance = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, 0, true)
        .await
        .unwrap();
    let mut bag = PropvalBag::new();
    bag.set(
        PR_HTML,
        PropValue::Binary(b"<html><body>Hello <b>there</b></body></html>".to_vec()),
    );
    mbox.handle.set_instance_properties(instance, &bag).await.unwrap();
    let FlushResult::Ok(mid) = mbox
        .handle
        .flush_instance(instance, &RecordingEnv::default())
        .await
        .unwrap()
    else {
        panic!("over quota");
    };
    let props = mbox.handle.get_message_properties(mid, &[PR_BODY]).await.unwrap();
    assert_eq!(props.get(PR_BODY).unwrap().as_str(), Some("Hello there"));
}

#[tokio::test]
async fn test_instance_survives_source_edit_until_reload() {
    let mbox = private_mailbox().await;
    let msg = simple_message("stable", "a@x.example", TEST_ACCOUNT);
    let mid = mbox.handle.write_message(PRIVATE_FID_DRAFT, &msg).await.unwrap();
    let instance = mbox
        .handle
        .load_message_instance(PRIVATE_FID_DRAFT, mid, false)
        .await
        .unwrap();
    let mut edit = PropvalBag::new();
    edit.set(PR_SUBJECT, PropValue::Unicode("renamed".into()));
    mbox.handle.set_message_properties(mid, &edit).await.unwrap();
    // The open instance still shows the materialized copy.
    let read = mbox.handle.read_message_instance(instance).await.unwrap();
    assert_eq!(read.proplist.get(PR_SUBJECT).unwrap().as_str(), Some("stable"));
    mbox.handle.reload_message_instance(instance).await.unwrap();
    let read = mbox.handle.read_message_instance(instance).await.unwrap();
    assert_eq!(read.proplist.get(PR_SUBJECT).unwrap().as_str(), Some("renamed"));
}
