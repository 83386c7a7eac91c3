//! Delivery and rule-engine behavior against a provisioned private mailbox.

mod common;

use common::{private_mailbox, simple_message, TEST_ACCOUNT};
use exmstore::folder::{PRIVATE_FID_DEFERRED_ACTION, PRIVATE_FID_INBOX};
use exmstore::props::restriction::{Restriction, FL_IGNORECASE, FL_SUBSTRING};
use exmstore::props::*;
use exmstore::rules::{RuleAction, RULE_STATE_ENABLED, RULE_STATE_ERROR};
use exmstore::DeliveryResult;

#[tokio::test]
async fn test_delivery_lands_in_inbox() {
    let mbox = private_mailbox().await;
    let msg = simple_message("Hi", "a@x.example", TEST_ACCOUNT);
    let result = mbox
        .handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap();
    let DeliveryResult::Delivered(mid) = result else {
        panic!("delivery rejected");
    };
    assert!(mbox.handle.check_message(PRIVATE_FID_INBOX, mid).await.unwrap());

    let props = mbox
        .handle
        .get_message_properties(
            mid,
            &[PR_MESSAGE_FLAGS, PR_MESSAGE_TO_ME, PR_CHANGE_NUMBER, PR_SUBJECT],
        )
        .await
        .unwrap();
    let flags = props.get(PR_MESSAGE_FLAGS).unwrap().as_int().unwrap() as u32;
    assert_eq!(flags & MSGFLAG_UNSENT, 0, "delivery must clear the unsent bit");
    assert_eq!(props.get(PR_MESSAGE_TO_ME).unwrap().as_bool(), Some(true));
    assert_eq!(props.get(PR_SUBJECT).unwrap().as_str(), Some("Hi"));
    // First allocation after provisioning.
    let cn = props.get(PR_CHANGE_NUMBER).unwrap().as_int().unwrap() as u64;
    assert_eq!(exmstore::ids::gc_of(cn), 1);
}

fn subject_contains(needle: &str) -> Restriction {
    Restriction::Content {
        fuzzy_level: FL_SUBSTRING | FL_IGNORECASE,
        proptag: PR_SUBJECT,
        value: PropValue::Unicode(needle.into()),
    }
}

#[tokio::test]
async fn test_rule_move_executes_in_store() {
    let mbox = private_mailbox().await;
    let dest = mbox
        .handle
        .create_folder(exmstore::folder::PRIVATE_FID_IPMSUBTREE, "Filtered", Some("IPF.Note"))
        .await
        .unwrap();
    mbox.handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&subject_contains("Hi")),
            &[RuleAction::Move { same_store: false, dst_folder: dest }],
        )
        .await
        .unwrap();
    let dam_before = mbox
        .handle
        .sum_content(PRIVATE_FID_DEFERRED_ACTION, false)
        .await
        .unwrap();

    let msg = simple_message("Hi", "a@x.example", TEST_ACCOUNT);
    mbox.handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap();

    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_INBOX, false).await.unwrap(), 0);
    assert_eq!(mbox.handle.sum_content(dest, false).await.unwrap(), 1);
    // The in-store move never goes through a deferred action.
    assert_eq!(
        mbox.handle.sum_content(PRIVATE_FID_DEFERRED_ACTION, false).await.unwrap(),
        dam_before
    );
}

#[tokio::test]
async fn test_rule_move_is_idempotent_per_delivery() {
    let mbox = private_mailbox().await;
    let dest = mbox
        .handle
        .create_folder(exmstore::folder::PRIVATE_FID_IPMSUBTREE, "Sorted", None)
        .await
        .unwrap();
    mbox.handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&subject_contains("Hi")),
            &[RuleAction::Move { same_store: false, dst_folder: dest }],
        )
        .await
        .unwrap();
    for _ in 0..2 {
        let msg = simple_message("Hi again", "a@x.example", TEST_ACCOUNT);
        mbox.handle
            .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
            .await
            .unwrap();
    }
    assert_eq!(mbox.handle.sum_content(dest, false).await.unwrap(), 2);
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_INBOX, false).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rule_same_store_flag_defers_to_client() {
    let mbox = private_mailbox().await;
    let dest = mbox
        .handle
        .create_folder(exmstore::folder::PRIVATE_FID_IPMSUBTREE, "Deferred", None)
        .await
        .unwrap();
    mbox.handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&subject_contains("Hi")),
            &[RuleAction::Move { same_store: true, dst_folder: dest }],
        )
        .await
        .unwrap();
    let msg = simple_message("Hi", "a@x.example", TEST_ACCOUNT);
    mbox.handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap();
    // Message stays put; a DAM shows up for the client to apply.
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_INBOX, false).await.unwrap(), 1);
    assert_eq!(mbox.handle.sum_content(dest, false).await.unwrap(), 0);
    assert_eq!(
        mbox.handle.sum_content(PRIVATE_FID_DEFERRED_ACTION, false).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_rule_move_to_missing_folder_disables_rule() {
    let mbox = private_mailbox().await;
    let rule_id = mbox
        .handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&subject_contains("Hi")),
            &[RuleAction::Move { same_store: false, dst_folder: 0xDEAD_BEEF }],
        )
        .await
        .unwrap();
    let msg = simple_message("Hi", "a@x.example", TEST_ACCOUNT);
    mbox.handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap();
    // Delivery still lands; the rule is flagged broken and a DEM exists.
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_INBOX, false).await.unwrap(), 1);
    let state = mbox.handle.get_rule_state(rule_id).await.unwrap().unwrap();
    assert_ne!(state & RULE_STATE_ERROR, 0);
    assert_eq!(
        mbox.handle.sum_content(PRIVATE_FID_DEFERRED_ACTION, false).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_rule_tag_and_mark_read() {
    let mbox = private_mailbox().await;
    mbox.handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&subject_contains("urgent")),
            &[
                RuleAction::Tag { proptag: PR_IMPORTANCE, value: PropValue::Long(2) },
                RuleAction::MarkAsRead,
            ],
        )
        .await
        .unwrap();
    let msg = simple_message("URGENT: read me", "a@x.example", TEST_ACCOUNT);
    let DeliveryResult::Delivered(mid) = mbox
        .handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap()
    else {
        panic!("delivery rejected");
    };
    let props = mbox
        .handle
        .get_message_properties(mid, &[PR_IMPORTANCE, PR_READ])
        .await
        .unwrap();
    assert_eq!(props.get(PR_IMPORTANCE).unwrap().as_int(), Some(2));
    assert_eq!(props.get(PR_READ).unwrap().as_bool(), Some(true));
}

#[tokio::test]
async fn test_rule_bounce_consumes_message() {
    let mbox = private_mailbox().await;
    mbox.handle
        .add_rule(
            PRIVATE_FID_INBOX,
            0,
            RULE_STATE_ENABLED,
            "RuleOrganizer",
            Some(&subject_contains("spam")),
            &[RuleAction::Bounce { code: 2 }],
        )
        .await
        .unwrap();
    let msg = simple_message("spam offer", "a@x.example", TEST_ACCOUNT);
    mbox.handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap();
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_INBOX, false).await.unwrap(), 0);
    let bounced = mbox.env.bounced.lock().await;
    assert_eq!(bounced.len(), 1);
    assert_eq!(bounced[0].1, 2);
}

#[tokio::test]
async fn test_receive_quota_rejects_delivery() {
    let mbox = private_mailbox().await;
    // Zero-KB receive quota; the first delivery blows straight through it.
    mbox.handle
        .set_store_property(PR_PROHIBIT_RECEIVE_QUOTA, &PropValue::Long(0))
        .await
        .unwrap();
    let mut big = simple_message("big", "a@x.example", TEST_ACCOUNT);
    big.proplist
        .set(PR_BODY, PropValue::Unicode("x".repeat(4096)));
    let result = mbox
        .handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &big)
        .await
        .unwrap();
    assert_eq!(result, DeliveryResult::MailboxFull);
    assert_eq!(mbox.handle.sum_content(PRIVATE_FID_INBOX, false).await.unwrap(), 0);
}

#[tokio::test]
async fn test_change_numbers_strictly_monotone() {
    let mbox = private_mailbox().await;
    let mut last = 0u64;
    for i in 0..5 {
        let msg = simple_message(&format!("m{i}"), "a@x.example", TEST_ACCOUNT);
        let DeliveryResult::Delivered(mid) = mbox
            .handle
            .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
            .await
            .unwrap()
        else {
            panic!("delivery rejected");
        };
        let cn = mbox
            .handle
            .get_message_properties(mid, &[PR_CHANGE_NUMBER])
            .await
            .unwrap()
            .get(PR_CHANGE_NUMBER)
            .unwrap()
            .as_int()
            .unwrap() as u64;
        let cn = exmstore::ids::gc_of(cn);
        assert!(cn > last, "cn {cn} not greater than {last}");
        last = cn;
    }
}
