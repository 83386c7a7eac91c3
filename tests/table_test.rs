//! View-table engine: categorized materialization, index density,
//! expand/collapse, bookmarks.

mod common;

use common::{private_mailbox, simple_message, TestMailbox, TEST_ACCOUNT};
use exmstore::ids::{gc_of, replid_of, REPLID_HEADER};
use exmstore::props::*;
use exmstore::table::{SortColumn, SortDir, SortOrderSet};
use exmstore::DeliveryResult;

const ROW_HEADER: i32 = 1;
const ROW_MESSAGE: i32 = 2;

fn by_subject(cexpanded: usize) -> SortOrderSet {
    SortOrderSet {
        columns: vec![SortColumn { proptag: PR_SUBJECT, dir: SortDir::Asc }],
        ccategories: 1,
        cexpanded,
    }
}

async fn deliver(mbox: &TestMailbox, subject: &str) -> u64 {
    let msg = simple_message(subject, "a@x.example", TEST_ACCOUNT);
    match mbox
        .handle
        .delivery_message(&mbox.env, "a@x.example", TEST_ACCOUNT, &msg)
        .await
        .unwrap()
    {
        DeliveryResult::Delivered(mid) => mid,
        DeliveryResult::MailboxFull => panic!("mailbox full"),
    }
}

async fn visible_rows(mbox: &TestMailbox, table_id: u32) -> Vec<(u64, i32, Option<String>, i32)> {
    let rows = mbox
        .handle
        .query_table(
            table_id,
            &[PR_INST_ID, PR_ROW_TYPE, PR_SUBJECT, PR_CONTENT_COUNT],
            0,
            64,
        )
        .await
        .unwrap();
    rows.iter()
        .map(|bag| {
            (
                bag.get(PR_INST_ID).unwrap().as_int().unwrap() as u64,
                bag.get(PR_ROW_TYPE).unwrap().as_int().unwrap() as i32,
                bag.get(PR_SUBJECT).and_then(|v| v.as_str().map(String::from)),
                bag.get(PR_CONTENT_COUNT).and_then(|v| v.as_int()).unwrap_or(0) as i32,
            )
        })
        .collect()
}

#[tokio::test]
async fn test_categorized_view_collapsed() {
    let mbox = private_mailbox().await;
    let fid = exmstore::folder::PRIVATE_FID_INBOX;
    deliver(&mbox, "A").await;
    deliver(&mbox, "B").await;
    deliver(&mbox, "B").await;

    let (table_id, count) = mbox
        .handle
        .load_content_table(0, fid, None, 0, None, Some(by_subject(0)))
        .await
        .unwrap();
    // Collapsed: only the two headers are visible.
    assert_eq!(count, 2);
    let rows = visible_rows(&mbox, table_id).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].1, ROW_HEADER);
    assert_eq!(rows[0].2.as_deref(), Some("A"));
    assert_eq!(rows[0].3, 1);
    assert_eq!(rows[1].2.as_deref(), Some("B"));
    assert_eq!(rows[1].3, 2);

    // Expand header "B": its two message rows appear at idx 3 and 4.
    let b_header = rows[1].0;
    assert_eq!(replid_of(b_header), REPLID_HEADER);
    let (found, position, added) = mbox.handle.expand_table(table_id, b_header).await.unwrap();
    assert!(found);
    assert_eq!(position, 1);
    assert_eq!(added, 2);
    let rows = visible_rows(&mbox, table_id).await;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[2].1, ROW_MESSAGE);
    assert_eq!(rows[3].1, ROW_MESSAGE);
    assert_eq!(mbox.handle.sum_table(table_id).await.unwrap(), 4);
}

#[tokio::test]
async fn test_index_density_without_gaps() {
    let mbox = private_mailbox().await;
    let fid = exmstore::folder::PRIVATE_FID_INBOX;
    for subject in ["x", "y", "y", "z", "z", "z"] {
        deliver(&mbox, subject).await;
    }
    let (table_id, count) = mbox
        .handle
        .load_content_table(0, fid, None, 0, None, Some(by_subject(1)))
        .await
        .unwrap();
    // cexpanded=1: all three headers start expanded, so every row shows.
    assert_eq!(count, 3 + 6);
    // Walk every position; each must resolve to exactly one row.
    for pos in 0..count {
        let (inst_id, _, _) = mbox.handle.mark_table(table_id, pos).await.unwrap();
        let (back, _) = mbox
            .handle
            .locate_table(table_id, inst_id, 0)
            .await
            .unwrap();
        assert_eq!(back, pos as i32);
    }
}

#[tokio::test]
async fn test_expand_collapse_round_trips() {
    let mbox = private_mailbox().await;
    let fid = exmstore::folder::PRIVATE_FID_INBOX;
    for subject in ["a", "b", "b", "c"] {
        deliver(&mbox, subject).await;
    }
    let (table_id, _) = mbox
        .handle
        .load_content_table(0, fid, None, 0, None, Some(by_subject(1)))
        .await
        .unwrap();
    let before = visible_rows(&mbox, table_id).await;
    let b_header = before
        .iter()
        .find(|r| r.1 == ROW_HEADER && r.2.as_deref() == Some("b"))
        .unwrap()
        .0;
    let (_, _, hidden) = mbox.handle.collapse_table(table_id, b_header).await.unwrap();
    assert_eq!(hidden, 2);
    let collapsed = visible_rows(&mbox, table_id).await;
    assert_eq!(collapsed.len(), before.len() - 2);
    let (_, _, shown) = mbox.handle.expand_table(table_id, b_header).await.unwrap();
    assert_eq!(shown, 2);
    let after = visible_rows(&mbox, table_id).await;
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_bookmark_restore_after_deletion() {
    let mbox = private_mailbox().await;
    let fid = exmstore::folder::PRIVATE_FID_INBOX;
    deliver(&mbox, "A").await;
    let b1 = deliver(&mbox, "B").await;
    deliver(&mbox, "B").await;

    let (table_id, _) = mbox
        .handle
        .load_content_table(0, fid, None, 0, None, Some(by_subject(0)))
        .await
        .unwrap();
    let rows = visible_rows(&mbox, table_id).await;
    let b_header = rows[1].0;
    let state_id = mbox
        .handle
        .store_table_state(table_id, b_header, 0)
        .await
        .unwrap();
    assert!(state_id != 0);

    // Deleting one B message reloads the open table.
    mbox.handle
        .delete_messages(TEST_ACCOUNT, fid, &[b1], true)
        .await
        .unwrap();

    let position = mbox
        .handle
        .restore_table_state(table_id, state_id)
        .await
        .unwrap();
    assert!(position >= 0, "highlighted header vanished");
    let row = mbox
        .handle
        .query_table(table_id, &[PR_SUBJECT, PR_CONTENT_COUNT, PR_ROW_TYPE], position as u32, 1)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(row.get(PR_SUBJECT).unwrap().as_str(), Some("B"));
    assert_eq!(row.get(PR_CONTENT_COUNT).unwrap().as_int(), Some(1));
}

#[tokio::test]
async fn test_unsorted_table_and_match() {
    let mbox = private_mailbox().await;
    let fid = exmstore::folder::PRIVATE_FID_INBOX;
    deliver(&mbox, "alpha").await;
    deliver(&mbox, "beta").await;
    deliver(&mbox, "gamma").await;
    let (table_id, count) = mbox
        .handle
        .load_content_table(0, fid, None, 0, None, None)
        .await
        .unwrap();
    assert_eq!(count, 3);
    let res = exmstore::props::restriction::Restriction::Content {
        fuzzy_level: exmstore::props::restriction::FL_SUBSTRING,
        proptag: PR_SUBJECT,
        value: PropValue::Unicode("beta".into()),
    };
    let (position, bag) = mbox.handle.match_table(table_id, true, 0, &res).await.unwrap();
    assert!(position >= 0);
    let inst_id = bag.get(PR_INST_ID).unwrap().as_int().unwrap() as u64;
    let props = mbox
        .handle
        .get_message_properties(gc_of(inst_id), &[PR_SUBJECT])
        .await
        .unwrap();
    assert_eq!(props.get(PR_SUBJECT).unwrap().as_str(), Some("beta"));
    // No match behind the last row.
    let (none, _) = mbox
        .handle
        .match_table(table_id, true, count, &res)
        .await
        .unwrap();
    assert_eq!(none, -1);
}

#[tokio::test]
async fn test_hierarchy_permission_rule_tables() {
    let mbox = private_mailbox().await;
    let root = exmstore::folder::PRIVATE_FID_IPMSUBTREE;
    let child = mbox.handle.create_folder(root, "Archive", None).await.unwrap();

    let (h_table, h_count) = mbox
        .handle
        .load_hierarchy_table(root, None, 0)
        .await
        .unwrap();
    assert!(h_count >= 1);
    let rows = mbox
        .handle
        .query_table(h_table, &[PR_FOLDER_ID, PR_DISPLAY_NAME], 0, 64)
        .await
        .unwrap();
    assert!(rows.iter().any(|bag| {
        bag.get(PR_FOLDER_ID).and_then(|v| v.as_int()).map(|v| gc_of(v as u64)) == Some(child)
    }));

    // Permission tables materialize the two synthetic members.
    let (p_table, p_count) = mbox.handle.load_permission_table(child).await.unwrap();
    assert_eq!(p_count, 2);
    let members = mbox
        .handle
        .query_table(p_table, &[PR_MEMBER_ID, PR_MEMBER_NAME, PR_MEMBER_RIGHTS], 0, 16)
        .await
        .unwrap();
    let names: Vec<_> = members
        .iter()
        .filter_map(|b| b.get(PR_MEMBER_NAME).and_then(|v| v.as_str().map(String::from)))
        .collect();
    assert!(names.contains(&"default".to_string()));
    assert!(names.contains(&"anonymous".to_string()));

    mbox.handle
        .add_rule(
            child,
            3,
            exmstore::rules::RULE_STATE_ENABLED,
            "RuleOrganizer",
            None,
            &[exmstore::rules::RuleAction::Delete],
        )
        .await
        .unwrap();
    let (r_table, r_count) = mbox.handle.load_rule_table(child).await.unwrap();
    assert_eq!(r_count, 1);
    let rules = mbox
        .handle
        .query_table(r_table, &[PR_RULE_SEQUENCE, PR_RULE_PROVIDER], 0, 16)
        .await
        .unwrap();
    assert_eq!(rules[0].get(PR_RULE_SEQUENCE).unwrap().as_int(), Some(3));

    mbox.handle.unload_table(h_table).await.unwrap();
    mbox.handle.unload_table(p_table).await.unwrap();
    mbox.handle.unload_table(r_table).await.unwrap();
}
