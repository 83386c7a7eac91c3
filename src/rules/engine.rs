// SPDX-License-Identifier: MIT
//! Rule evaluation and action execution on newly arrived messages.

use std::collections::HashMap;

use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, warn};

use crate::db::properties::{self, PropTable};
use crate::db::DbHandle;
use crate::error::{Result, StoreError};
use crate::folder::{self, PRIVATE_FID_DEFERRED_ACTION};
use crate::ids::make_local_eid;
use crate::message::{self, MessageContent};
use crate::props::restriction::Restriction;
use crate::props::*;

use super::env::RuleEnvironment;
use super::*;

/// Deferred MOVE/COPY/DEFER blocks accumulated for the client, grouped into
/// DAMs per provider after the rule walk.
struct DamEntry {
    rule_id: u64,
    provider: String,
    action: RuleAction,
}

pub(crate) struct RulePass<'a> {
    pub env: &'a dyn RuleEnvironment,
    pub from_address: &'a str,
    pub account: &'a str,
    pub b_oof: bool,
    /// Destination folders already visited this delivery; the sole cascade
    /// terminator for chained MOVE rules.
    pub folder_list: Vec<u64>,
    /// (folder, message) pairs that survived and should be announced.
    pub msg_list: Vec<(u64, u64)>,
}

impl<'a> RulePass<'a> {
    pub fn new(env: &'a dyn RuleEnvironment, from: &'a str, account: &'a str, b_oof: bool) -> Self {
        RulePass {
            env,
            from_address: from,
            account,
            b_oof,
            folder_list: Vec::new(),
            msg_list: Vec::new(),
        }
    }
}

// ─── Rule loading ────────────────────────────────────────────────────────────

async fn load_standard_rules(
    conn: &mut SqliteConnection,
    folder_id: u64,
    b_oof: bool,
) -> Result<Vec<LoadedRule>> {
    let rows = sqlx::query(
        "SELECT rule_id, sequence, state, provider, condition, actions FROM rules \
         WHERE folder_id = ? ORDER BY sequence",
    )
    .bind(folder_id as i64)
    .fetch_all(conn)
    .await?;
    let mut out = Vec::new();
    for row in rows {
        let state = row.get::<i64, _>(2) as u32;
        if state & (RULE_STATE_ERROR | RULE_STATE_PARSE_ERROR) != 0 {
            continue;
        }
        if state & RULE_STATE_ENABLED == 0 {
            if state & RULE_STATE_ONLY_WHEN_OOF == 0 || !b_oof {
                continue;
            }
        }
        let condition: Option<Restriction> = row
            .get::<Option<String>, _>(4)
            .and_then(|t| serde_json::from_str(&t).ok());
        let actions: Vec<RuleAction> = row
            .get::<Option<String>, _>(5)
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        out.push(LoadedRule {
            id: row.get::<i64, _>(0) as u64,
            sequence: row.get::<i64, _>(1) as u32,
            state,
            provider: row.get::<String, _>(3),
            condition,
            actions,
            extended: false,
        });
    }
    Ok(out)
}

async fn load_extended_rules(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    folder_id: u64,
    b_oof: bool,
) -> Result<Vec<LoadedRule>> {
    let sql = if handle.private {
        "SELECT message_id FROM messages WHERE parent_fid = ? AND is_associated = 1"
    } else {
        "SELECT message_id FROM messages WHERE parent_fid = ? AND is_associated = 1 \
         AND is_deleted = 0"
    };
    let mids: Vec<i64> = sqlx::query_scalar(sql)
        .bind(folder_id as i64)
        .fetch_all(&mut *conn)
        .await?;
    let mut out = Vec::new();
    for mid in mids.into_iter().take(handle.config.max_fai_scan) {
        let mid = mid as u64;
        let class =
            properties::get_property(handle, conn, PropTable::Message, mid, PR_MESSAGE_CLASS)
                .await?;
        if class
            .as_ref()
            .and_then(|v| v.as_str())
            .map(|c| !c.eq_ignore_ascii_case("IPM.ExtendedRule.Message"))
            .unwrap_or(true)
        {
            continue;
        }
        let state =
            properties::get_property(handle, conn, PropTable::Message, mid, PR_RULE_MSG_STATE)
                .await?
                .and_then(|v| v.as_int())
                .unwrap_or(0) as u32;
        if state & (RULE_STATE_ERROR | RULE_STATE_PARSE_ERROR) != 0 {
            continue;
        }
        if state & RULE_STATE_ENABLED == 0 {
            if state & RULE_STATE_ONLY_WHEN_OOF == 0 || !b_oof {
                continue;
            }
        }
        let sequence =
            properties::get_property(handle, conn, PropTable::Message, mid, PR_RULE_MSG_SEQUENCE)
                .await?
                .and_then(|v| v.as_int())
                .unwrap_or(0) as u32;
        let provider =
            properties::get_property(handle, conn, PropTable::Message, mid, PR_RULE_MSG_PROVIDER)
                .await?
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
        let cond_payload = read_payload(handle, conn, mid, PR_EXTENDED_RULE_MSG_CONDITION).await?;
        let act_payload = read_payload(handle, conn, mid, PR_EXTENDED_RULE_MSG_ACTIONS).await?;
        let mut condition = cond_payload.as_ref().and_then(|p| p.condition.clone());
        let mut actions = act_payload.map(|p| p.actions).unwrap_or_default();
        if let Some(payload) = cond_payload {
            if let Err(e) =
                remap_named_props(handle, conn, &payload.named_props, &mut condition, &mut actions)
                    .await
            {
                warn!(mid, err = %e, "extended rule named-prop remap failed; skipping rule");
                continue;
            }
        }
        out.push(LoadedRule {
            id: mid,
            sequence,
            state,
            provider,
            condition,
            actions,
            extended: true,
        });
    }
    out.sort_by_key(|r| r.sequence);
    Ok(out)
}

async fn read_payload(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    mid: u64,
    proptag: u32,
) -> Result<Option<ExtendedRulePayload>> {
    let Some(v) = properties::get_property(handle, conn, PropTable::Message, mid, proptag).await?
    else {
        return Ok(None);
    };
    let Some(bytes) = v.as_bytes() else {
        return Ok(None);
    };
    Ok(serde_json::from_slice(bytes).ok())
}

/// Rewrite rule-local named property ids to the mailbox's ids, creating
/// table entries for unknown names.
async fn remap_named_props(
    handle: &DbHandle,
    conn: &mut SqliteConnection,
    named: &[(u16, String)],
    condition: &mut Option<Restriction>,
    actions: &mut [RuleAction],
) -> Result<()> {
    if named.is_empty() {
        return Ok(());
    }
    let mut map: HashMap<u16, u16> = HashMap::new();
    for (local_id, name) in named {
        if name.len() > handle.config.named_prop_name_limit {
            return Err(StoreError::InvalidParam("named property name too long"));
        }
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT propid FROM named_properties WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        let real = match existing {
            Some(id) => id as u16,
            None => {
                let next: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(propid), 0x8000) + 1 FROM named_properties",
                )
                .fetch_one(&mut *conn)
                .await?;
                sqlx::query("INSERT INTO named_properties (propid, name) VALUES (?, ?)")
                    .bind(next)
                    .bind(name)
                    .execute(&mut *conn)
                    .await?;
                next as u16
            }
        };
        map.insert(*local_id, real);
    }
    if let Some(res) = condition {
        remap_restriction(res, &map);
    }
    for action in actions {
        if let RuleAction::Tag { proptag, .. } = action {
            if let Some(real) = map.get(&prop_id(*proptag)) {
                *proptag = make_proptag(*real, prop_type(*proptag));
            }
        }
    }
    Ok(())
}

fn remap_restriction(res: &mut Restriction, map: &HashMap<u16, u16>) {
    let fix = |tag: &mut u32| {
        if let Some(real) = map.get(&prop_id(*tag)) {
            *tag = make_proptag(*real, prop_type(*tag));
        }
    };
    match res {
        Restriction::And(list) | Restriction::Or(list) => {
            for r in list {
                remap_restriction(r, map);
            }
        }
        Restriction::Not(r) => remap_restriction(r, map),
        Restriction::Content { proptag, .. }
        | Restriction::Property { proptag, .. }
        | Restriction::Bitmask { proptag, .. }
        | Restriction::Size { proptag, .. }
        | Restriction::Exist { proptag } => fix(proptag),
        Restriction::PropCompare { proptag1, proptag2, .. } => {
            fix(proptag1);
            fix(proptag2);
        }
        Restriction::Sub { res, .. } => remap_restriction(res, map),
        Restriction::Comment { res, .. } => {
            if let Some(r) = res {
                remap_restriction(r, map);
            }
        }
        Restriction::Count { res, .. } => remap_restriction(res, map),
    }
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Run the folder's rules against a freshly arrived message. Returns true
/// when an action consumed the message (delete/bounce/move).
pub(crate) fn run_rules<'a>(
    handle: &'a DbHandle,
    tx: &'a mut Transaction<'static, Sqlite>,
    pass: &'a mut RulePass<'_>,
    folder_id: u64,
    message_id: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let std_rules = load_standard_rules(&mut *tx, folder_id, pass.b_oof).await?;
        let ext_rules = load_extended_rules(handle, &mut *tx, folder_id, pass.b_oof).await?;
        let mut b_del = false;
        let mut b_exit = false;
        let mut dams: Vec<DamEntry> = Vec::new();
        for rule in std_rules.iter().chain(ext_rules.iter()) {
            if b_exit && rule.state & RULE_STATE_ONLY_WHEN_OOF == 0 {
                continue;
            }
            let Some(condition) = &rule.condition else {
                continue;
            };
            if !message::eval_message_restriction(handle, &mut *tx, message_id, condition).await? {
                continue;
            }
            if rule.state & RULE_STATE_EXIT_LEVEL != 0 {
                b_exit = true;
            }
            for (idx, action) in rule.actions.iter().enumerate() {
                execute_action(
                    handle, tx, pass, folder_id, message_id, rule, idx, action, &mut b_del,
                    &mut dams,
                )
                .await?;
            }
        }
        if !dams.is_empty() {
            make_deferred_action_messages(handle, tx, pass, folder_id, message_id, dams).await?;
        }
        if b_del {
            let row = message::message_row(&mut *tx, message_id).await?;
            if let Some(row) = row {
                let (nd, fd) = if row.is_associated {
                    (0i64, -(row.message_size as i64))
                } else {
                    (-(row.message_size as i64), 0i64)
                };
                message::hard_delete_message(&mut *tx, message_id).await?;
                handle.adjust_store_size(&mut *tx, nd, fd).await?;
            }
            debug!(account = pass.account, message_id, folder_id, "message consumed by rule");
        } else {
            pass.msg_list.push((folder_id, message_id));
        }
        Ok(())
    })
}

#[allow(clippy::too_many_arguments)]
async fn execute_action<'a>(
    handle: &DbHandle,
    tx: &mut Transaction<'static, Sqlite>,
    pass: &mut RulePass<'a>,
    folder_id: u64,
    message_id: u64,
    rule: &LoadedRule,
    action_idx: usize,
    action: &RuleAction,
    b_del: &mut bool,
    dams: &mut Vec<DamEntry>,
) -> Result<()> {
    match action {
        RuleAction::Move { same_store, dst_folder } | RuleAction::Copy { same_store, dst_folder } => {
            let is_move = matches!(action, RuleAction::Move { .. });
            if *same_store {
                // Client-side execution through a DAM; private stores only.
                if handle.private && !rule.extended {
                    dams.push(DamEntry {
                        rule_id: rule.id,
                        provider: rule.provider.clone(),
                        action: action.clone(),
                    });
                }
                return Ok(());
            }
            if pass.folder_list.contains(dst_folder) {
                return Ok(());
            }
            if !folder::folder_exists(&mut *tx, *dst_folder).await? {
                fail_rule(handle, tx, pass, folder_id, message_id, rule, action_idx, action,
                    RULE_ERROR_MOVECOPY)
                    .await?;
                return Ok(());
            }
            let outcome = message::copy_message_tx(handle, tx, message_id, *dst_folder).await?;
            pass.folder_list.push(*dst_folder);
            run_rules(handle, tx, pass, *dst_folder, outcome.message_id).await?;
            if is_move {
                *b_del = true;
                debug!(
                    account = pass.account,
                    message_id, folder_id, dst_folder, "message moved by rule"
                );
            }
        }
        RuleAction::Reply { template_mid, template_guid, flavor }
        | RuleAction::OofReply { template_mid, template_guid, flavor } => {
            if !auto_reply(handle, tx, pass, message_id, *template_mid, *template_guid, *flavor)
                .await?
            {
                fail_rule(handle, tx, pass, folder_id, message_id, rule, action_idx, action,
                    RULE_ERROR_RETRIEVE_TEMPLATE)
                    .await?;
            }
        }
        RuleAction::Forward { flavor, recipients } => {
            if !handle.private {
                return Ok(());
            }
            if recipients.len() > handle.config.max_rule_recipients {
                fail_rule(handle, tx, pass, folder_id, message_id, rule, action_idx, action,
                    RULE_ERROR_TOO_MANY_RCPTS)
                    .await?;
                return Ok(());
            }
            let addrs = recipient_addresses(recipients);
            pass.env
                .forward_message(&handle.dir, message_id, &addrs, *flavor, pass.from_address)
                .await?;
        }
        RuleAction::Delegate { recipients } => {
            if !handle.private {
                return Ok(());
            }
            if recipients.len() > handle.config.max_rule_recipients {
                fail_rule(handle, tx, pass, folder_id, message_id, rule, action_idx, action,
                    RULE_ERROR_TOO_MANY_RCPTS)
                    .await?;
                return Ok(());
            }
            let Some(mut content) = message::read_message_tx(handle, &mut *tx, message_id).await?
            else {
                return Ok(());
            };
            content.proplist.remove(PR_MID);
            content.proplist.remove(PR_SOURCE_KEY);
            content.proplist.remove(PR_CHANGE_KEY);
            content.proplist.remove(PR_PREDECESSOR_CHANGE_LIST);
            // Loop prevention: a delegated copy is never re-delegated.
            content.proplist.set(PR_DELEGATED_BY_RULE, PropValue::Bool(true));
            for addr in recipient_addresses(recipients) {
                pass.env
                    .deliver_to_mailbox(&addr, &content, pass.from_address)
                    .await?;
            }
        }
        RuleAction::Bounce { code } => {
            pass.env
                .bounce_message(&handle.dir, message_id, *code, pass.from_address, pass.account)
                .await?;
            *b_del = true;
            debug!(account = pass.account, message_id, folder_id, "message bounced by rule");
        }
        RuleAction::Tag { proptag, value } => {
            properties::set_property(handle, &mut *tx, PropTable::Message, message_id, *proptag, value)
                .await?;
        }
        RuleAction::Delete => {
            *b_del = true;
        }
        RuleAction::MarkAsRead => {
            if handle.private {
                sqlx::query("UPDATE messages SET read_state = 1 WHERE message_id = ?")
                    .bind(message_id as i64)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        RuleAction::DeferAction { .. } => {
            if handle.private && !rule.extended {
                dams.push(DamEntry {
                    rule_id: rule.id,
                    provider: rule.provider.clone(),
                    action: action.clone(),
                });
            }
        }
    }
    Ok(())
}

fn recipient_addresses(recipients: &[PropvalBag]) -> Vec<String> {
    recipients
        .iter()
        .filter_map(|r| {
            r.get(PR_SMTP_ADDRESS)
                .or_else(|| r.get(PR_EMAIL_ADDRESS))
                .and_then(|v| v.as_str().map(String::from))
        })
        .collect()
}

/// Clone the reply template, address it per flavor, hand it to submission.
/// False when the template cannot be retrieved.
async fn auto_reply<'a>(
    handle: &DbHandle,
    tx: &mut Transaction<'static, Sqlite>,
    pass: &mut RulePass<'a>,
    message_id: u64,
    template_mid: u64,
    _template_guid: uuid::Uuid,
    flavor: u32,
) -> Result<bool> {
    // Never reply to ourselves; other loop suppression is the template's
    // concern.
    if pass.from_address.eq_ignore_ascii_case(pass.account) {
        return Ok(true);
    }
    let Some(mut template) = message::read_message_tx(handle, &mut *tx, template_mid).await? else {
        return Ok(false);
    };
    template.proplist.remove(PR_MID);
    template.proplist.remove(PR_SOURCE_KEY);
    template.proplist.remove(PR_CHANGE_KEY);
    template.proplist.remove(PR_PREDECESSOR_CHANGE_LIST);
    if !template.proplist.contains(PR_SUBJECT) {
        if let Some(subject) = properties::get_property(
            handle,
            &mut *tx,
            PropTable::Message,
            message_id,
            PR_SUBJECT,
        )
        .await?
        {
            template.proplist.set(PR_SUBJECT, subject);
        }
    }
    let rcpts: Vec<String> = if flavor & REPLY_FLAVOR_NS != 0 {
        recipient_addresses(&template.recipients)
    } else {
        let mut bag = PropvalBag::new();
        bag.set(PR_RECIPIENT_TYPE, PropValue::Long(RECIPIENT_TYPE_TO as i32));
        bag.set(PR_SMTP_ADDRESS, PropValue::Unicode(pass.from_address.to_string()));
        template.recipients = vec![bag];
        vec![pass.from_address.to_string()]
    };
    if rcpts.is_empty() {
        return Ok(false);
    }
    pass.env.submit_mail(pass.account, &rcpts, &template).await?;
    Ok(true)
}

/// Disable the failing rule and leave a deferred-error message behind.
/// Extended rules are disabled without a DEM.
#[allow(clippy::too_many_arguments)]
async fn fail_rule<'a>(
    handle: &DbHandle,
    tx: &mut Transaction<'static, Sqlite>,
    pass: &mut RulePass<'a>,
    folder_id: u64,
    message_id: u64,
    rule: &LoadedRule,
    action_idx: usize,
    action: &RuleAction,
    error_code: u32,
) -> Result<()> {
    warn!(
        rule_id = rule.id,
        provider = %rule.provider,
        error_code,
        "rule action failed; disabling rule"
    );
    if rule.extended {
        let state = properties::get_property(
            handle, &mut *tx, PropTable::Message, rule.id, PR_RULE_MSG_STATE,
        )
        .await?
        .and_then(|v| v.as_int())
        .unwrap_or(0) as u32;
        properties::set_property(
            handle,
            &mut *tx,
            PropTable::Message,
            rule.id,
            PR_RULE_MSG_STATE,
            &PropValue::Long((state | RULE_STATE_ERROR) as i32),
        )
        .await?;
        return Ok(());
    }
    sqlx::query("UPDATE rules SET state = state | ? WHERE rule_id = ?")
        .bind(RULE_STATE_ERROR as i64)
        .bind(rule.id as i64)
        .execute(&mut **tx)
        .await?;
    if !handle.private {
        return Ok(());
    }
    let mut dem = MessageContent::new();
    dem.proplist
        .set(PR_MESSAGE_CLASS, PropValue::Unicode("IPM.Rule.Error".into()));
    dem.proplist.set(PR_RULE_ERROR, PropValue::Long(error_code as i32));
    dem.proplist
        .set(PR_RULE_ACTION_TYPE, PropValue::Long(action.op_code() as i32));
    dem.proplist
        .set(PR_RULE_ACTION_NUMBER, PropValue::Long(action_idx as i32));
    dem.proplist
        .set(PR_RULE_PROVIDER, PropValue::Unicode(rule.provider.clone()));
    dem.proplist
        .set(PR_RULE_ID, PropValue::I8(make_local_eid(rule.id) as i64));
    dem.proplist.set(
        PR_RULE_FOLDER_ENTRYID,
        PropValue::Binary(crate::ids::eid_to_wire(make_local_eid(folder_id)).to_vec()),
    );
    dem.proplist.set(
        PR_DAM_ORIGINAL_ENTRYID,
        PropValue::Binary(crate::ids::eid_to_wire(make_local_eid(message_id)).to_vec()),
    );
    dem.proplist
        .set(PR_MESSAGE_DELIVERY_TIME, PropValue::SysTime(nttime_now()));
    let outcome =
        message::write_message_tx(handle, tx, Some(PRIVATE_FID_DEFERRED_ACTION), None, &dem)
            .await?;
    pass.msg_list.push((PRIVATE_FID_DEFERRED_ACTION, outcome.message_id));
    Ok(())
}

/// Collapse the accumulated deferred blocks into one DAM per provider.
async fn make_deferred_action_messages<'a>(
    handle: &DbHandle,
    tx: &mut Transaction<'static, Sqlite>,
    pass: &mut RulePass<'a>,
    folder_id: u64,
    message_id: u64,
    dams: Vec<DamEntry>,
) -> Result<()> {
    if !handle.private {
        return Ok(());
    }
    let mut by_provider: Vec<(String, Vec<DamEntry>)> = Vec::new();
    for entry in dams {
        match by_provider.iter_mut().find(|(p, _)| *p == entry.provider) {
            Some((_, list)) => list.push(entry),
            None => by_provider.push((entry.provider.clone(), vec![entry])),
        }
    }
    for (provider, entries) in by_provider {
        let mut dam = MessageContent::new();
        dam.proplist
            .set(PR_MESSAGE_CLASS, PropValue::Unicode("IPM.DeferredAction".into()));
        dam.proplist.set(PR_DAM_BACK_PATCHED, PropValue::Bool(false));
        dam.proplist
            .set(PR_RULE_PROVIDER, PropValue::Unicode(provider));
        dam.proplist.set(
            PR_RULE_FOLDER_ENTRYID,
            PropValue::Binary(crate::ids::eid_to_wire(make_local_eid(folder_id)).to_vec()),
        );
        dam.proplist.set(
            PR_DAM_ORIGINAL_ENTRYID,
            PropValue::Binary(crate::ids::eid_to_wire(make_local_eid(message_id)).to_vec()),
        );
        let mut rule_ids = Vec::with_capacity(entries.len() * 8);
        for e in &entries {
            rule_ids.extend_from_slice(&make_local_eid(e.rule_id).to_le_bytes());
        }
        dam.proplist.set(PR_RULE_IDS, PropValue::Binary(rule_ids));
        let actions: Vec<&RuleAction> = entries.iter().map(|e| &e.action).collect();
        dam.proplist.set(
            PR_CLIENT_ACTIONS,
            PropValue::Binary(serde_json::to_vec(&actions).unwrap_or_default()),
        );
        dam.proplist
            .set(PR_MESSAGE_DELIVERY_TIME, PropValue::SysTime(nttime_now()));
        let outcome =
            message::write_message_tx(handle, tx, Some(PRIVATE_FID_DEFERRED_ACTION), None, &dam)
                .await?;
        pass.msg_list.push((PRIVATE_FID_DEFERRED_ACTION, outcome.message_id));
    }
    Ok(())
}

// ─── Rule management surface ─────────────────────────────────────────────────

impl DbHandle {
    /// Install a standard rule; returns the rule id.
    pub async fn add_rule(
        &self,
        folder_id: u64,
        sequence: u32,
        state: u32,
        provider: &str,
        condition: Option<&Restriction>,
        actions: &[RuleAction],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        if !folder::folder_exists(&mut tx, folder_id).await? {
            return Err(StoreError::NotFound);
        }
        let condition_text = condition
            .map(serde_json::to_string)
            .transpose()
            .map_err(|_| StoreError::InvalidParam("unserializable rule condition"))?;
        let actions_text = serde_json::to_string(actions)
            .map_err(|_| StoreError::InvalidParam("unserializable rule actions"))?;
        let rule_id: i64 = sqlx::query_scalar(
            "INSERT INTO rules (folder_id, sequence, state, provider, condition, actions) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING rule_id",
        )
        .bind(folder_id as i64)
        .bind(sequence as i64)
        .bind(state as i64)
        .bind(provider)
        .bind(condition_text)
        .bind(actions_text)
        .fetch_one(&mut *tx)
        .await?;
        properties::set_property(
            self,
            &mut tx,
            PropTable::Folder,
            folder_id,
            PR_HAS_RULES,
            &PropValue::Bool(true),
        )
        .await?;
        tx.commit().await?;
        self.touch();
        Ok(rule_id as u64)
    }

    pub async fn delete_rule(&self, rule_id: u64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("DELETE FROM rules WHERE rule_id = ?")
            .bind(rule_id as i64)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_rule_state(&self, rule_id: u64) -> Result<Option<u32>> {
        let mut conn = self.pool.acquire().await?;
        let v: Option<i64> = sqlx::query_scalar("SELECT state FROM rules WHERE rule_id = ?")
            .bind(rule_id as i64)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(v.map(|s| s as u32))
    }
}
