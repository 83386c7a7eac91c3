//! Shared test harness: a provisioned private mailbox plus a recording
//! rule environment.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use exmstore::{
    Engine, EngineConfig, MessageContent, ProvisionParams, Result, RuleEnvironment,
};

pub const TEST_ACCOUNT: &str = "u@y.example";
pub const TEST_USER_ID: i64 = 7;

/// Records every external effect the rule engine triggers.
#[derive(Default)]
pub struct RecordingEnv {
    pub submitted: Mutex<Vec<(String, Vec<String>)>>,
    pub bounced: Mutex<Vec<(u64, u32)>>,
    pub forwarded: Mutex<Vec<(u64, Vec<String>)>>,
    pub delegated: Mutex<Vec<String>>,
}

#[async_trait]
impl RuleEnvironment for RecordingEnv {
    async fn submit_mail(
        &self,
        from: &str,
        recipients: &[String],
        _content: &MessageContent,
    ) -> Result<()> {
        self.submitted
            .lock()
            .await
            .push((from.to_string(), recipients.to_vec()));
        Ok(())
    }

    async fn bounce_message(
        &self,
        _dir: &Path,
        message_id: u64,
        code: u32,
        _from: &str,
        _account: &str,
    ) -> Result<()> {
        self.bounced.lock().await.push((message_id, code));
        Ok(())
    }

    async fn forward_message(
        &self,
        _dir: &Path,
        message_id: u64,
        recipients: &[String],
        _flavor: u32,
        _from: &str,
    ) -> Result<()> {
        self.forwarded
            .lock()
            .await
            .push((message_id, recipients.to_vec()));
        Ok(())
    }

    async fn deliver_to_mailbox(
        &self,
        target: &str,
        _content: &MessageContent,
        _from: &str,
    ) -> Result<()> {
        self.delegated.lock().await.push(target.to_string());
        Ok(())
    }

    async fn username_to_entryid(&self, username: &str) -> Option<Vec<u8>> {
        Some(format!("EX:{username}").into_bytes())
    }

    async fn entryid_to_username(&self, entryid: &[u8]) -> Option<String> {
        std::str::from_utf8(entryid)
            .ok()?
            .strip_prefix("EX:")
            .map(String::from)
    }

    async fn user_displayname(&self, username: &str) -> Option<String> {
        Some(username.split('@').next().unwrap_or(username).to_string())
    }
}

pub struct TestMailbox {
    pub engine: Engine,
    pub handle: Arc<exmstore::DbHandle>,
    pub guid: Uuid,
    pub env: RecordingEnv,
    // Held for the lifetime of the mailbox.
    _dir: tempfile::TempDir,
}

/// A provisioned empty private mailbox for user-id 7.
pub async fn private_mailbox() -> TestMailbox {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
    let dir = tempfile::tempdir().expect("tempdir");
    let guid = Uuid::new_v4();
    let engine = Engine::new(EngineConfig::default());
    engine
        .provision(
            dir.path(),
            &ProvisionParams {
                username: TEST_ACCOUNT.to_string(),
                user_id: TEST_USER_ID,
                mailbox_guid: guid,
                private: true,
            },
        )
        .await
        .expect("provision");
    let handle = engine.open(dir.path()).await.expect("open");
    TestMailbox {
        engine,
        handle,
        guid,
        env: RecordingEnv::default(),
        _dir: dir,
    }
}

/// A minimal transport message: subject + sender + one TO recipient.
pub fn simple_message(subject: &str, sender: &str, rcpt: &str) -> MessageContent {
    use exmstore::props::*;
    let mut msg = MessageContent::new();
    msg.proplist
        .set(PR_MESSAGE_CLASS, PropValue::Unicode("IPM.Note".into()));
    msg.proplist
        .set(PR_SUBJECT, PropValue::Unicode(subject.into()));
    msg.proplist
        .set(PR_SENDER_SMTP_ADDRESS, PropValue::Unicode(sender.into()));
    msg.proplist.set(
        PR_MESSAGE_FLAGS,
        PropValue::Long(MSGFLAG_UNSENT as i32),
    );
    msg.proplist
        .set(PR_BODY, PropValue::Unicode(format!("body of {subject}")));
    let mut to = PropvalBag::new();
    to.set(PR_RECIPIENT_TYPE, PropValue::Long(RECIPIENT_TYPE_TO as i32));
    to.set(PR_SMTP_ADDRESS, PropValue::Unicode(rcpt.into()));
    to.set(PR_DISPLAY_NAME, PropValue::Unicode(rcpt.split('@').next().unwrap().into()));
    msg.recipients.push(to);
    msg
}
