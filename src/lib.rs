// SPDX-License-Identifier: MIT
//! exmstore — an embeddable, Exchange-compatible per-mailbox message store.
//!
//! One SQLite database per mailbox holds folders, messages, attachments,
//! recipients, rules, permissions and per-user state; around it sit the
//! incremental-change-synchronization (ICS) engine, the in-memory
//! message-instance buffer, the rule engine and the view-table engine.
//! The RPC layer resolves a request to a mailbox directory, borrows the
//! [`db::DbHandle`] from the [`Engine`] and calls the operations exposed on
//! it; long-lived objects (open tables, instances, ICS state) live on the
//! handle and are addressed by numeric id.

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod folder;
pub mod ics;
pub mod ids;
pub mod instance;
pub mod message;
pub mod notify;
pub mod props;
pub mod rules;
pub mod search;
pub mod table;

use std::path::Path;
use std::sync::Arc;

pub use config::EngineConfig;
pub use db::{DbCache, DbHandle, ProvisionParams};
pub use error::{ErrorCode, Result, StoreError};
pub use message::delivery::DeliveryResult;
pub use message::{AttachmentContent, MessageContent};
pub use rules::env::{NullEnvironment, RuleEnvironment};

/// Process-wide engine state: the handle cache plus its eviction janitor.
pub struct Engine {
    config: Arc<EngineConfig>,
    cache: Arc<DbCache>,
    janitor: tokio::task::JoinHandle<()>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let cache = DbCache::new(config.clone());
        let janitor = cache.spawn_janitor();
        Engine { config, cache, janitor }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a new mailbox directory.
    pub async fn provision(&self, dir: &Path, params: &ProvisionParams) -> Result<()> {
        DbHandle::provision(dir, self.config.clone(), params).await
    }

    /// Borrow (opening if needed) the handle for a mailbox directory.
    pub async fn open(&self, dir: &Path) -> Result<Arc<DbHandle>> {
        self.cache.get(dir).await
    }

    /// Drop a mailbox handle, releasing its connection state.
    pub async fn close(&self, dir: &Path) {
        self.cache.remove(dir).await;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}
