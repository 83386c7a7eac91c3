// SPDX-License-Identifier: MIT
//! Per-mailbox DB handles and the process-wide handle cache.
//!
//! One handle per mailbox directory, owning:
//!   - the primary pool on `exmdb.sqlite3` (WAL, single serialized connection),
//!   - a lazily created in-memory pool for materialized view tables,
//!   - the per-connection instance and table registries,
//!   - change-number / EID / content-id allocators,
//!   - the notification broadcaster.
//!
//! Handles are cached under the mailbox path and evicted by a janitor task
//! once idle past the configured TTL (or LRU once the cache is full).

pub mod properties;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::instance::InstanceRegistry;
use crate::notify::Notifier;
use crate::props::idset::IdSet;
use crate::table::TableRegistry;

pub const PRIMARY_DB: &str = "exmdb.sqlite3";

// configurations keys
pub const CFG_MAILBOX_GUID: &str = "mailbox_guid";
pub const CFG_USERNAME: &str = "username";
pub const CFG_USER_ID: &str = "user_id";
pub const CFG_PRIVATE: &str = "store_private";
pub const CFG_LAST_CN: &str = "last_change_number";
pub const CFG_LAST_EID: &str = "last_eid";
pub const CFG_LAST_CID: &str = "last_cid";
pub const CFG_SIZE_NORMAL: &str = "message_size_normal";
pub const CFG_SIZE_FAI: &str = "message_size_fai";
pub const CFG_LAST_ARTICLE: &str = "last_article_number";

/// In-memory reservation window for bulk-allocated counters.
#[derive(Debug, Default)]
struct IdReserve {
    next: u64,
    end: u64,
    /// Highest end ever reserved, so a rolled-back reservation can never
    /// lead to a reused counter within this process.
    high_water: u64,
}

pub struct ProvisionParams {
    pub username: String,
    pub user_id: i64,
    pub mailbox_guid: Uuid,
    pub private: bool,
}

pub struct DbHandle {
    pub(crate) dir: PathBuf,
    pub(crate) pool: SqlitePool,
    tables: tokio::sync::OnceCell<SqlitePool>,
    pub(crate) table_registry: Mutex<TableRegistry>,
    pub(crate) instances: Mutex<InstanceRegistry>,
    cn_reserve: Mutex<IdReserve>,
    pub(crate) notifier: Notifier,
    /// ICS state-stream assembly buffers, keyed by meta-tag proptag.
    pub(crate) ics_stream_bufs: Mutex<HashMap<u32, Vec<u8>>>,
    /// Registered ICS state slots, keyed by meta-tag proptag.
    pub(crate) ics_states: Mutex<HashMap<u32, IdSet>>,
    last_used: AtomicU64,
    pub(crate) private: bool,
    pub(crate) mailbox_guid: Uuid,
    pub(crate) username: String,
    pub(crate) user_id: i64,
    pub(crate) config: Arc<EngineConfig>,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn open_primary_pool(dir: &Path, create: bool) -> Result<SqlitePool> {
    let db_path = dir.join(PRIMARY_DB);
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .map_err(StoreError::Sql)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30))
        .create_if_missing(create);
    // One serialized connection: mutations within a handle have a total order.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in include_str!("schema.sql").split(';') {
        let stmt = stmt.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt).execute(pool).await?;
        }
    }
    Ok(())
}

impl DbHandle {
    /// Open an existing mailbox directory.
    pub async fn open(dir: &Path, config: Arc<EngineConfig>) -> Result<Arc<DbHandle>> {
        let pool = open_primary_pool(dir, false).await?;
        let guid_text: Option<String> = sqlx::query_scalar(
            "SELECT config_value FROM configurations WHERE config_key = ?",
        )
        .bind(CFG_MAILBOX_GUID)
        .fetch_optional(&pool)
        .await?;
        let mailbox_guid = guid_text
            .as_deref()
            .and_then(|g| Uuid::parse_str(g).ok())
            .ok_or(StoreError::LoginFailure)?;
        let username: String =
            sqlx::query_scalar("SELECT config_value FROM configurations WHERE config_key = ?")
                .bind(CFG_USERNAME)
                .fetch_optional(&pool)
                .await?
                .unwrap_or_default();
        let user_id: i64 =
            sqlx::query_scalar("SELECT config_value FROM configurations WHERE config_key = ?")
                .bind(CFG_USER_ID)
                .fetch_optional(&pool)
                .await?
                .unwrap_or(0);
        let private: i64 =
            sqlx::query_scalar("SELECT config_value FROM configurations WHERE config_key = ?")
                .bind(CFG_PRIVATE)
                .fetch_optional(&pool)
                .await?
                .unwrap_or(1);
        let handle = DbHandle {
            dir: dir.to_path_buf(),
            pool,
            tables: tokio::sync::OnceCell::new(),
            table_registry: Mutex::new(TableRegistry::default()),
            instances: Mutex::new(InstanceRegistry::default()),
            cn_reserve: Mutex::new(IdReserve::default()),
            notifier: Notifier::new(),
            ics_stream_bufs: Mutex::new(HashMap::new()),
            ics_states: Mutex::new(HashMap::new()),
            last_used: AtomicU64::new(unix_now()),
            private: private != 0,
            mailbox_guid,
            username,
            user_id,
            config,
        };
        debug!(dir = %dir.display(), "opened mailbox handle");
        Ok(Arc::new(handle))
    }

    /// Create and initialize a new mailbox directory: schema, configuration
    /// rows, replica mapping and the well-known folder tree.
    pub async fn provision(
        dir: &Path,
        config: Arc<EngineConfig>,
        params: &ProvisionParams,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        for sub in ["cid", "eml", "ext", "tmp"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        let pool = open_primary_pool(dir, true).await?;
        apply_schema(&pool).await?;

        let mut tx = pool.begin().await?;
        for (key, value) in [
            (CFG_MAILBOX_GUID, params.mailbox_guid.to_string()),
            (CFG_USERNAME, params.username.clone()),
        ] {
            sqlx::query("REPLACE INTO configurations (config_key, config_value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        for (key, value) in [
            (CFG_USER_ID, params.user_id),
            (CFG_PRIVATE, params.private as i64),
            (CFG_LAST_CN, 0),
            (CFG_LAST_CID, 0),
            (CFG_SIZE_NORMAL, 0),
            (CFG_SIZE_FAI, 0),
            (CFG_LAST_ARTICLE, 0),
        ] {
            sqlx::query("REPLACE INTO configurations (config_key, config_value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("REPLACE INTO replica_mapping (replid, replguid) VALUES (1, ?)")
            .bind(params.mailbox_guid.to_string())
            .execute(&mut *tx)
            .await?;

        let defaults = if params.private {
            crate::folder::private_default_folders()
        } else {
            crate::folder::public_default_folders()
        };
        let mut next_range = 0x100u64;
        for spec in defaults {
            let cur = next_range;
            let max = next_range + config.folder_eid_range;
            next_range = max;
            sqlx::query(
                "INSERT INTO folders (folder_id, parent_id, change_number, is_search, cur_eid, max_eid)
                 VALUES (?, ?, 0, 0, ?, ?)",
            )
            .bind(spec.folder_id as i64)
            .bind(spec.parent_id.map(|p| p as i64))
            .bind(cur as i64)
            .bind(max as i64)
            .execute(&mut *tx)
            .await?;
            crate::folder::write_default_folder_props(&mut tx, spec).await?;
        }
        sqlx::query("REPLACE INTO configurations (config_key, config_value) VALUES (?, ?)")
            .bind(CFG_LAST_EID)
            .bind(next_range as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        pool.close().await;
        info!(dir = %dir.display(), user = %params.username, "provisioned mailbox");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn mailbox_guid(&self) -> Uuid {
        self.mailbox_guid
    }

    pub fn owner(&self) -> &str {
        &self.username
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) fn touch(&self) {
        self.last_used.store(unix_now(), Ordering::Relaxed);
    }

    fn idle_secs(&self) -> u64 {
        unix_now().saturating_sub(self.last_used.load(Ordering::Relaxed))
    }

    /// The in-memory database holding materialized view tables.
    pub(crate) async fn tables_pool(&self) -> Result<&SqlitePool> {
        self.tables
            .get_or_try_init(|| async {
                let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(opts)
                    .await
            })
            .await
            .map_err(StoreError::Sql)
    }

    // ── Configuration helpers ────────────────────────────────────────────────

    pub(crate) async fn config_get_i64(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
    ) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT config_value FROM configurations WHERE config_key = ?")
                .bind(key)
                .fetch_optional(conn)
                .await?
                .unwrap_or(0),
        )
    }

    pub(crate) async fn config_set_i64(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        value: i64,
    ) -> Result<()> {
        sqlx::query("REPLACE INTO configurations (config_key, config_value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── Allocators ───────────────────────────────────────────────────────────

    /// Allocate one change number. Reservation happens in batches recorded
    /// in `allocated_eids`, so a crash can skip counters but never reuse one.
    pub(crate) async fn allocate_cn(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let mut reserve = self.cn_reserve.lock().await;
        if reserve.next >= reserve.end {
            let persisted = self.config_get_i64(conn, CFG_LAST_CN).await? as u64;
            let base = persisted.max(reserve.high_water);
            let end = base + self.config.cn_batch;
            self.config_set_i64(conn, CFG_LAST_CN, end as i64).await?;
            sqlx::query(
                "INSERT INTO allocated_eids (range_begin, range_end, allocate_time, is_system)
                 VALUES (?, ?, ?, 1)",
            )
            .bind((base + 1) as i64)
            .bind(end as i64)
            .bind(unix_now() as i64)
            .execute(conn)
            .await?;
            reserve.next = base + 1;
            reserve.end = end;
            reserve.high_water = end;
        }
        let cn = reserve.next;
        reserve.next += 1;
        Ok(cn)
    }

    /// Mailbox-wide object id allocation.
    pub(crate) async fn allocate_eid(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let last = self.config_get_i64(conn, CFG_LAST_EID).await? as u64;
        let eid = last + 1;
        self.config_set_i64(conn, CFG_LAST_EID, eid as i64).await?;
        sqlx::query(
            "INSERT INTO allocated_eids (range_begin, range_end, allocate_time, is_system)
             VALUES (?, ?, ?, 0)",
        )
        .bind(eid as i64)
        .bind(eid as i64)
        .bind(unix_now() as i64)
        .execute(conn)
        .await?;
        Ok(eid)
    }

    /// Object id allocation biased to the folder's reserved range, keeping
    /// sibling objects adjacent. Falls back to the mailbox-wide allocator
    /// when the folder range is exhausted.
    pub(crate) async fn allocate_eid_from_folder(
        &self,
        conn: &mut SqliteConnection,
        folder_id: u64,
    ) -> Result<u64> {
        let row = sqlx::query("SELECT cur_eid, max_eid FROM folders WHERE folder_id = ?")
            .bind(folder_id as i64)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::NotFound);
        };
        let cur: i64 = row.get(0);
        let max: i64 = row.get(1);
        if cur >= max {
            return self.allocate_eid(conn).await;
        }
        sqlx::query("UPDATE folders SET cur_eid = cur_eid + 1 WHERE folder_id = ?")
            .bind(folder_id as i64)
            .execute(conn)
            .await?;
        Ok(cur as u64 + 1)
    }

    pub(crate) async fn allocate_cid(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let last = self.config_get_i64(conn, CFG_LAST_CID).await? as u64;
        let cid = last + 1;
        self.config_set_i64(conn, CFG_LAST_CID, cid as i64).await?;
        Ok(cid)
    }

    /// Resolve a replica GUID to its replid, registering a new mapping if
    /// this GUID has not been seen before.
    pub(crate) async fn get_or_create_replid(
        &self,
        conn: &mut SqliteConnection,
        guid: Uuid,
    ) -> Result<u16> {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT replid FROM replica_mapping WHERE replguid = ?")
                .bind(guid.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(replid) = existing {
            return Ok(replid as u16);
        }
        let max: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(replid), 2) FROM replica_mapping")
                .fetch_one(&mut *conn)
                .await?;
        let replid = (max + 1) as u16;
        sqlx::query("INSERT INTO replica_mapping (replid, replguid) VALUES (?, ?)")
            .bind(replid as i64)
            .bind(guid.to_string())
            .execute(conn)
            .await?;
        Ok(replid)
    }

    pub(crate) async fn replid_to_guid(
        &self,
        conn: &mut SqliteConnection,
        replid: u16,
    ) -> Result<Option<Uuid>> {
        if replid == 1 {
            return Ok(Some(self.mailbox_guid));
        }
        let text: Option<String> =
            sqlx::query_scalar("SELECT replguid FROM replica_mapping WHERE replid = ?")
                .bind(replid as i64)
                .fetch_optional(conn)
                .await?;
        Ok(text.and_then(|t| Uuid::parse_str(&t).ok()))
    }

    // ── Store size accounting ────────────────────────────────────────────────

    pub(crate) async fn adjust_store_size(
        &self,
        conn: &mut SqliteConnection,
        normal_delta: i64,
        fai_delta: i64,
    ) -> Result<()> {
        for (key, delta) in [(CFG_SIZE_NORMAL, normal_delta), (CFG_SIZE_FAI, fai_delta)] {
            if delta != 0 {
                sqlx::query(
                    "UPDATE configurations SET config_value = MAX(0, config_value + ?)
                     WHERE config_key = ?",
                )
                .bind(delta)
                .bind(key)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn store_size(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let normal = self.config_get_i64(conn, CFG_SIZE_NORMAL).await? as u64;
        let fai = self.config_get_i64(conn, CFG_SIZE_FAI).await? as u64;
        Ok(normal + fai)
    }

    // ── Store property surface ───────────────────────────────────────────────

    pub async fn get_store_property(
        &self,
        proptag: u32,
    ) -> Result<Option<crate::props::PropValue>> {
        let mut conn = self.pool.acquire().await?;
        properties::get_property(self, &mut conn, properties::PropTable::Store, 0, proptag).await
    }

    pub async fn set_store_property(
        &self,
        proptag: u32,
        value: &crate::props::PropValue,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        properties::set_property(self, &mut conn, properties::PropTable::Store, 0, proptag, value)
            .await
    }

    /// Release everything held for a closing connection: open instances and
    /// materialized tables.
    pub async fn release_connection_state(&self) {
        self.instances.lock().await.clear();
        let mut registry = self.table_registry.lock().await;
        if registry.is_empty() {
            return;
        }
        if let Ok(tables) = self.tables_pool().await {
            for table_id in registry.table_ids() {
                let _ = sqlx::query(&format!("DROP TABLE IF EXISTS t{table_id}"))
                    .execute(tables)
                    .await;
            }
        }
        registry.clear();
    }
}

/// Process-wide cache of mailbox handles.
pub struct DbCache {
    config: Arc<EngineConfig>,
    handles: Mutex<HashMap<PathBuf, Arc<DbHandle>>>,
}

impl DbCache {
    pub fn new(config: Arc<EngineConfig>) -> Arc<Self> {
        Arc::new(DbCache {
            config,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Get or open the handle for a mailbox directory.
    pub async fn get(&self, dir: &Path) -> Result<Arc<DbHandle>> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(dir) {
            handle.touch();
            return Ok(handle.clone());
        }
        if handles.len() >= self.config.cache_size {
            Self::evict_lru(&mut handles).await;
        }
        let handle = DbHandle::open(dir, self.config.clone()).await?;
        handles.insert(dir.to_path_buf(), handle.clone());
        Ok(handle)
    }

    pub async fn remove(&self, dir: &Path) {
        if let Some(handle) = self.handles.lock().await.remove(dir) {
            handle.release_connection_state().await;
            handle.pool.close().await;
        }
    }

    async fn evict_lru(handles: &mut HashMap<PathBuf, Arc<DbHandle>>) {
        let victim = handles
            .iter()
            .min_by_key(|(_, h)| h.last_used.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            if let Some(handle) = handles.remove(&key) {
                debug!(dir = %key.display(), "evicting LRU mailbox handle");
                handle.release_connection_state().await;
                handle.pool.close().await;
            }
        }
    }

    /// Evict handles idle past the TTL. Called by the janitor.
    pub async fn sweep_idle(&self) {
        let ttl = self.config.handle_ttl_secs;
        let mut handles = self.handles.lock().await;
        let expired: Vec<PathBuf> = handles
            .iter()
            .filter(|(_, h)| h.idle_secs() > ttl && Arc::strong_count(h) == 1)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(handle) = handles.remove(&key) {
                debug!(dir = %key.display(), "evicting idle mailbox handle");
                handle.release_connection_state().await;
                handle.pool.close().await;
            }
        }
    }

    /// Background eviction task; aborts when the returned handle is dropped.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = std::time::Duration::from_secs(self.config.handle_ttl_secs.clamp(30, 600));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.sweep_idle().await;
            }
        })
    }
}

/// Open a short-lived in-memory scratch connection (view-table builds).
pub(crate) async fn open_scratch() -> Result<SqliteConnection> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::Sql)?;
    SqliteConnection::connect_with(&opts)
        .await
        .map_err(StoreError::Sql)
}

/// Open (creating on first use) the bookmark database `tmp/state.sqlite3`.
pub(crate) async fn open_state_db(dir: &Path) -> Result<SqliteConnection> {
    let path = dir.join("tmp").join("state.sqlite3");
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(StoreError::Sql)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Off)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Off)
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&opts).await?;
    let create = "CREATE TABLE IF NOT EXISTS state_info \
                  (state_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                  folder_id INTEGER NOT NULL, \
                  table_flags INTEGER NOT NULL, \
                  sorts BLOB, \
                  message_id INTEGER DEFAULT NULL, \
                  inst_num INTEGER DEFAULT NULL, \
                  header_id INTEGER DEFAULT NULL, \
                  header_stat INTEGER DEFAULT NULL)";
    if let Err(e) = sqlx::query(create).execute(&mut conn).await {
        warn!(err = %e, "state db init failed");
        return Err(e.into());
    }
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS state_index ON state_info \
         (folder_id, table_flags, sorts)",
    )
    .execute(&mut conn)
    .await?;
    Ok(conn)
}
