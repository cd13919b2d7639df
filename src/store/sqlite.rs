// src/store/sqlite.rs
//
// =============================================================================
// VOXLOGICA: PERSISTENT STORE (SQLite)
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite using a "hybrid relational" pattern: hot fields (status,
//   timestamps) are columns, result payloads are typed blobs.
// - One connection, owned by a dedicated I/O thread; callers enqueue
//   commands over a channel. All mutations are single-row transactions.
// - Claim protocol: atomic insert-if-absent of (id, claim_token, session);
//   the token read-back decides ownership. No advisory locks.
// - Serializable results enter a process-local memory cache synchronously,
//   then persist in the background; the cache entry is evicted once the
//   write lands. Non-serializable results stay cached for the process
//   lifetime.
// - Session heartbeats make dead cohorts detectable; startup cleanup
//   reclaims their `running` rows.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::plan::NodeId;
use crate::value::{Value, BLOB_TYPE_JSON};

use super::{ClaimOutcome, Completion, ResultStore, StoreError, StoredResult};

/// Re-poll interval for claims owned by another process cohort (SQLite has
/// no cross-process notification). In-process completions wake waiters
/// directly.
const COMPLETION_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// `running` claims older than this are reclaimed at startup.
    pub stale_claim_after: Duration,
    /// Sessions silent for longer than this count as dead.
    pub session_ttl: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            stale_claim_after: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

// -----------------------------------------------------------------------------
// I/O thread commands
// -----------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

#[derive(Debug, Clone)]
struct StateRow {
    status: String,
    error: Option<String>,
}

enum Cmd {
    PutResult {
        id: NodeId,
        data: Vec<u8>,
        data_type: String,
        metadata: Option<String>,
        reply: Reply<()>,
    },
    GetResult {
        id: NodeId,
        reply: Reply<Option<(Vec<u8>, String)>>,
    },
    HasResult {
        id: NodeId,
        reply: Reply<bool>,
    },
    TryClaim {
        id: NodeId,
        token: String,
        session: String,
        reply: Reply<ClaimOutcome>,
    },
    ReadState {
        id: NodeId,
        reply: Reply<Option<StateRow>>,
    },
    /// `error: None` marks completed, `Some` marks failed. Replies with
    /// whether the running->terminal transition happened.
    MarkTerminal {
        id: NodeId,
        error: Option<String>,
        reply: Reply<bool>,
    },
    DeleteState {
        id: NodeId,
        reply: Reply<()>,
    },
    CleanupStale {
        stale_cutoff_ms: i64,
        live_cutoff_ms: i64,
        reply: Reply<usize>,
    },
    PurgeFailed {
        reply: Reply<usize>,
    },
    PurgeAll {
        reply: Reply<usize>,
    },
    Heartbeat {
        session: String,
        now_ms: i64,
    },
}

// -----------------------------------------------------------------------------
// Memory cache
// -----------------------------------------------------------------------------

struct CacheEntry {
    value: Value,
    /// Pinned entries can never be persisted; they live as long as the
    /// process does.
    pinned: bool,
}

struct Shared {
    memory: DashMap<NodeId, CacheEntry>,
    waiters: DashMap<NodeId, Arc<Notify>>,
}

impl Shared {
    fn waiter(&self, id: &str) -> Arc<Notify> {
        self.waiters
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify(&self, id: &str) {
        if let Some(n) = self.waiters.get(id) {
            n.notify_waiters();
        }
    }
}

// -----------------------------------------------------------------------------
// SqliteStore
// -----------------------------------------------------------------------------

pub struct SqliteStore {
    cmd: mpsc::UnboundedSender<Cmd>,
    shared: Arc<Shared>,
    session_id: String,
    options: StoreOptions,
    shutdown: Arc<AtomicBool>,
}

impl SqliteStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<SqliteStore, StoreError> {
        Self::open_with(dir, StoreOptions::default())
    }

    pub fn open_with(dir: impl AsRef<Path>, options: StoreOptions) -> Result<SqliteStore, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;

        let conn = Connection::open(dir.join("voxlogica.db"))
            .map_err(|e| StoreError::Database(format!("failed to open store: {e}")))?;
        init_schema(&conn)?;

        let session_id = format!(
            "{}-{}-{}",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".into()),
            std::process::id(),
            &Uuid::new_v4().to_string()[..8]
        );

        // Register this cohort and reclaim leftovers before any worker
        // touches the state table.
        let now = Utc::now();
        sql_heartbeat(&conn, &session_id, now.timestamp_millis())?;
        let stale_cutoff = now.timestamp_millis() - options.stale_claim_after.as_millis() as i64;
        let live_cutoff = now.timestamp_millis() - options.session_ttl.as_millis() as i64;
        let reclaimed = sql_cleanup_stale(&conn, stale_cutoff, live_cutoff)?;
        if reclaimed > 0 {
            log::info!("reclaimed {reclaimed} stale claim(s) from previous runs");
        }

        let (cmd, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("voxlogica-store-io".into())
            .spawn(move || io_loop(conn, rx))
            .map_err(|e| StoreError::Io(e.to_string()))?;

        // Heartbeat off the async runtime: the store must work from plain
        // threads too.
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let cmd = cmd.clone();
            let session = session_id.clone();
            let stop = shutdown.clone();
            let interval = options.heartbeat_interval;
            std::thread::Builder::new()
                .name("voxlogica-store-heartbeat".into())
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(interval);
                        let _ = cmd.send(Cmd::Heartbeat {
                            session: session.clone(),
                            now_ms: Utc::now().timestamp_millis(),
                        });
                    }
                })
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        log::debug!("store ready at {:?} (session {session_id})", dir);
        Ok(SqliteStore {
            cmd,
            shared: Arc::new(Shared {
                memory: DashMap::new(),
                waiters: DashMap::new(),
            }),
            session_id,
            options,
            shutdown,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deletes every cached result and execution state.
    pub async fn purge_all(&self) -> Result<usize, StoreError> {
        self.shared.memory.clear();
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::PurgeAll { reply })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    fn send(&self, cmd: Cmd) -> Result<(), StoreError> {
        self.cmd.send(cmd).map_err(|_| StoreError::Closed)
    }

    async fn read_state(&self, id: &NodeId) -> Result<Option<StateRow>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::ReadState {
            id: id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn mark_terminal(&self, id: &NodeId, error: Option<String>) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::MarkTerminal {
            id: id.clone(),
            error,
            reply,
        })?;
        let transitioned = rx.await.map_err(|_| StoreError::Closed)??;
        if !transitioned {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                detail: "state is not running".into(),
            });
        }
        self.shared.notify(id);
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn put(
        &self,
        id: &NodeId,
        value: Value,
        meta: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        match value.to_blob() {
            Some(data) => {
                // Synchronous cache insert first: waiters notified of
                // completion must see the value even while the persistent
                // write is still queued.
                self.shared.memory.insert(
                    id.clone(),
                    CacheEntry {
                        value,
                        pinned: false,
                    },
                );

                let (reply, rx) = oneshot::channel();
                self.send(Cmd::PutResult {
                    id: id.clone(),
                    data,
                    data_type: BLOB_TYPE_JSON.into(),
                    metadata: meta.map(|m| m.to_string()),
                    reply,
                })?;

                // Evict the cache entry once the write lands; on write
                // failure the value stays cached so the run can finish.
                let shared = self.shared.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    match rx.await {
                        Ok(Ok(())) => {
                            shared.memory.remove_if(&id, |_, entry| !entry.pinned);
                        }
                        Ok(Err(e)) => {
                            log::warn!("background persist of {} failed: {e}", &id[..8]);
                        }
                        Err(_) => {}
                    }
                });
                Ok(())
            }
            None => {
                // Memory-cache fallback: the value is unserializable and
                // stays resident for the process lifetime.
                log::debug!("result {} is not serializable; retained in memory", &id[..8]);
                self.shared.memory.insert(
                    id.clone(),
                    CacheEntry {
                        value,
                        pinned: true,
                    },
                );
                Ok(())
            }
        }
    }

    async fn get(&self, id: &NodeId) -> Result<StoredResult, StoreError> {
        if let Some(entry) = self.shared.memory.get(id) {
            return Ok(StoredResult::Value(entry.value.clone()));
        }

        let (reply, rx) = oneshot::channel();
        self.send(Cmd::GetResult {
            id: id.clone(),
            reply,
        })?;
        if let Some((data, data_type)) = rx.await.map_err(|_| StoreError::Closed)?? {
            let value = Value::from_blob(&data, &data_type).map_err(StoreError::Database)?;
            return Ok(StoredResult::Value(value));
        }

        match self.read_state(id).await? {
            Some(row) if row.status == "failed" => {
                Ok(StoredResult::Failed(row.error.unwrap_or_default()))
            }
            _ => Ok(StoredResult::Missing),
        }
    }

    async fn exists(&self, id: &NodeId) -> Result<bool, StoreError> {
        if self.shared.memory.contains_key(id) {
            return Ok(true);
        }
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::HasResult {
            id: id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn try_claim(&self, id: &NodeId) -> Result<ClaimOutcome, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::TryClaim {
            id: id.clone(),
            token: Uuid::new_v4().to_string(),
            session: self.session_id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn mark_completed(&self, id: &NodeId) -> Result<(), StoreError> {
        self.mark_terminal(id, None).await
    }

    async fn mark_failed(&self, id: &NodeId, message: &str) -> Result<(), StoreError> {
        self.mark_terminal(id, Some(message.to_string())).await
    }

    async fn wait_for_completion(&self, id: &NodeId) -> Result<Completion, StoreError> {
        loop {
            let notify = self.shared.waiter(id);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before the state read so an in-process completion
            // between the read and the await is not lost.
            notified.as_mut().enable();

            match self.read_state(id).await? {
                Some(row) if row.status == "completed" => {
                    let value = match self.get(id).await? {
                        StoredResult::Value(v) => Some(v),
                        _ => None,
                    };
                    return Ok(Completion::Completed(value));
                }
                Some(row) if row.status == "failed" => {
                    return Ok(Completion::Failed(row.error.unwrap_or_default()));
                }
                _ => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(COMPLETION_POLL) => {}
            }
        }
    }

    async fn release(&self, id: &NodeId) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::DeleteState {
            id: id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)??;
        self.shared.notify(id);
        Ok(())
    }

    async fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale_cutoff =
            now.timestamp_millis() - self.options.stale_claim_after.as_millis() as i64;
        let live_cutoff = now.timestamp_millis() - self.options.session_ttl.as_millis() as i64;
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::CleanupStale {
            stale_cutoff_ms: stale_cutoff,
            live_cutoff_ms: live_cutoff,
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn purge_failed(&self) -> Result<usize, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::PurgeFailed { reply })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }
}

// -----------------------------------------------------------------------------
// I/O thread
// -----------------------------------------------------------------------------

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    // DELETE journal mode avoids WAL sidecar files on shared filesystems;
    // the busy timeout covers contention from concurrent cohorts.
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=10000;",
    )
    .map_err(sql_err)?;

    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS results (
            id TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            data_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS execution_state (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
            claim_token TEXT,
            session_id TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS session_state (
            session_id TEXT PRIMARY KEY,
            last_heartbeat INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_state_status ON execution_state(status);
        COMMIT;",
    )
    .map_err(sql_err)
}

fn io_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<Cmd>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Cmd::PutResult {
                id,
                data,
                data_type,
                metadata,
                reply,
            } => {
                let size = data.len() as i64;
                let res = conn
                    .execute(
                        "INSERT INTO results (id, data, data_type, created_at, size_bytes, metadata)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(id) DO NOTHING",
                        params![
                            id,
                            data,
                            data_type,
                            Utc::now().timestamp_millis(),
                            size,
                            metadata
                        ],
                    )
                    .map(|_| ())
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::GetResult { id, reply } => {
                let res = conn
                    .query_row(
                        "SELECT data, data_type FROM results WHERE id = ?1",
                        params![id],
                        |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, String>(1)?)),
                    )
                    .optional()
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::HasResult { id, reply } => {
                let res = conn
                    .query_row(
                        "SELECT 1 FROM results WHERE id = ?1",
                        params![id],
                        |_| Ok(()),
                    )
                    .optional()
                    .map(|o| o.is_some())
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::TryClaim {
                id,
                token,
                session,
                reply,
            } => {
                let res = sql_try_claim(&conn, &id, &token, &session);
                let _ = reply.send(res);
            }

            Cmd::ReadState { id, reply } => {
                let res = conn
                    .query_row(
                        "SELECT status, error_message FROM execution_state WHERE id = ?1",
                        params![id],
                        |r| {
                            Ok(StateRow {
                                status: r.get(0)?,
                                error: r.get(1)?,
                            })
                        },
                    )
                    .optional()
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::MarkTerminal { id, error, reply } => {
                let status = if error.is_some() { "failed" } else { "completed" };
                let res = conn
                    .execute(
                        "UPDATE execution_state
                         SET status = ?2, finished_at = ?3, error_message = ?4
                         WHERE id = ?1 AND status = 'running'",
                        params![id, status, Utc::now().timestamp_millis(), error],
                    )
                    .map(|n| n == 1)
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::DeleteState { id, reply } => {
                let res = conn
                    .execute("DELETE FROM execution_state WHERE id = ?1", params![id])
                    .map(|_| ())
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::CleanupStale {
                stale_cutoff_ms,
                live_cutoff_ms,
                reply,
            } => {
                let _ = reply.send(sql_cleanup_stale(&conn, stale_cutoff_ms, live_cutoff_ms));
            }

            Cmd::PurgeFailed { reply } => {
                let res = conn
                    .execute("DELETE FROM execution_state WHERE status = 'failed'", [])
                    .map_err(sql_err);
                let _ = reply.send(res);
            }

            Cmd::PurgeAll { reply } => {
                let res = (|| {
                    let a = conn.execute("DELETE FROM results", []).map_err(sql_err)?;
                    let b = conn
                        .execute("DELETE FROM execution_state", [])
                        .map_err(sql_err)?;
                    Ok(a + b)
                })();
                let _ = reply.send(res);
            }

            Cmd::Heartbeat { session, now_ms } => {
                if let Err(e) = sql_heartbeat(&conn, &session, now_ms) {
                    log::warn!("session heartbeat failed: {e}");
                }
            }
        }
    }
}

/// Insert-if-absent, then read back: the stored token decides who owns the
/// claim. Works unchanged across processes sharing the database file.
fn sql_try_claim(
    conn: &Connection,
    id: &str,
    token: &str,
    session: &str,
) -> Result<ClaimOutcome, StoreError> {
    conn.execute(
        "INSERT INTO execution_state (id, status, claim_token, session_id, started_at)
         VALUES (?1, 'running', ?2, ?3, ?4)
         ON CONFLICT(id) DO NOTHING",
        params![id, token, session, Utc::now().timestamp_millis()],
    )
    .map_err(sql_err)?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT claim_token FROM execution_state WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()
        .map_err(sql_err)?;

    if stored.as_deref() == Some(token) {
        Ok(ClaimOutcome::Claimed)
    } else {
        Ok(ClaimOutcome::AlreadyClaimed)
    }
}

fn sql_heartbeat(conn: &Connection, session: &str, now_ms: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO session_state (session_id, last_heartbeat) VALUES (?1, ?2)
         ON CONFLICT(session_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
        params![session, now_ms],
    )
    .map(|_| ())
    .map_err(sql_err)
}

fn sql_cleanup_stale(
    conn: &Connection,
    stale_cutoff_ms: i64,
    live_cutoff_ms: i64,
) -> Result<usize, StoreError> {
    conn.execute(
        "DELETE FROM execution_state
         WHERE status = 'running'
           AND (started_at < ?1
                OR session_id NOT IN (
                    SELECT session_id FROM session_state WHERE last_heartbeat >= ?2))",
        params![stale_cutoff_ms, live_cutoff_ms],
    )
    .map_err(sql_err)
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::OpaqueValue;

    fn node_id(c: char) -> NodeId {
        std::iter::repeat(c).take(64).collect()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let id = node_id('a');

        let v = Value::sequence([Value::Number(1.0), Value::String("x".into())]);
        store.put(&id, v.clone(), None).await.unwrap();

        // Visible immediately through the memory cache, and still visible
        // after the background write settles.
        assert_eq!(store.get(&id).await.unwrap(), StoredResult::Value(v.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get(&id).await.unwrap(), StoredResult::Value(v));
        assert!(store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn results_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = node_id('b');
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            store.try_claim(&id).await.unwrap();
            store.put(&id, Value::Number(7.0), None).await.unwrap();
            store.mark_completed(&id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get(&id).await.unwrap(),
            StoredResult::Value(Value::Number(7.0))
        );
        // Completed states are terminal across store lifetimes.
        assert_eq!(
            store.try_claim(&id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn claim_token_decides_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let id = node_id('c');
        assert_eq!(store.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.try_claim(&id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn double_completion_is_an_invalid_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let id = node_id('d');
        store.try_claim(&id).await.unwrap();
        store.put(&id, Value::Bool(true), None).await.unwrap();
        store.mark_completed(&id).await.unwrap();
        assert!(matches!(
            store.mark_completed(&id).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.mark_failed(&id, "late").await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn unserializable_value_is_memory_resident() {
        let dir = tempfile::tempdir().unwrap();
        let id = node_id('e');
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            let v = Value::Opaque(OpaqueValue::new("image", None, vec![1u8, 2, 3]));
            store.try_claim(&id).await.unwrap();
            store.put(&id, v, None).await.unwrap();
            store.mark_completed(&id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            // Counts as completed, value served from memory.
            assert!(matches!(
                store.get(&id).await.unwrap(),
                StoredResult::Value(Value::Opaque(_))
            ));
        }
        // A new cohort cannot see the value: completed-but-unfetchable.
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&id).await.unwrap(), StoredResult::Missing);
        assert_eq!(
            store.wait_for_completion(&id).await.unwrap(),
            Completion::Completed(None)
        );
        // Releasing the row lets the node be recomputed.
        store.release(&id).await.unwrap();
        assert_eq!(store.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn failed_state_persists_until_purged() {
        let dir = tempfile::tempdir().unwrap();
        let id = node_id('f');
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            store.try_claim(&id).await.unwrap();
            store.mark_failed(&id, "bad input").await.unwrap();
        }
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get(&id).await.unwrap(),
            StoredResult::Failed("bad input".into())
        );
        assert_eq!(store.purge_failed().await.unwrap(), 1);
        assert_eq!(store.get(&id).await.unwrap(), StoredResult::Missing);
    }

    #[tokio::test]
    async fn dead_session_claims_are_reclaimed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = node_id('9');
        {
            // Simulated crash: claim taken, never completed, store dropped.
            let store = SqliteStore::open_with(
                dir.path(),
                StoreOptions {
                    session_ttl: Duration::from_millis(1),
                    ..StoreOptions::default()
                },
            )
            .unwrap();
            store.try_claim(&id).await.unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        let store = SqliteStore::open_with(
            dir.path(),
            StoreOptions {
                session_ttl: Duration::from_millis(1),
                ..StoreOptions::default()
            },
        )
        .unwrap();
        // The dead cohort's claim was removed at startup; ours succeeds.
        assert_eq!(store.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
    }
}
