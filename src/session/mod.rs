//! Durable session journal on SQLite.
//!
//! One write pool with a single connection serializes every mutation; a
//! separate read pool serves queries concurrently under WAL. Every connection
//! runs with foreign keys on, WAL journaling and `synchronous = NORMAL`.
//!
//! Session aggregates (`message_count`, `total_tokens`, `total_duration_ms`,
//! `last_activity`) are maintained by triggers from the message rows and a
//! guard trigger rejects any direct write that disagrees with them. Appending
//! to an archived session is rejected by the store itself.

pub mod models;

pub use models::{
    NewMessage, SearchHit, Session, SessionOptions, SessionStatus, Snapshot, SnapshotType,
    StoredMessage, TimeoutReport,
};

use crate::registry::ModelDescriptor;
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use models::{parse_ts, ts, MessageRow, SessionRow, SnapshotPayload, SnapshotRow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Store location and pooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Read connections; writes always go through one connection.
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    /// Delete orphaned rows when the store is opened.
    pub repair_orphans_on_open: bool,
    pub default_idle_timeout_s: u64,
    pub default_hard_timeout_s: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/sessions.db"),
            pool_size: 4,
            busy_timeout_ms: 5_000,
            repair_orphans_on_open: true,
            default_idle_timeout_s: 1_800,
            default_hard_timeout_s: 86_400,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, n: u32) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_orphan_repair(mut self, on: bool) -> Self {
        self.repair_orphans_on_open = on;
        self
    }

    /// Connection options shared by both pools.
    pub fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .pragma("temp_store", "MEMORY")
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    write_pool: SqlitePool,
    read_pool: SqlitePool,
    config: StoreConfig,
}

impl SessionStore {
    /// Open (creating if needed) the store, run migrations and, when
    /// configured, repair orphaned rows.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = config.connect_options();
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.clone())
            .await?;
        // Schema must exist before readers connect.
        sqlx::migrate!("./migrations").run(&write_pool).await?;
        let read_pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self {
            write_pool,
            read_pool,
            config,
        };

        let orphans = store.check_orphans().await?;
        if orphans > 0 {
            if store.config.repair_orphans_on_open {
                let removed = store.fix_orphans().await?;
                tracing::warn!(event = "orphans_repaired", removed, "removed orphaned messages on open");
            } else {
                tracing::warn!(event = "orphans_found", orphans, "store has orphaned messages; run fix_orphans");
            }
        }
        tracing::info!(
            event = "session_store_open",
            path = %store.config.path.display(),
            pool_size = store.config.pool_size,
            "session store ready"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn close(&self) {
        let _ = sqlx::query("PRAGMA optimize").execute(&self.write_pool).await;
        self.write_pool.close().await;
        self.read_pool.close().await;
    }

    pub async fn create_session(
        &self,
        descriptor: &ModelDescriptor,
        options: SessionOptions,
    ) -> Result<String> {
        let mut tx = self.write_pool.begin().await?;
        let id = self.insert_session(&mut tx, descriptor, &options).await?;
        tx.commit().await?;
        tracing::debug!(event = "session_created", session_id = %id, model_id = %descriptor.id);
        Ok(id)
    }

    async fn insert_session(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        descriptor: &ModelDescriptor,
        options: &SessionOptions,
    ) -> Result<String> {
        let idle = options.idle_timeout_s.unwrap_or(self.config.default_idle_timeout_s);
        let hard = options.hard_timeout_s.unwrap_or(self.config.default_hard_timeout_s);
        if idle == 0 || hard == 0 {
            return Err(Error::invalid_request("session timeouts must be positive"));
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(hard as i64);
        sqlx::query(
            r#"
            INSERT INTO sessions (
              session_id, created_at, updated_at, model_id, model_name, title,
              last_activity, status, idle_timeout_s, hard_timeout_s, expires_at
            ) VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?2, 'active', ?6, ?7, ?8)
            "#,
        )
        .bind(&id)
        .bind(ts(now))
        .bind(&descriptor.id)
        .bind(descriptor.name())
        .bind(&options.title)
        .bind(idle as i64)
        .bind(hard as i64)
        .bind(ts(expires))
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.read_pool)
            .await?;
        row.ok_or_else(|| Error::not_found(format!("session '{}' not found", session_id)))?
            .try_into()
    }

    /// Append one message atomically, assigning the next sequence number.
    pub async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<i64> {
        let mut tx = self.write_pool.begin().await?;
        writable(&mut tx, session_id).await?;
        let (message_id, seq) = insert_message(&mut tx, session_id, &message).await?;
        tx.commit().await?;
        tracing::debug!(
            event = "message_appended",
            session_id = %session_id,
            message_id,
            sequence_number = seq,
            role = message.role.as_str()
        );
        Ok(message_id)
    }

    /// Write a whole exchange in one transaction: the session is created
    /// when `session_id` is `None`, then every message is appended in order.
    /// On any failure nothing of the exchange is kept.
    ///
    /// Returns the session id and the new message ids.
    pub async fn append_exchange(
        &self,
        session_id: Option<&str>,
        descriptor: &ModelDescriptor,
        options: SessionOptions,
        messages: Vec<NewMessage>,
    ) -> Result<(String, Vec<i64>)> {
        let mut tx = self.write_pool.begin().await?;
        let id = match session_id {
            Some(id) => {
                writable(&mut tx, id).await?;
                id.to_string()
            }
            None => self.insert_session(&mut tx, descriptor, &options).await?,
        };
        let mut ids = Vec::with_capacity(messages.len());
        for message in &messages {
            let (message_id, _) = insert_message(&mut tx, &id, message).await?;
            ids.push(message_id);
        }
        tx.commit().await?;
        tracing::debug!(
            event = "exchange_appended",
            session_id = %id,
            created = session_id.is_none(),
            messages = ids.len()
        );
        Ok((id, ids))
    }

    /// All messages of a session in sequence order.
    pub async fn get_history(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        self.get_session(session_id).await?;
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE session_id = ?1 ORDER BY sequence_number",
        )
        .bind(session_id)
        .fetch_all(&self.read_pool)
        .await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Most recently active first.
    pub async fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            ORDER BY last_activity DESC, created_at DESC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.read_pool)
        .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    /// Full-text search over message content. Query terms are matched
    /// literally (all terms must appear); FTS operators are not interpreted.
    pub async fn search(&self, query: &str, limit: u32, offset: u32) -> Result<Vec<SearchHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let hits = sqlx::query_as::<_, SearchHit>(
            r#"
            SELECT m.session_id, m.message_id, m.sequence_number, m.role,
                   snippet(messages_fts, 0, '[', ']', '...', 12) AS snippet,
                   bm25(messages_fts) AS rank
            FROM messages_fts
            JOIN messages m ON m.message_id = messages_fts.rowid
            WHERE messages_fts MATCH ?1
            ORDER BY rank, m.message_id
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(fts)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(hits)
    }

    pub async fn set_metadata(&self, session_id: &str, key: &str, value: &Value) -> Result<()> {
        let mut tx = self.write_pool.begin().await?;
        session_status(&mut tx, session_id).await?;
        sqlx::query(
            r#"
            INSERT INTO session_metadata (session_id, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT (session_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(session_id)
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_metadata(&self, session_id: &str, key: &str) -> Result<Option<Value>> {
        let raw: Option<(String,)> =
            sqlx::query_as("SELECT value FROM session_metadata WHERE session_id = ?1 AND key = ?2")
                .bind(session_id)
                .bind(key)
                .fetch_optional(&self.read_pool)
                .await?;
        match raw {
            Some((s,)) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Capture the session, its messages and metadata. Returns the snapshot id.
    pub async fn snapshot(&self, session_id: &str, kind: SnapshotType) -> Result<String> {
        let mut tx = self.write_pool.begin().await?;
        let id = write_snapshot(&mut tx, session_id, kind).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Take a `pre-archive` snapshot, then mark the session archived.
    pub async fn archive(&self, session_id: &str) -> Result<String> {
        let mut tx = self.write_pool.begin().await?;
        if session_status(&mut tx, session_id).await? == SessionStatus::Archived {
            return Err(Error::invalid_request(format!(
                "session '{}' is already archived",
                session_id
            )));
        }
        let snapshot_id = write_snapshot(&mut tx, session_id, SnapshotType::PreArchive).await?;
        sqlx::query("UPDATE sessions SET status = 'archived', updated_at = ?2 WHERE session_id = ?1")
            .bind(session_id)
            .bind(ts(Utc::now()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(event = "session_archived", session_id = %session_id, snapshot_id = %snapshot_id);
        Ok(snapshot_id)
    }

    pub async fn list_snapshots(&self, session_id: &str) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT snapshot_id, session_id, snapshot_type, created_at, checksum
            FROM session_snapshots WHERE session_id = ?1
            ORDER BY created_at, snapshot_id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.read_pool)
        .await?;
        rows.into_iter().map(Snapshot::try_from).collect()
    }

    /// Recreate a snapshot as a new active session. Returns the new session id.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<String> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT payload, checksum FROM session_snapshots WHERE snapshot_id = ?1",
        )
        .bind(snapshot_id)
        .fetch_optional(&self.read_pool)
        .await?;
        let (payload, checksum) =
            row.ok_or_else(|| Error::not_found(format!("snapshot '{}' not found", snapshot_id)))?;
        if sha256_hex(&payload) != checksum {
            return Err(Error::data_integrity(format!(
                "snapshot '{}' checksum mismatch",
                snapshot_id
            )));
        }
        let snap: SnapshotPayload = serde_json::from_str(&payload)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let s = &snap.session;
        let mut tx = self.write_pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sessions (
              session_id, created_at, updated_at, model_id, model_name, title,
              last_activity, status, idle_timeout_s, hard_timeout_s, expires_at
            ) VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?2, 'active', ?6, ?7, ?8)
            "#,
        )
        .bind(&id)
        .bind(ts(now))
        .bind(&s.model_id)
        .bind(&s.model_name)
        .bind(&s.title)
        .bind(s.idle_timeout_s)
        .bind(s.hard_timeout_s)
        .bind(ts(now + ChronoDuration::seconds(s.hard_timeout_s)))
        .execute(&mut *tx)
        .await?;
        for m in &snap.messages {
            sqlx::query(
                r#"
                INSERT INTO messages (
                  session_id, sequence_number, role, content, tokens_used, duration_ms, timestamp, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&id)
            .bind(m.sequence_number)
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(m.tokens_used)
            .bind(m.duration_ms)
            .bind(ts(m.timestamp))
            .bind(serde_json::to_string(&Value::Object(m.metadata.clone()))?)
            .execute(&mut *tx)
            .await?;
        }
        for (key, value) in &snap.metadata {
            sqlx::query("INSERT INTO session_metadata (session_id, key, value) VALUES (?1, ?2, ?3)")
                .bind(&id)
                .bind(key)
                .bind(serde_json::to_string(value)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(
            event = "snapshot_restored",
            snapshot_id = %snapshot_id,
            from_session = %s.session_id,
            session_id = %id
        );
        Ok(id)
    }

    /// Remove a session and, by cascade, everything it owns.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.write_pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("session '{}' not found", session_id)));
        }
        Ok(())
    }

    /// Messages whose session no longer exists.
    pub async fn check_orphans(&self) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages m
            WHERE NOT EXISTS (SELECT 1 FROM sessions s WHERE s.session_id = m.session_id)
            "#,
        )
        .fetch_one(&self.read_pool)
        .await?;
        Ok(n as u64)
    }

    /// Delete orphaned messages (and orphaned metadata/snapshot rows).
    /// Returns the number of messages removed.
    pub async fn fix_orphans(&self) -> Result<u64> {
        let mut tx = self.write_pool.begin().await?;
        let messages = sqlx::query(
            "DELETE FROM messages WHERE session_id NOT IN (SELECT session_id FROM sessions)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let metadata = sqlx::query(
            "DELETE FROM session_metadata WHERE session_id NOT IN (SELECT session_id FROM sessions)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let snapshots = sqlx::query(
            "DELETE FROM session_snapshots WHERE session_id NOT IN (SELECT session_id FROM sessions)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        if messages + metadata + snapshots > 0 {
            tracing::warn!(event = "fix_orphans", messages, metadata, snapshots, "orphaned rows removed");
        }
        Ok(messages)
    }

    /// Delete archived sessions last touched more than `retention_days` ago.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let removed = sqlx::query("DELETE FROM sessions WHERE status = 'archived' AND updated_at < ?1")
            .bind(ts(cutoff))
            .execute(&self.write_pool)
            .await?
            .rows_affected();
        tracing::info!(event = "cleanup", removed, retention_days, "archived sessions purged");
        Ok(removed)
    }

    pub async fn check_timeouts(&self) -> Result<TimeoutReport> {
        self.timeouts_at(Utc::now()).await
    }

    /// Timeout report as of `now`.
    pub async fn timeouts_at(&self, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let rows: Vec<(String, String, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT session_id, status, last_activity, idle_timeout_s, expires_at
            FROM sessions WHERE status != 'archived'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.read_pool)
        .await?;
        let mut report = TimeoutReport::default();
        for (id, status, last_activity, idle_s, expires_at) in rows {
            if parse_ts("sessions.expires_at", &expires_at)? <= now {
                report.hard.push(id);
                continue;
            }
            let idle_at = parse_ts("sessions.last_activity", &last_activity)?
                + ChronoDuration::seconds(idle_s);
            if status == SessionStatus::Active.as_str() && idle_at <= now {
                report.idle.push(id);
            }
        }
        Ok(report)
    }

    /// Mark idle sessions `idle` and archive hard-expired ones.
    pub async fn apply_timeouts(&self) -> Result<TimeoutReport> {
        let report = self.check_timeouts().await?;
        for id in &report.idle {
            sqlx::query("UPDATE sessions SET status = 'idle' WHERE session_id = ?1 AND status = 'active'")
                .bind(id)
                .execute(&self.write_pool)
                .await?;
        }
        for id in &report.hard {
            match self.archive(id).await {
                Ok(_) => {}
                // Archived concurrently.
                Err(e) if e.kind() == crate::error_kind::ErrorKind::InvalidRequest => {}
                Err(e) => return Err(e),
            }
        }
        if !report.is_empty() {
            tracing::info!(
                event = "timeouts_applied",
                idle = report.idle.len(),
                hard = report.hard.len()
            );
        }
        Ok(report)
    }
}

async fn session_status(tx: &mut Transaction<'_, Sqlite>, session_id: &str) -> Result<SessionStatus> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM sessions WHERE session_id = ?1")
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some((s,)) => s.parse(),
        None => Err(Error::not_found(format!("session '{}' not found", session_id))),
    }
}

/// Reject archived sessions and wake idle ones.
async fn writable(tx: &mut Transaction<'_, Sqlite>, session_id: &str) -> Result<()> {
    let status = session_status(tx, session_id).await?;
    if status == SessionStatus::Archived {
        return Err(Error::invalid_request(format!(
            "session '{}' is archived",
            session_id
        )));
    }
    if status == SessionStatus::Idle {
        sqlx::query("UPDATE sessions SET status = 'active' WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    message: &NewMessage,
) -> Result<(i64, i64)> {
    let tokens = message
        .tokens_used
        .map(i64::try_from)
        .transpose()
        .map_err(|_| Error::invalid_request("tokens_used out of range"))?;
    let duration = message
        .duration_ms
        .map(i64::try_from)
        .transpose()
        .map_err(|_| Error::invalid_request("duration_ms out of range"))?;
    let metadata = serde_json::to_string(&Value::Object(message.metadata.clone()))?;
    let row: (i64, i64) = sqlx::query_as(
        r#"
        INSERT INTO messages (
          session_id, sequence_number, role, content, tokens_used, duration_ms, timestamp, metadata
        )
        SELECT ?1, COALESCE(MAX(sequence_number), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7
        FROM messages WHERE session_id = ?1
        RETURNING message_id, sequence_number
        "#,
    )
    .bind(session_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(tokens)
    .bind(duration)
    .bind(ts(Utc::now()))
    .bind(metadata)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row)
}

async fn write_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    kind: SnapshotType,
) -> Result<String> {
    let session: Session = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = ?1")
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::not_found(format!("session '{}' not found", session_id)))?
        .try_into()?;
    let messages = sqlx::query_as::<_, MessageRow>(
        "SELECT * FROM messages WHERE session_id = ?1 ORDER BY sequence_number",
    )
    .bind(session_id)
    .fetch_all(&mut **tx)
    .await?
    .into_iter()
    .map(StoredMessage::try_from)
    .collect::<Result<Vec<_>>>()?;
    let mut metadata = Map::new();
    let pairs: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM session_metadata WHERE session_id = ?1")
            .bind(session_id)
            .fetch_all(&mut **tx)
            .await?;
    for (k, v) in pairs {
        metadata.insert(k, serde_json::from_str(&v)?);
    }

    let payload = serde_json::to_string(&SnapshotPayload {
        session,
        messages,
        metadata,
    })?;
    let checksum = sha256_hex(&payload);
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO session_snapshots (snapshot_id, session_id, snapshot_type, created_at, payload, checksum)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&id)
    .bind(session_id)
    .bind(kind.as_str())
    .bind(ts(Utc::now()))
    .bind(&payload)
    .bind(&checksum)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

fn sha256_hex(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Quote each whitespace-separated term so user input cannot inject FTS syntax.
fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(StoreConfig::at(dir.path().join("s.db")))
            .await
            .unwrap();
        (dir, store)
    }

    fn model() -> ModelDescriptor {
        ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x")
            .with_display_name("Chat A")
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("  "), None);
        assert_eq!(fts_query("rust OR"), Some("\"rust\" \"OR\"".into()));
        assert_eq!(fts_query("say \"hi\""), Some("\"say\" \"\"\"hi\"\"\"".into()));
    }

    #[tokio::test]
    async fn test_counters_follow_messages() {
        let (_dir, store) = store().await;
        let id = store.create_session(&model(), SessionOptions::new().with_title("t")).await.unwrap();
        store.append_message(&id, NewMessage::user("hi").with_tokens(Some(2))).await.unwrap();
        store
            .append_message(
                &id,
                NewMessage::assistant("hello").with_tokens(Some(5)).with_duration_ms(Some(40)),
            )
            .await
            .unwrap();
        let s = store.get_session(&id).await.unwrap();
        assert_eq!(s.message_count, 2);
        assert_eq!(s.total_tokens, 7);
        assert_eq!(s.total_duration_ms, 40);
        assert_eq!(s.model_name, "Chat A");
        let history = store.get_history(&id).await.unwrap();
        assert_eq!(s.last_activity, history[1].timestamp);
    }

    #[tokio::test]
    async fn test_archived_session_rejects_append() {
        let (_dir, store) = store().await;
        let id = store.create_session(&model(), SessionOptions::new()).await.unwrap();
        store.append_message(&id, NewMessage::user("one")).await.unwrap();
        let snap = store.archive(&id).await.unwrap();
        let err = store.append_message(&id, NewMessage::user("two")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error_kind::ErrorKind::InvalidRequest);
        let snaps = store.list_snapshots(&id).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].snapshot_id, snap);
        assert_eq!(snaps[0].snapshot_type, SnapshotType::PreArchive);
    }

    #[tokio::test]
    async fn test_metadata_upsert() {
        let (_dir, store) = store().await;
        let id = store.create_session(&model(), SessionOptions::new()).await.unwrap();
        store.set_metadata(&id, "topic", &serde_json::json!("rust")).await.unwrap();
        store.set_metadata(&id, "topic", &serde_json::json!({"v": 2})).await.unwrap();
        assert_eq!(
            store.get_metadata(&id, "topic").await.unwrap(),
            Some(serde_json::json!({"v": 2}))
        );
        assert_eq!(store.get_metadata(&id, "other").await.unwrap(), None);
        let err = store
            .set_metadata("missing", "k", &serde_json::json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error_kind::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_search_matches_terms_literally() {
        let (_dir, store) = store().await;
        let id = store.create_session(&model(), SessionOptions::new()).await.unwrap();
        store.append_message(&id, NewMessage::user("how do lifetimes work in rust")).await.unwrap();
        store.append_message(&id, NewMessage::assistant("python uses refcounting")).await.unwrap();
        let hits = store.search("rust lifetimes", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sequence_number, 1);
        assert!(store.search("NEAR(", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_snapshot_creates_active_copy() {
        let (_dir, store) = store().await;
        let id = store.create_session(&model(), SessionOptions::new()).await.unwrap();
        store.append_message(&id, NewMessage::user("a").with_tokens(Some(1))).await.unwrap();
        store.append_message(&id, NewMessage::assistant("b").with_tokens(Some(2))).await.unwrap();
        store.set_metadata(&id, "k", &serde_json::json!(true)).await.unwrap();
        let snap = store.archive(&id).await.unwrap();

        let copy = store.restore_snapshot(&snap).await.unwrap();
        assert_ne!(copy, id);
        let s = store.get_session(&copy).await.unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.message_count, 2);
        assert_eq!(s.total_tokens, 3);
        assert_eq!(store.get_metadata(&copy, "k").await.unwrap(), Some(serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_timeouts_and_cleanup() {
        let (_dir, store) = store().await;
        let short = store
            .create_session(&model(), SessionOptions::new().with_idle_timeout_s(60))
            .await
            .unwrap();
        let report = store.timeouts_at(Utc::now() + ChronoDuration::seconds(120)).await.unwrap();
        assert_eq!(report.idle, vec![short.clone()]);
        assert!(report.hard.is_empty());

        let report = store.timeouts_at(Utc::now() + ChronoDuration::days(2)).await.unwrap();
        assert_eq!(report.hard, vec![short.clone()]);

        store.archive(&short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.cleanup(0).await.unwrap(), 1);
        assert_eq!(
            store.get_session(&short).await.unwrap_err().kind(),
            crate::error_kind::ErrorKind::NotFound
        );
    }
}
