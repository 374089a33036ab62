//! Persisted session records.

use crate::types::MessageRole;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Storage format for every timestamp column.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp in {}: '{}' ({})", column, raw, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "archived" => Ok(Self::Archived),
            other => Err(Error::Storage(format!("unknown session status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotType {
    Manual,
    PreArchive,
    Periodic,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::PreArchive => "pre-archive",
            Self::Periodic => "periodic",
        }
    }
}

impl FromStr for SnapshotType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "pre-archive" => Ok(Self::PreArchive),
            "periodic" => Ok(Self::Periodic),
            other => Err(Error::Storage(format!("unknown snapshot type '{}'", other))),
        }
    }
}

/// Options for [`SessionStore::create_session`](super::SessionStore::create_session).
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub title: Option<String>,
    pub idle_timeout_s: Option<u64>,
    pub hard_timeout_s: Option<u64>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_idle_timeout_s(mut self, secs: u64) -> Self {
        self.idle_timeout_s = Some(secs);
        self
    }

    pub fn with_hard_timeout_s(mut self, secs: u64) -> Self {
        self.hard_timeout_s = Some(secs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model_id: String,
    pub model_name: String,
    pub title: Option<String>,
    pub message_count: i64,
    pub total_tokens: i64,
    pub total_duration_ms: i64,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub idle_timeout_s: i64,
    pub hard_timeout_s: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct SessionRow {
    session_id: String,
    created_at: String,
    updated_at: String,
    model_id: String,
    model_name: String,
    title: Option<String>,
    message_count: i64,
    total_tokens: i64,
    total_duration_ms: i64,
    last_activity: String,
    status: String,
    idle_timeout_s: i64,
    hard_timeout_s: i64,
    expires_at: String,
}

impl TryFrom<SessionRow> for Session {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Session {
            created_at: parse_ts("sessions.created_at", &row.created_at)?,
            updated_at: parse_ts("sessions.updated_at", &row.updated_at)?,
            last_activity: parse_ts("sessions.last_activity", &row.last_activity)?,
            expires_at: parse_ts("sessions.expires_at", &row.expires_at)?,
            status: row.status.parse()?,
            session_id: row.session_id,
            model_id: row.model_id,
            model_name: row.model_name,
            title: row.title,
            message_count: row.message_count,
            total_tokens: row.total_tokens,
            total_duration_ms: row.total_duration_ms,
            idle_timeout_s: row.idle_timeout_s,
            hard_timeout_s: row.hard_timeout_s,
        })
    }
}

/// A message to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub tokens_used: Option<u64>,
    pub duration_ms: Option<u64>,
    pub metadata: Map<String, Value>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tokens_used: None,
            duration_ms: None,
            metadata: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_tokens(mut self, tokens: Option<u64>) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_duration_ms(mut self, ms: Option<u64>) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub session_id: String,
    pub sequence_number: i64,
    pub role: MessageRole,
    pub content: String,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, FromRow)]
pub(crate) struct MessageRow {
    message_id: i64,
    session_id: String,
    sequence_number: i64,
    role: String,
    content: String,
    tokens_used: Option<i64>,
    duration_ms: Option<i64>,
    timestamp: String,
    metadata: String,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let role = row
            .role
            .parse::<MessageRole>()
            .map_err(|e| Error::Storage(format!("messages.role: {}", e)))?;
        let metadata = match serde_json::from_str::<Value>(&row.metadata)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(StoredMessage {
            timestamp: parse_ts("messages.timestamp", &row.timestamp)?,
            message_id: row.message_id,
            session_id: row.session_id,
            sequence_number: row.sequence_number,
            role,
            content: row.content,
            tokens_used: row.tokens_used,
            duration_ms: row.duration_ms,
            metadata,
        })
    }
}

/// Snapshot listing entry (payload omitted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub session_id: String,
    pub snapshot_type: SnapshotType,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, FromRow)]
pub(crate) struct SnapshotRow {
    pub(crate) snapshot_id: String,
    pub(crate) session_id: String,
    pub(crate) snapshot_type: String,
    pub(crate) created_at: String,
    pub(crate) checksum: String,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = Error;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        Ok(Snapshot {
            created_at: parse_ts("session_snapshots.created_at", &row.created_at)?,
            snapshot_type: row.snapshot_type.parse()?,
            snapshot_id: row.snapshot_id,
            session_id: row.session_id,
            checksum: row.checksum,
        })
    }
}

/// Serialized snapshot body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotPayload {
    pub(crate) session: Session,
    pub(crate) messages: Vec<StoredMessage>,
    pub(crate) metadata: Map<String, Value>,
}

/// Sessions past their idle or hard limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutReport {
    /// Active sessions whose `last_activity + idle_timeout_s` is in the past.
    pub idle: Vec<String>,
    /// Non-archived sessions whose `expires_at` is in the past.
    pub hard: Vec<String>,
}

impl TimeoutReport {
    pub fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.hard.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SearchHit {
    pub session_id: String,
    pub message_id: i64,
    pub sequence_number: i64,
    pub role: String,
    pub snippet: String,
    pub rank: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(7);
        assert_eq!(ts(a), "2026-01-02T03:04:05.000Z");
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts("x", &ts(b)).unwrap(), b);
    }

    #[test]
    fn test_status_names() {
        assert_eq!("idle".parse::<SessionStatus>().unwrap(), SessionStatus::Idle);
        assert!("gone".parse::<SessionStatus>().is_err());
        assert_eq!(SnapshotType::PreArchive.as_str(), "pre-archive");
    }
}
