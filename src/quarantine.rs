//! Caller quarantine state.
//!
//! A quarantined caller is denied everything until an administrator
//! releases it. Re-quarantining an active caller updates the existing
//! episode instead of opening a new one. Episodes are never deleted.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::risk::RiskLevel;

/// Quarantine store errors.
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// The caller has no active quarantine.
    #[error("caller {0} is not quarantined")]
    NotQuarantined(String),
    /// The backing database failed.
    #[error("quarantine storage error: {0}")]
    Storage(#[from] sqlx::Error),
    /// A stored row could not be interpreted.
    #[error("corrupt quarantine record: {0}")]
    Corrupt(String),
}

/// One quarantine episode for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantineRecord {
    /// Quarantined caller.
    pub caller_id: String,
    /// Most recent reason.
    pub reason: String,
    /// Highest risk level seen during the episode.
    pub risk_level: RiskLevel,
    /// When the episode started.
    pub entered_at: DateTime<Utc>,
    /// Last time the episode was touched.
    pub updated_at: DateTime<Utc>,
    /// Number of quarantine verdicts during the episode.
    pub strikes: u32,
    /// Set once released.
    pub released_at: Option<DateTime<Utc>>,
    /// Who released it.
    pub released_by: Option<String>,
}

impl QuarantineRecord {
    /// Fresh episode starting now.
    pub fn new(caller_id: &str, reason: &str, risk_level: RiskLevel) -> Self {
        let now = Utc::now();
        Self {
            caller_id: caller_id.to_owned(),
            reason: reason.to_owned(),
            risk_level,
            entered_at: now,
            updated_at: now,
            strikes: 1,
            released_at: None,
            released_by: None,
        }
    }

    /// True until released.
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    /// Fold another quarantine verdict into this active episode.
    fn strike(&mut self, reason: &str, risk_level: RiskLevel) {
        self.reason = reason.to_owned();
        self.risk_level = self.risk_level.max(risk_level);
        self.strikes = self.strikes.saturating_add(1);
        self.updated_at = Utc::now();
    }
}

/// Persistence for quarantine episodes.
///
/// `upsert` must be atomic per caller: concurrent quarantines of the same
/// caller produce one active episode with every strike counted.
#[async_trait]
pub trait QuarantineStore: Send + Sync {
    /// Active episode for `caller_id`, if any.
    async fn get(&self, caller_id: &str) -> Result<Option<QuarantineRecord>, QuarantineError>;

    /// Open an episode, or strike the active one.
    async fn upsert(
        &self,
        caller_id: &str,
        reason: &str,
        risk_level: RiskLevel,
    ) -> Result<QuarantineRecord, QuarantineError>;

    /// Close the active episode.
    async fn release(
        &self,
        caller_id: &str,
        released_by: &str,
    ) -> Result<QuarantineRecord, QuarantineError>;

    /// Every episode for `caller_id`, oldest first.
    async fn history(&self, caller_id: &str) -> Result<Vec<QuarantineRecord>, QuarantineError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Store kept in process memory. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryQuarantineStore {
    episodes: DashMap<String, Vec<QuarantineRecord>>,
}

impl InMemoryQuarantineStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuarantineStore for InMemoryQuarantineStore {
    async fn get(&self, caller_id: &str) -> Result<Option<QuarantineRecord>, QuarantineError> {
        Ok(self
            .episodes
            .get(caller_id)
            .and_then(|episodes| episodes.last().filter(|r| r.is_active()).cloned()))
    }

    async fn upsert(
        &self,
        caller_id: &str,
        reason: &str,
        risk_level: RiskLevel,
    ) -> Result<QuarantineRecord, QuarantineError> {
        // The entry guard holds the shard lock for this caller.
        let mut episodes = self.episodes.entry(caller_id.to_owned()).or_default();
        if let Some(active) = episodes.last_mut().filter(|r| r.is_active()) {
            active.strike(reason, risk_level);
            return Ok(active.clone());
        }
        let record = QuarantineRecord::new(caller_id, reason, risk_level);
        episodes.push(record.clone());
        Ok(record)
    }

    async fn release(
        &self,
        caller_id: &str,
        released_by: &str,
    ) -> Result<QuarantineRecord, QuarantineError> {
        let not_quarantined = || QuarantineError::NotQuarantined(caller_id.to_owned());
        let mut episodes = self.episodes.get_mut(caller_id).ok_or_else(not_quarantined)?;
        let active = episodes
            .last_mut()
            .filter(|r| r.is_active())
            .ok_or_else(not_quarantined)?;
        let now = Utc::now();
        active.released_at = Some(now);
        active.released_by = Some(released_by.to_owned());
        active.updated_at = now;
        Ok(active.clone())
    }

    async fn history(&self, caller_id: &str) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        Ok(self
            .episodes
            .get(caller_id)
            .map(|episodes| episodes.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const COLUMNS: &str =
    "caller_id, reason, risk_level, entered_at, updated_at, strikes, released_at, released_by";

type Row = (
    String,
    String,
    i64,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
);

/// Store persisted in a SQLite database.
///
/// A partial unique index allows one active row per caller, so the upsert
/// is a single `INSERT ... ON CONFLICT DO UPDATE` statement.
#[derive(Debug, Clone)]
pub struct SqliteQuarantineStore {
    pool: SqlitePool,
}

impl SqliteQuarantineStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create quarantine db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open quarantine db at {}", path.display()))?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn in_memory() -> anyhow::Result<Self> {
        // A single connection keeps every query on the same memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory quarantine db")?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> anyhow::Result<Self> {
        let migration_sql = include_str!("../migrations/001_quarantine.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply quarantine schema migration")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl QuarantineStore for SqliteQuarantineStore {
    async fn get(&self, caller_id: &str) -> Result<Option<QuarantineRecord>, QuarantineError> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM quarantine WHERE caller_id = ?1 AND released_at IS NULL"
        ))
        .bind(caller_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(from_row).transpose()
    }

    async fn upsert(
        &self,
        caller_id: &str,
        reason: &str,
        risk_level: RiskLevel,
    ) -> Result<QuarantineRecord, QuarantineError> {
        let now = Utc::now().to_rfc3339();
        let row: Row = sqlx::query_as(&format!(
            "INSERT INTO quarantine (caller_id, reason, risk_level, entered_at, updated_at, strikes)
             VALUES (?1, ?2, ?3, ?4, ?4, 1)
             ON CONFLICT (caller_id) WHERE released_at IS NULL DO UPDATE SET
                reason = excluded.reason,
                risk_level = MAX(risk_level, excluded.risk_level),
                updated_at = excluded.updated_at,
                strikes = strikes + 1
             RETURNING {COLUMNS}"
        ))
        .bind(caller_id)
        .bind(reason)
        .bind(rank(risk_level))
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        from_row(row)
    }

    async fn release(
        &self,
        caller_id: &str,
        released_by: &str,
    ) -> Result<QuarantineRecord, QuarantineError> {
        let now = Utc::now().to_rfc3339();
        let row: Option<Row> = sqlx::query_as(&format!(
            "UPDATE quarantine SET released_at = ?2, released_by = ?3, updated_at = ?2
             WHERE caller_id = ?1 AND released_at IS NULL
             RETURNING {COLUMNS}"
        ))
        .bind(caller_id)
        .bind(&now)
        .bind(released_by)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => from_row(row),
            None => Err(QuarantineError::NotQuarantined(caller_id.to_owned())),
        }
    }

    async fn history(&self, caller_id: &str) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        let rows: Vec<Row> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM quarantine WHERE caller_id = ?1 ORDER BY id ASC"
        ))
        .bind(caller_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(from_row).collect()
    }
}

fn rank(level: RiskLevel) -> i64 {
    level as i64
}

fn from_row(row: Row) -> Result<QuarantineRecord, QuarantineError> {
    let (caller_id, reason, risk, entered_at, updated_at, strikes, released_at, released_by) = row;
    let risk_level = usize::try_from(risk)
        .ok()
        .and_then(|i| RiskLevel::ALL.get(i).copied())
        .ok_or_else(|| QuarantineError::Corrupt(format!("risk level {risk}")))?;
    Ok(QuarantineRecord {
        caller_id,
        reason,
        risk_level,
        entered_at: parse_time(&entered_at)?,
        updated_at: parse_time(&updated_at)?,
        strikes: u32::try_from(strikes).unwrap_or(u32::MAX),
        released_at: released_at.as_deref().map(parse_time).transpose()?,
        released_by,
    })
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, QuarantineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QuarantineError::Corrupt(format!("timestamp {raw:?}: {e}")))
}
