//! Durable breaker state.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::breaker::BreakerState;
use crate::plugin::ModelKey;

/// Serialized breaker for one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub model_id: String,
    pub version: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub open_since: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
}

impl BreakerRecord {
    pub fn key(&self) -> anyhow::Result<ModelKey> {
        let version = semver::Version::parse(&self.version)
            .map_err(|e| anyhow::anyhow!("stored breaker {} has bad version: {}", self.model_id, e))?;
        Ok(ModelKey::new(self.model_id.clone(), version))
    }
}

/// Persistence seam for breaker transitions.
pub trait BreakerStore: Send + Sync {
    fn load_all(&self) -> anyhow::Result<Vec<BreakerRecord>>;

    fn save(&self, record: &BreakerRecord) -> anyhow::Result<()>;

    fn remove(&self, key: &ModelKey) -> anyhow::Result<()>;
}

/// Process-local store; state does not survive a restart.
#[derive(Default)]
pub struct InMemoryBreakerStore {
    records: DashMap<ModelKey, BreakerRecord>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for InMemoryBreakerStore {
    fn load_all(&self) -> anyhow::Result<Vec<BreakerRecord>> {
        let mut records: Vec<BreakerRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| (&a.model_id, &a.version).cmp(&(&b.model_id, &b.version)));
        Ok(records)
    }

    fn save(&self, record: &BreakerRecord) -> anyhow::Result<()> {
        self.records.insert(record.key()?, record.clone());
        Ok(())
    }

    fn remove(&self, key: &ModelKey) -> anyhow::Result<()> {
        self.records.remove(key);
        Ok(())
    }
}

const MIGRATIONS: &[(i32, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS breaker_state (
        model_id TEXT NOT NULL,
        version TEXT NOT NULL,
        state TEXT NOT NULL,
        failure_count INTEGER NOT NULL DEFAULT 0,
        open_since TEXT,
        retry_after TEXT,
        cooldown_ms INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (model_id, version)
    );",
)];

fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .unwrap_or(0);

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        info!("Applying breaker store migration {}...", version);
        let tx = conn.transaction()?;
        if let Err(e) = tx.execute_batch(sql) {
            error!("Failed to apply migration {}: {}", version, e);
            return Err(e);
        }
        tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
        tx.commit()?;
    }
    Ok(())
}

/// SQLite-backed store behind an r2d2 pool.
pub struct SqliteBreakerStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteBreakerStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening breaker store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            migrate(&mut conn)?;
        }

        Ok(Self { pool: Arc::new(pool) })
    }
}

fn parse_time(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })
        })
        .transpose()
}

impl BreakerStore for SqliteBreakerStore {
    fn load_all(&self) -> anyhow::Result<Vec<BreakerRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT model_id, version, state, failure_count, open_since, retry_after, cooldown_ms
             FROM breaker_state ORDER BY model_id, version",
        )?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(2)?;
            Ok(BreakerRecord {
                model_id: row.get(0)?,
                version: row.get(1)?,
                state: state.parse().map_err(|e: String| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?,
                failure_count: row.get(3)?,
                open_since: parse_time(row.get(4)?)?,
                retry_after: parse_time(row.get(5)?)?,
                cooldown_ms: row.get::<_, i64>(6)?.max(0) as u64,
            })
        })?;

        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("Loaded {} breaker records", records.len());
        Ok(records)
    }

    fn save(&self, record: &BreakerRecord) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO breaker_state
                (model_id, version, state, failure_count, open_since, retry_after, cooldown_ms, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(model_id, version) DO UPDATE SET
                state = excluded.state,
                failure_count = excluded.failure_count,
                open_since = excluded.open_since,
                retry_after = excluded.retry_after,
                cooldown_ms = excluded.cooldown_ms,
                updated_at = excluded.updated_at",
            params![
                record.model_id,
                record.version,
                record.state.to_string(),
                record.failure_count,
                record.open_since.map(|t| t.to_rfc3339()),
                record.retry_after.map(|t| t.to_rfc3339()),
                record.cooldown_ms as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, key: &ModelKey) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM breaker_state WHERE model_id = ?1 AND version = ?2",
            params![key.model_id, key.version.to_string()],
        )?;
        Ok(())
    }
}
