//! Snapshot persistence for provider dispatch state
//!
//! The dispatcher only needs a load/save contract; any durable store that
//! can hold one flat record per provider satisfies it. A SQLite-backed
//! implementation is provided here, plus an in-memory store for tests and
//! embedders that opt out of durability.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::circuit::CircuitState;
use super::types::ProviderSnapshot;
use crate::error::{Error, Result};

/// Load/save contract consumed by the dispatcher.
///
/// `load` runs once at startup to re-derive state from the last successful
/// snapshot; `save` runs after outcome reports. Both operate on the whole
/// provider set.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ProviderSnapshot>>;
    async fn save(&self, snapshot: &[ProviderSnapshot]) -> Result<()>;
}

/// SQL to create the provider state table
pub const CREATE_PROVIDER_STATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS provider_state (
    provider_id TEXT PRIMARY KEY,
    tiers TEXT NOT NULL,
    scores TEXT NOT NULL,
    quota_limit INTEGER NOT NULL,
    quota_used INTEGER NOT NULL DEFAULT 0,
    quota_reset_at TEXT NOT NULL,
    circuit_state TEXT NOT NULL DEFAULT 'closed',
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// SQLite-backed snapshot store
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Create a store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a store and connect to the database file
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", database_path.display());

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_PROVIDER_STATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        info!("Provider state table initialized");
        Ok(())
    }

    fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<ProviderSnapshot> {
        let tiers: Vec<String> = serde_json::from_str(row.get::<String, _>("tiers").as_str())
            .map_err(|e| Error::Persistence(format!("corrupt tiers column: {}", e)))?;
        let scores: HashMap<String, f64> =
            serde_json::from_str(row.get::<String, _>("scores").as_str())
                .map_err(|e| Error::Persistence(format!("corrupt scores column: {}", e)))?;
        let circuit_state: CircuitState = row
            .get::<String, _>("circuit_state")
            .parse()
            .map_err(Error::Persistence)?;

        Ok(ProviderSnapshot {
            id: row.get("provider_id"),
            tiers,
            scores,
            quota_limit: row.get::<i64, _>("quota_limit") as u64,
            quota_used: row.get::<i64, _>("quota_used") as u64,
            quota_reset_at: row.get::<DateTime<Utc>, _>("quota_reset_at"),
            circuit_state,
            consecutive_failures: row.get::<i64, _>("consecutive_failures") as u32,
        })
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn load(&self) -> Result<Vec<ProviderSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT provider_id, tiers, scores, quota_limit, quota_used,
                   quota_reset_at, circuit_state, consecutive_failures
            FROM provider_state
            ORDER BY provider_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            snapshots.push(Self::row_to_snapshot(row)?);
        }

        info!(providers = snapshots.len(), "loaded provider state");
        Ok(snapshots)
    }

    async fn save(&self, snapshot: &[ProviderSnapshot]) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        for snap in snapshot {
            let tiers = serde_json::to_string(&snap.tiers)
                .map_err(|e| Error::Persistence(e.to_string()))?;
            let scores = serde_json::to_string(&snap.scores)
                .map_err(|e| Error::Persistence(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO provider_state (
                    provider_id, tiers, scores, quota_limit, quota_used,
                    quota_reset_at, circuit_state, consecutive_failures, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(provider_id) DO UPDATE SET
                    tiers = excluded.tiers,
                    scores = excluded.scores,
                    quota_limit = excluded.quota_limit,
                    quota_used = excluded.quota_used,
                    quota_reset_at = excluded.quota_reset_at,
                    circuit_state = excluded.circuit_state,
                    consecutive_failures = excluded.consecutive_failures,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&snap.id)
            .bind(&tiers)
            .bind(&scores)
            .bind(snap.quota_limit as i64)
            .bind(snap.quota_used as i64)
            .bind(snap.quota_reset_at)
            .bind(snap.circuit_state.to_string())
            .bind(snap.consecutive_failures as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        debug!(providers = snapshot.len(), "saved provider state");
        Ok(())
    }
}

/// In-memory snapshot store, keeps only the latest save
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Vec<ProviderSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of provider records in the latest snapshot
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Vec<ProviderSnapshot>> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, snapshot: &[ProviderSnapshot]) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.to_vec();
        Ok(())
    }
}
