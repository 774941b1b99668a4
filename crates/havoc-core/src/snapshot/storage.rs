//! Append-only sqlite storage for resource snapshots.

use super::ProcessSnapshot;
use crate::HarnessError;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS snapshots(
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    homeserver TEXT NOT NULL,
    process TEXT NOT NULL,
    memory_bytes BIGINT NOT NULL,
    cpu_millis BIGINT NOT NULL
)";

/// An open snapshot database. The table is created on open.
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if necessary) the snapshot database at `path`.
    /// `:memory:` opens an in-memory database.
    pub async fn open(path: &str) -> Result<Self, HarnessError> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Append one row per process entry. A snapshot with no entries is a
    /// no-op.
    pub async fn write_snapshot(&self, entries: &[ProcessSnapshot]) -> Result<(), HarnessError> {
        for entry in entries {
            sqlx::query(
                "INSERT INTO snapshots(homeserver, process, memory_bytes, cpu_millis) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.homeserver)
            .bind(&entry.process_name)
            .bind(entry.memory_bytes)
            .bind(entry.milli_cpus)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
