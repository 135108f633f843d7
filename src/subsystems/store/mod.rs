//! `store`: SQLite persistence for model records, per-model configuration,
//! metrics history and key/value metadata.
//!
//! ## What lives here
//! - **Schema**: `init_db` creates every table on first open and tags the
//!   file with `PRAGMA user_version`.
//! - **Connection factory**: `open_conn` (WAL + foreign-keys + busy timeout).
//!   Every operation opens its own connection, so [`Store`] is a cheap,
//!   clonable path handle that can move into `spawn_blocking`.
//! - **Tables**: split by concern across [`models`], [`config`], [`metrics`]
//!   and [`metadata`], each adding methods to [`Store`].

pub mod config;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod models;

use std::path::PathBuf;

use rusqlite::Connection;

use crate::error::AppError;

pub use config::{ConfigCategory, ConfigRecord};
pub use metrics::MetricsSample;
pub use models::{ModelPatch, ModelRecord, ModelStatus, NewModel};

/// Schema version stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Value seeded under the `db_version` metadata key.
pub const DB_VERSION: &str = "1.0";

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Store(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<(), AppError> {
        let conn = self.open_conn()?;
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(store_err("read schema version"))?;

        if version == 0 {
            conn.execute_batch(&schema_sql())
                .map_err(store_err("initialize schema"))?;
            conn.execute(
                "INSERT OR IGNORE INTO metadata (key, value, updated_at) VALUES ('db_version', ?1, ?2)",
                rusqlite::params![DB_VERSION, now_ms()],
            )
            .map_err(store_err("seed metadata"))?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(store_err("set schema version"))?;
            return Ok(());
        }

        if version != SCHEMA_VERSION {
            return Err(AppError::Store(format!(
                "unsupported schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        Ok(())
    }

    pub(crate) fn open_conn(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            AppError::Store(format!("open {}: {e}", self.db_path.display()))
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err("set journal_mode WAL"))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err("set foreign_keys ON"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(store_err("set busy_timeout"))?;

        Ok(conn)
    }
}

fn schema_sql() -> String {
    let mut sql = String::from(
        "
        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('running', 'stopped', 'loading', 'error')),
            model_path TEXT,
            file_size INTEGER,
            params TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_models_status ON models(status);

        CREATE TABLE IF NOT EXISTS metrics_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            cpu_usage REAL NOT NULL,
            memory_usage REAL NOT NULL,
            disk_usage REAL NOT NULL,
            gpu_usage REAL NOT NULL,
            gpu_temperature REAL NOT NULL,
            gpu_memory_used REAL NOT NULL,
            gpu_memory_total REAL NOT NULL,
            gpu_power_usage REAL NOT NULL,
            active_models INTEGER NOT NULL,
            uptime INTEGER NOT NULL,
            requests_per_minute REAL NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics_history(timestamp);

        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    );
    for category in ConfigCategory::ALL {
        sql.push_str(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL UNIQUE REFERENCES models(id) ON DELETE CASCADE,
                config TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
            table = category.table_name()
        ));
    }
    sql
}

/// Wrap a rusqlite error with the operation that failed.
pub(crate) fn store_err(op: &'static str) -> impl Fn(rusqlite::Error) -> AppError {
    move |e| AppError::Store(format!("{op}: {e}"))
}

/// Unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("llamaprox.db")).unwrap();
    (dir, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_tables_and_seeds_version() {
        let (_dir, store) = temp_store();
        let conn = store.open_conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'model_%_config'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
        assert_eq!(store.metadata("db_version").unwrap().as_deref(), Some(DB_VERSION));
    }

    #[test]
    fn reopen_is_idempotent() {
        let (dir, store) = temp_store();
        store.set_metadata("db_version", "custom").unwrap();
        let again = Store::open(dir.path().join("llamaprox.db")).unwrap();
        assert_eq!(again.metadata("db_version").unwrap().as_deref(), Some("custom"));
    }

    #[test]
    fn foreign_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "user_version", 7).unwrap();
        drop(conn);
        let err = Store::open(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version 7"));
    }
}
