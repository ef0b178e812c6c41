//! Persistence for targets, repositories, snapshots and deltas.
//!
//! This module is split into submodules:
//! - `model`: row structs returned by queries and their conversion into domain types.
//! - `targets`: target definitions and run bookkeeping.
//! - `snapshots`: repositories, snapshots and the deltas derived from them.
//!
//! Every write goes through [`Store`], which serializes writers behind a
//! single async lock. Reads go straight to the pool.

pub mod model;
pub mod snapshots;
pub mod targets;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target {id} not found")]
    NotFound { id: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    #[error("invalid target: {0}")]
    Invalid(&'static str),
}

/// Single-writer handle over the SQLite pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool,
    writer: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Open (creating if needed) and migrate the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Held for the whole duration of every write operation.
    async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }
}

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Storage resolution for observation timestamps.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Fixed-width UTC text, so lexical order in SQL matches chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    truncate_to_second(ts).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("unparseable timestamp {raw:?}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_ts(&s))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn memory_urls_are_untouched() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_urls_are_normalized_and_parent_created() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("pw.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").is_dir());
    }

    #[test]
    fn timestamps_are_fixed_width_seconds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + chrono::Duration::milliseconds(870);
        let text = format_ts(ts);
        assert_eq!(text, "2024-03-09T07:05:01Z");
        assert_eq!(parse_ts(&text).unwrap(), truncate_to_second(ts));
        assert!(matches!(parse_ts("yesterday"), Err(StoreError::Corrupt(_))));
        assert_eq!(parse_opt_ts(Some(" ".into())).unwrap(), None);
    }

    #[tokio::test]
    async fn open_creates_file_database() {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/data/pw.db", td.path().display());
        let store = Store::open(&url).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('targets', 'repositories', 'snapshots', 'deltas')",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(tables, 4);
        assert!(td.path().join("data").join("pw.db").exists());
    }
}
