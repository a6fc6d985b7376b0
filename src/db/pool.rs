//! SQLite connection pool with WAL mode.
//!
//! Several job runners share one database file, so WAL is enabled for
//! concurrent readers while a writer holds the lock.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Type alias for the SQLite connection pool.
pub type DbPool = Pool<Sqlite>;

/// Create a new connection pool with WAL mode enabled.
///
/// Job runners read barrier counters and import runs while another runner
/// is committing, so readers must not block on the writer.
///
/// # Arguments
/// * `db_path` - Path to the SQLite database file
///
/// # Returns
/// A connection pool ready for use
pub async fn create_pool(db_path: &Path) -> Result<DbPool, sqlx::Error> {
    let db_url = format!("sqlite:{}", db_path.display());

    let connect_options = SqliteConnectOptions::from_str(&db_url)?
        // First runner to start creates the coordination store
        .create_if_missing(true)
        // Readers keep going while a completion report commits
        .journal_mode(SqliteJournalMode::Wal)
        // Under WAL, NORMAL may lose the last commit on power loss but never corrupts
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        // Barrier updates from many sub-jobs contend for the write lock
        .busy_timeout(Duration::from_secs(30))
        // Checkpoint every 1000 pages so a busy queue does not grow the WAL file
        .pragma("wal_autocheckpoint", "1000");

    let pool = SqlitePoolOptions::new()
        // SQLite allows one writer at a time; more connections only queue on the lock
        .max_connections(5)
        // Keep one connection open between polls of an idle runner
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await?;

    // Confirm WAL took effect
    let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;

    debug_assert!(
        mode.0.to_lowercase() == "wal",
        "WAL mode should be enabled, got: {}",
        mode.0
    );

    Ok(pool)
}
