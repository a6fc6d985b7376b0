//! Per-project caches that make retried stages resumable.
//!
//! - the already-imported set, so sub-jobs are not spawned twice for one object
//! - page counters, so a restarted stage continues from the last page offset
//! - fan-out records, so a restarted stage keeps counting the sub-jobs it
//!   already spawned under its waiter key

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::WaiterKey;
use crate::services::now;

/// Remember that an object was imported.
pub async fn mark_imported(
    pool: &DbPool,
    project_id: i64,
    kind: &str,
    source_id: &str,
) -> Result<(), ImportError> {
    sqlx::query(
        "INSERT OR IGNORE INTO imported_objects (project_id, kind, source_id, imported_at) VALUES (?, ?, ?, ?)",
    )
    .bind(project_id)
    .bind(kind)
    .bind(source_id)
    .bind(now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn is_imported(
    pool: &DbPool,
    project_id: i64,
    kind: &str,
    source_id: &str,
) -> Result<bool, ImportError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT imported_at FROM imported_objects WHERE project_id = ? AND kind = ? AND source_id = ?",
    )
    .bind(project_id)
    .bind(kind)
    .bind(source_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Number of imported objects of one kind.
pub async fn imported_count(pool: &DbPool, project_id: i64, kind: &str) -> Result<i64, ImportError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM imported_objects WHERE project_id = ? AND kind = ?")
            .bind(project_id)
            .bind(kind)
            .fetch_one(pool)
            .await?;

    Ok(count)
}

/// Stored page offset of a collection, 0 if none.
pub async fn page_counter(pool: &DbPool, project_id: i64, collection: &str) -> Result<u64, ImportError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT value FROM page_counters WHERE project_id = ? AND collection = ?")
            .bind(project_id)
            .bind(collection)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(value,)| value.max(0) as u64).unwrap_or(0))
}

/// Store a page offset. The counter never moves backwards.
pub async fn set_page_counter(
    pool: &DbPool,
    project_id: i64,
    collection: &str,
    value: u64,
) -> Result<(), ImportError> {
    let value = i64::try_from(value)
        .map_err(|_| ImportError::invalid_input_field("page offset is too large", "value"))?;

    sqlx::query(
        r#"
        INSERT INTO page_counters (project_id, collection, value, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(project_id, collection) DO UPDATE SET
            value = MAX(value, excluded.value),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(project_id)
    .bind(collection)
    .bind(value)
    .bind(now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Job id of the sub-job spawned for `object_id` under `key`, if any.
pub async fn fanout_job(
    pool: &DbPool,
    project_id: i64,
    key: &WaiterKey,
    object_id: &str,
) -> Result<Option<String>, ImportError> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT job_id FROM fanout_objects WHERE project_id = ? AND waiter_key = ? AND object_id = ?",
    )
    .bind(project_id)
    .bind(key.as_str())
    .bind(object_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(job_id,)| job_id))
}

/// Remember that a sub-job was spawned for `object_id` under `key`.
pub async fn record_fanout(
    pool: &DbPool,
    project_id: i64,
    key: &WaiterKey,
    object_id: &str,
    job_id: &str,
) -> Result<(), ImportError> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO fanout_objects (project_id, waiter_key, object_id, job_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(key.as_str())
    .bind(object_id)
    .bind(job_id)
    .bind(now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Number of objects spawned under `key`, across every run of the stage.
pub async fn fanout_count(pool: &DbPool, project_id: i64, key: &WaiterKey) -> Result<u64, ImportError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM fanout_objects WHERE project_id = ? AND waiter_key = ?")
            .bind(project_id)
            .bind(key.as_str())
            .fetch_one(pool)
            .await?;

    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_test_db() -> DbPool {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        crate::db::initialize(&db_path).await.unwrap()
    }

    #[tokio::test]
    async fn test_imported_objects() {
        let pool = setup_test_db().await;

        assert!(!is_imported(&pool, 1, "pull_request", "7").await.unwrap());
        mark_imported(&pool, 1, "pull_request", "7").await.unwrap();
        mark_imported(&pool, 1, "pull_request", "7").await.unwrap();

        assert!(is_imported(&pool, 1, "pull_request", "7").await.unwrap());
        assert!(!is_imported(&pool, 1, "notes", "7").await.unwrap());
        assert!(!is_imported(&pool, 2, "pull_request", "7").await.unwrap());
        assert_eq!(imported_count(&pool, 1, "pull_request").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_page_counter_is_monotonic() {
        let pool = setup_test_db().await;

        assert_eq!(page_counter(&pool, 1, "pull_requests").await.unwrap(), 0);
        set_page_counter(&pool, 1, "pull_requests", 50).await.unwrap();
        set_page_counter(&pool, 1, "pull_requests", 25).await.unwrap();

        assert_eq!(page_counter(&pool, 1, "pull_requests").await.unwrap(), 50);
        assert_eq!(page_counter(&pool, 1, "notes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fanout_records_are_per_key() {
        let pool = setup_test_db().await;
        let key = WaiterKey::from("3:1:pull_requests");

        assert_eq!(fanout_job(&pool, 3, &key, "1").await.unwrap(), None);
        record_fanout(&pool, 3, &key, "1", "job-a").await.unwrap();
        record_fanout(&pool, 3, &key, "1", "job-b").await.unwrap();
        record_fanout(&pool, 3, &key, "2", "job-c").await.unwrap();

        assert_eq!(fanout_job(&pool, 3, &key, "1").await.unwrap().as_deref(), Some("job-a"));
        assert_eq!(fanout_count(&pool, 3, &key).await.unwrap(), 2);
        assert_eq!(
            fanout_count(&pool, 3, &WaiterKey::from("3:1:notes")).await.unwrap(),
            0
        );
        assert_eq!(fanout_count(&pool, 4, &key).await.unwrap(), 0);
    }
}
