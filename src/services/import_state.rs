//! Import run persistence and status transitions.
//!
//! Every transition is one conditional `UPDATE`; the returned flag says
//! whether the run was in a state the transition applies to.

use sqlx::SqliteConnection;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{ImportRun, NewImportRun};
use crate::services::now;

const RUN_COLUMNS: &str =
    "project_id, status, attempt, source, last_error, started_at, finished_at, created_at, updated_at";

/// Register the import for a project, or refresh the source of a finished one.
///
/// # Returns
/// The stored run, in status `none` for a new project.
///
/// # Errors
/// `InvalidInput` if an import for the project is already scheduled or running.
pub async fn create_import_run(pool: &DbPool, input: NewImportRun) -> Result<ImportRun, ImportError> {
    let source = serde_json::to_string(&input.source)?;
    let timestamp = now();

    let run = sqlx::query_as::<_, ImportRun>(&format!(
        r#"
        INSERT INTO import_runs (project_id, status, source, created_at, updated_at)
        VALUES (?, 'none', ?, ?, ?)
        ON CONFLICT(project_id) DO UPDATE SET source = excluded.source, updated_at = excluded.updated_at
        WHERE import_runs.status NOT IN ('scheduled', 'started')
        RETURNING {}
        "#,
        RUN_COLUMNS
    ))
    .bind(input.project_id)
    .bind(&source)
    .bind(timestamp)
    .bind(timestamp)
    .fetch_optional(pool)
    .await?;

    run.ok_or_else(|| {
        ImportError::invalid_input_field(
            format!("Import for project {} is already in progress", input.project_id),
            "project_id",
        )
    })
}

/// Look up the import run of a project.
pub async fn find_import_run(pool: &DbPool, project_id: i64) -> Result<Option<ImportRun>, ImportError> {
    let run = sqlx::query_as::<_, ImportRun>(&format!(
        "SELECT {} FROM import_runs WHERE project_id = ?",
        RUN_COLUMNS
    ))
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    Ok(run)
}

/// Like [`find_import_run`], but a missing run is an error.
pub async fn get_import_run(pool: &DbPool, project_id: i64) -> Result<ImportRun, ImportError> {
    find_import_run(pool, project_id)
        .await?
        .ok_or_else(|| ImportError::not_found_with_id("ImportRun", project_id.to_string()))
}

/// `none | finished | failed | canceled → scheduled`.
///
/// Starts a new attempt: bumps `attempt`, clears the previous attempt's
/// timestamps, error, failures and transient state, and drops its pending jobs.
pub async fn mark_scheduled(pool: &DbPool, project_id: i64) -> Result<bool, ImportError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE import_runs
        SET status = 'scheduled', attempt = attempt + 1, last_error = NULL,
            started_at = NULL, finished_at = NULL, updated_at = ?
        WHERE project_id = ? AND status IN ('none', 'finished', 'failed', 'canceled')
        "#,
    )
    .bind(now())
    .bind(project_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    clear_transient_state_in(&mut tx, project_id).await?;

    for query in [
        "DELETE FROM scheduled_jobs WHERE project_id = ? AND status = 'pending'",
        "DELETE FROM import_failures WHERE project_id = ?",
    ] {
        sqlx::query(query).bind(project_id).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// `scheduled → started`.
pub async fn mark_started(pool: &DbPool, project_id: i64) -> Result<bool, ImportError> {
    let timestamp = now();
    let result = sqlx::query(
        "UPDATE import_runs SET status = 'started', started_at = ?, updated_at = ? WHERE project_id = ? AND status = 'scheduled'",
    )
    .bind(timestamp)
    .bind(timestamp)
    .bind(project_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// `started → finished` for `attempt`.
pub async fn mark_finished(pool: &DbPool, project_id: i64, attempt: i64) -> Result<bool, ImportError> {
    let mut conn = pool.acquire().await?;
    let run = finish_in(&mut conn, project_id, attempt, None).await?;
    Ok(run.is_some())
}

/// `started → finished` for `attempt`, storing `summary` as the last error.
///
/// # Returns
/// The finished run, or `None` if the run was not started under `attempt`
pub async fn finish_in(
    conn: &mut SqliteConnection,
    project_id: i64,
    attempt: i64,
    summary: Option<&str>,
) -> Result<Option<ImportRun>, ImportError> {
    let timestamp = now();
    let run = sqlx::query_as::<_, ImportRun>(&format!(
        r#"
        UPDATE import_runs
        SET status = 'finished', last_error = ?, finished_at = ?, updated_at = ?
        WHERE project_id = ? AND attempt = ? AND status = 'started'
        RETURNING {}
        "#,
        RUN_COLUMNS
    ))
    .bind(summary)
    .bind(timestamp)
    .bind(timestamp)
    .bind(project_id)
    .bind(attempt)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(run)
}

/// `scheduled | started → failed` for `attempt`, recording the error.
pub async fn mark_failed(
    pool: &DbPool,
    project_id: i64,
    attempt: i64,
    error: &str,
) -> Result<bool, ImportError> {
    let result = sqlx::query(
        "UPDATE import_runs SET status = 'failed', last_error = ?, updated_at = ? WHERE project_id = ? AND attempt = ? AND status IN ('scheduled', 'started')",
    )
    .bind(error)
    .bind(now())
    .bind(project_id)
    .bind(attempt)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// `scheduled | started → canceled`.
pub async fn mark_canceled(pool: &DbPool, project_id: i64) -> Result<bool, ImportError> {
    let result = sqlx::query(
        "UPDATE import_runs SET status = 'canceled', updated_at = ? WHERE project_id = ? AND status IN ('scheduled', 'started')",
    )
    .bind(now())
    .bind(project_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete barrier counters, transition gates, fan-out records, page counters
/// and the already-imported cache of a project.
pub async fn clear_transient_state(pool: &DbPool, project_id: i64) -> Result<(), ImportError> {
    let mut tx = pool.begin().await?;
    clear_transient_state_in(&mut tx, project_id).await?;
    tx.commit().await?;
    Ok(())
}

/// [`clear_transient_state`] on an open connection or transaction.
pub async fn clear_transient_state_in(
    conn: &mut SqliteConnection,
    project_id: i64,
) -> Result<(), ImportError> {
    for table in [
        "job_waiters",
        "job_waiter_completions",
        "fanout_objects",
        "stage_transitions",
        "page_counters",
        "imported_objects",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE project_id = ?", table))
            .bind(project_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}
