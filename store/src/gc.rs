use sqlx::PgConnection;
use tracing::{debug, instrument};

use crate::projects;
use crate::{ContentHash, Result};

/// Retire closed object rows of one project that fell out of the retention
/// window. Returns the hashes of the deleted rows so the caller can decide
/// which content to sweep.
#[instrument(skip(conn))]
pub(crate) async fn gc_project_objects(
    conn: &mut PgConnection,
    project: i64,
    keep: i64,
    from_version: i64,
) -> Result<Vec<ContentHash>> {
    let latest_version = projects::latest_version(conn, project).await?;

    let rows: Vec<(ContentHash,)> = sqlx::query_as(
        "DELETE FROM dl.objects \
         WHERE project = $1 AND start_version > $2 \
           AND stop_version IS NOT NULL AND stop_version <= $3 \
         RETURNING hash",
    )
    .bind(project)
    .bind(from_version)
    .bind(latest_version - keep)
    .fetch_all(&mut *conn)
    .await?;

    debug!(project, count = rows.len(), "retired objects");
    Ok(rows.into_iter().map(|(hash,)| hash).collect())
}

/// Sweep content rows in `hashes` that no object references anymore.
/// Referenced hashes survive, so running this against the output of
/// [gc_project_objects] is always safe.
#[instrument(skip_all, fields(candidates = hashes.len()))]
pub(crate) async fn gc_content_hashes(
    conn: &mut PgConnection,
    hashes: &[ContentHash],
) -> Result<u64> {
    if hashes.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "DELETE FROM dl.contents c \
         WHERE c.hash = ANY($1) \
           AND NOT EXISTS (SELECT 1 FROM dl.objects o WHERE o.hash = c.hash)",
    )
    .bind(hashes.to_vec())
    .execute(&mut *conn)
    .await?;

    debug!(swept = result.rows_affected(), "swept content rows");
    Ok(result.rows_affected())
}

/// A Bernoulli sample of project ids, for randomized background collection.
pub(crate) async fn random_projects(
    conn: &mut PgConnection,
    sample_percent: f32,
) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM dl.projects TABLESAMPLE BERNOULLI($1)")
            .bind(sample_percent)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
