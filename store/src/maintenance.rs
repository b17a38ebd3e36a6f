use sqlx::{Executor, PgPool};
use tracing::{instrument, warn};

use crate::{Error, Result};

const VACUUM_TABLES: &[&str] = &[
    "dl.projects",
    "dl.objects",
    "dl.contents",
    "dl.cache_versions",
];

/// Vacuum and refresh planner statistics for one table.
///
/// VACUUM cannot run inside a transaction block, so this takes a bare
/// pooled connection. Callers treat failure as non-fatal to serving.
#[instrument(skip(pool))]
pub(crate) async fn vacuum_analyze(pool: &PgPool, table: &str, workers: i32) -> Result<()> {
    if !VACUUM_TABLES.contains(&table) {
        return Err(Error::InvalidArgument(format!(
            "unknown table {:?}",
            table
        )));
    }
    if workers < 1 {
        return Err(Error::InvalidArgument(format!(
            "worker count must be positive, got {}",
            workers
        )));
    }

    let statement = format!("VACUUM (ANALYZE, PARALLEL {}) {}", workers, table);
    let mut conn = pool.acquire().await?;
    if let Err(err) = conn.execute(statement.as_str()).await {
        warn!(table, %err, "vacuum failed");
        return Err(err.into());
    }
    Ok(())
}
