use futures::stream::BoxStream;
use futures::Stream;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cache::{self, CacheTar};
use crate::matcher::PackMatcher;
use crate::planner::{ObjectQuery, VersionRange};
use crate::projects::{self, Project};
use crate::read::{self, ObjectStream, TarStream};
use crate::write::{self, UpdateEntry};
use crate::{gc, maintenance, ContentHash, Error, Result};

/// Deployment environment, passed explicitly to destructive operations so
/// gating stays testable instead of hiding in process-wide state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Test,
    Prod,
}

impl Environment {
    /// Whether data-destroying operations (reset, snapshot restore) are
    /// allowed here.
    pub fn allows_destructive(&self) -> bool {
        matches!(self, Environment::Dev | Environment::Test)
    }
}

impl std::str::FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(Environment::Dev),
            "test" => Ok(Environment::Test),
            "prod" => Ok(Environment::Prod),
            other => Err(Error::InvalidArgument(format!(
                "unknown environment {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Environment::Dev => "dev",
            Environment::Test => "test",
            Environment::Prod => "prod",
        })
    }
}

fn ensure_destructive_allowed(operation: &str, environment: Environment) -> Result<()> {
    if environment.allows_destructive() {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "{} is not available in the {} environment",
            operation, environment
        )))
    }
}

/// The storage engine: versioned objects, deduplicated content, packed
/// subtrees and cache manifests, backed by one transactional store.
///
/// Every operation runs in its own transaction; per-request state (codecs,
/// pattern matchers, row cursors) lives inside the returned streams and is
/// released with them.
#[derive(Clone)]
pub struct TreeStore {
    pool: PgPool,
}

impl TreeStore {
    /// Connect to the backing store.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(|err| Error::Unavailable(err.to_string()))?;
        Ok(TreeStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        TreeStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ── Project lifecycle ───────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn create_project(&self, project: i64, pack_patterns: Vec<String>) -> Result<()> {
        // Reject patterns that will not compile before they are persisted.
        PackMatcher::compile(&pack_patterns)?;

        let mut tx = self.pool.begin().await?;
        projects::create_project(&mut tx, project, &pack_patterns).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_project(&self, project: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        projects::delete_project(&mut tx, project).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut conn = self.pool.acquire().await?;
        projects::list_projects(&mut conn).await
    }

    pub async fn latest_version(&self, project: i64) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        projects::latest_version(&mut conn, project).await
    }

    #[instrument(skip(self))]
    pub async fn reset_project(&self, project: i64, version: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        projects::reset_project(&mut tx, project, version).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn reset_all(&self, environment: Environment) -> Result<()> {
        ensure_destructive_allowed("reset", environment)?;
        let mut tx = self.pool.begin().await?;
        projects::reset_all(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn drop_other_projects(
        &self,
        keep: &[i64],
        environment: Environment,
    ) -> Result<u64> {
        ensure_destructive_allowed("dropping projects", environment)?;
        let mut tx = self.pool.begin().await?;
        let dropped = projects::drop_other_projects(&mut tx, keep).await?;
        tx.commit().await?;
        Ok(dropped)
    }

    #[instrument(skip(self))]
    pub async fn copy_all_objects(
        &self,
        source: i64,
        target: i64,
        environment: Environment,
    ) -> Result<()> {
        ensure_destructive_allowed("snapshot copy", environment)?;
        let mut tx = self.pool.begin().await?;
        projects::copy_all_objects(&mut tx, source, target).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn clone_to_project(
        &self,
        source: i64,
        target: i64,
        range: VersionRange,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let version = projects::clone_to_project(&mut tx, source, target, range).await?;
        tx.commit().await?;
        Ok(version)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Objects changed over `range`, one at a time, aggregates expanded.
    ///
    /// Passing cache versions is allowed but any hit on a cached hash is an
    /// error; object-mode reads cannot substitute blobs from a client cache.
    pub async fn get_objects(
        &self,
        project: i64,
        range: VersionRange,
        query: ObjectQuery,
        cache_versions: Vec<i64>,
        cancel: CancellationToken,
    ) -> Result<ObjectStream> {
        read::object_stream(&self.pool, project, range, query, cache_versions, cancel).await
    }

    /// Objects changed over `range`, grouped into compressed tars. Blobs
    /// named by any of `cache_versions` are replaced with placeholders.
    pub async fn get_tars(
        &self,
        project: i64,
        range: VersionRange,
        query: ObjectQuery,
        cache_versions: Vec<i64>,
        cancel: CancellationToken,
    ) -> Result<TarStream> {
        read::tar_stream(&self.pool, project, range, query, cache_versions, cancel).await
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Apply a stream of deltas as one new version of one project.
    ///
    /// Commits atomically; a stream that yields an error, or names two
    /// different projects, rolls the whole version back. An empty stream
    /// commits nothing and returns -1.
    pub async fn update<S>(&self, entries: S) -> Result<i64>
    where
        S: Stream<Item = Result<UpdateEntry>>,
    {
        let mut tx = self.pool.begin().await?;
        let version = write::apply_updates(&mut tx, entries).await?;
        if version < 0 {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(version)
    }

    // ── Cache manifests ─────────────────────────────────────────────────

    pub async fn create_cache(&self, prefix: &str, limit: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let version = cache::create_cache(&mut tx, prefix, limit).await?;
        tx.commit().await?;
        Ok(version)
    }

    /// The blobs of the most recent cache version; empty if none exists.
    pub fn get_cache_tars(&self, cancel: CancellationToken) -> BoxStream<'static, Result<CacheTar>> {
        cache::cache_tars(self.pool.clone(), cancel)
    }

    // ── Garbage collection ──────────────────────────────────────────────

    /// Retire closed rows of `project` older than its retention window and
    /// return their hashes.
    pub async fn gc_project_objects(
        &self,
        project: i64,
        keep: i64,
        from_version: i64,
    ) -> Result<Vec<ContentHash>> {
        let mut tx = self.pool.begin().await?;
        let hashes = gc::gc_project_objects(&mut tx, project, keep, from_version).await?;
        tx.commit().await?;
        Ok(hashes)
    }

    /// Sweep unreferenced content rows out of `hashes`; returns how many
    /// went away.
    pub async fn gc_content_hashes(&self, hashes: &[ContentHash]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let swept = gc::gc_content_hashes(&mut tx, hashes).await?;
        tx.commit().await?;
        Ok(swept)
    }

    /// Collect a random sample of projects, one transaction each, stopping
    /// cleanly between projects on cancellation. Returns the number of
    /// content rows swept.
    #[instrument(skip(self, cancel))]
    pub async fn gc_random_projects(
        &self,
        sample_percent: f32,
        keep: i64,
        from_version: i64,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let sampled = {
            let mut conn = self.pool.acquire().await?;
            gc::random_projects(&mut conn, sample_percent).await?
        };

        let mut swept = 0;
        for project in sampled {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut tx = self.pool.begin().await?;
            let hashes = gc::gc_project_objects(&mut tx, project, keep, from_version).await?;
            swept += gc::gc_content_hashes(&mut tx, &hashes).await?;
            tx.commit().await?;
        }
        Ok(swept)
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Vacuum + statistics refresh on one engine table. Failures are
    /// surfaced but safe to ignore.
    pub async fn vacuum_analyze(&self, table: &str, workers: i32) -> Result<()> {
        maintenance::vacuum_analyze(&self.pool, table, workers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn environment_round_trips_through_strings() {
        for name in ["dev", "test", "prod"] {
            let env = Environment::from_str(name).expect("parse");
            assert_eq!(env.to_string(), name);
        }
        assert!(Environment::from_str("staging").is_err());
    }

    #[test]
    fn destructive_ops_are_gated_to_dev_and_test() {
        assert!(Environment::Dev.allows_destructive());
        assert!(Environment::Test.allows_destructive());
        assert!(!Environment::Prod.allows_destructive());

        assert!(ensure_destructive_allowed("reset", Environment::Test).is_ok());
        assert!(matches!(
            ensure_destructive_allowed("reset", Environment::Prod),
            Err(Error::PermissionDenied(_))
        ));
    }
}
