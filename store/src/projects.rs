use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::planner::{self, ObjectQuery, ObjectRow, Page, PlanParams, VersionRange, CHUNK_SIZE};
use crate::{Error, Result};

/// A project summary row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub latest_version: i64,
}

/// Fetch a project's version counter and pack patterns, without locking.
pub(crate) async fn project_row(
    conn: &mut PgConnection,
    project: i64,
) -> Result<(i64, Vec<String>)> {
    sqlx::query_as("SELECT latest_version, pack_patterns FROM dl.projects WHERE id = $1")
        .bind(project)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::ProjectNotFound(project))
}

pub(crate) async fn latest_version(conn: &mut PgConnection, project: i64) -> Result<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT latest_version FROM dl.projects WHERE id = $1")
            .bind(project)
            .fetch_optional(&mut *conn)
            .await?;
    version.ok_or(Error::ProjectNotFound(project))
}

pub(crate) async fn create_project(
    conn: &mut PgConnection,
    project: i64,
    pack_patterns: &[String],
) -> Result<()> {
    let result = sqlx::query(
        "INSERT INTO dl.projects (id, latest_version, pack_patterns) VALUES ($1, 0, $2)",
    )
    .bind(project)
    .bind(pack_patterns.to_vec())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
            Error::InvalidArgument(format!("project {} already exists", project)),
        ),
        Err(err) => Err(err.into()),
    }
}

pub(crate) async fn delete_project(conn: &mut PgConnection, project: i64) -> Result<()> {
    sqlx::query("DELETE FROM dl.objects WHERE project = $1")
        .bind(project)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM dl.projects WHERE id = $1")
        .bind(project)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::ProjectNotFound(project));
    }
    Ok(())
}

pub(crate) async fn list_projects(conn: &mut PgConnection) -> Result<Vec<Project>> {
    let rows: Vec<(i64, i64)> =
        sqlx::query_as("SELECT id, latest_version FROM dl.projects ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, latest_version)| Project { id, latest_version })
        .collect())
}

/// Wind a project back to `version`: rows born later vanish, rows that died
/// later come back to life.
#[instrument(skip(conn))]
pub(crate) async fn reset_project(
    conn: &mut PgConnection,
    project: i64,
    version: i64,
) -> Result<()> {
    let result = sqlx::query("UPDATE dl.projects SET latest_version = $2 WHERE id = $1")
        .bind(project)
        .bind(version)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::ProjectNotFound(project));
    }

    sqlx::query("DELETE FROM dl.objects WHERE project = $1 AND start_version > $2")
        .bind(project)
        .bind(version)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE dl.objects SET stop_version = NULL WHERE project = $1 AND stop_version > $2")
        .bind(project)
        .bind(version)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Truncate objects, contents and cache versions. Projects themselves stay;
/// only callable in dev and test, which the service layer enforces.
pub(crate) async fn reset_all(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("TRUNCATE dl.objects, dl.contents, dl.cache_versions")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn drop_other_projects(conn: &mut PgConnection, keep: &[i64]) -> Result<u64> {
    sqlx::query("DELETE FROM dl.objects WHERE project != ALL($1)")
        .bind(keep.to_vec())
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM dl.projects WHERE id != ALL($1)")
        .bind(keep.to_vec())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Copy every object row of `source` into `target` verbatim. Only legal
/// between projects with identical pack patterns, since the rows carry the
/// packed flags of the source's patterns.
pub(crate) async fn copy_all_objects(
    conn: &mut PgConnection,
    source: i64,
    target: i64,
) -> Result<()> {
    let (source_latest, source_patterns) = project_row(conn, source).await?;
    let (_, target_patterns) = project_row(conn, target).await?;
    if source_patterns != target_patterns {
        return Err(Error::InvalidArgument(format!(
            "pack patterns of projects {} and {} differ",
            source, target
        )));
    }

    sqlx::query(
        "INSERT INTO dl.objects (project, start_version, stop_version, path, hash, mode, size, packed) \
         SELECT $2, start_version, stop_version, path, hash, mode, size, packed \
         FROM dl.objects WHERE project = $1",
    )
    .bind(source)
    .bind(target)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE dl.projects SET latest_version = $2 WHERE id = $1")
        .bind(target)
        .bind(source_latest)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply the diff of `source` over `range` onto `target` as one new target
/// version. Returns the target's resulting version; a no-op diff leaves the
/// target untouched.
#[instrument(skip(conn))]
pub(crate) async fn clone_to_project(
    conn: &mut PgConnection,
    source: i64,
    target: i64,
    mut range: VersionRange,
) -> Result<i64> {
    let target_row: Option<(i64,)> =
        sqlx::query_as("SELECT latest_version FROM dl.projects WHERE id = $1 FOR UPDATE")
            .bind(target)
            .fetch_optional(&mut *conn)
            .await?;
    let (target_latest,) = target_row.ok_or(Error::ProjectNotFound(target))?;
    let new_version = target_latest + 1;

    let (source_latest, _) = project_row(conn, source).await?;
    if range.to <= 0 {
        range.to = source_latest;
    }
    range.validate()?;

    let query = ObjectQuery {
        path: String::new(),
        is_prefix: true,
        with_content: false,
        ignores: Vec::new(),
    };

    let mut cursor: Option<String> = None;
    let mut removed: Vec<String> = Vec::new();
    let mut paths: Vec<String> = Vec::new();
    let mut h1s: Vec<Uuid> = Vec::new();
    let mut h2s: Vec<Uuid> = Vec::new();
    let mut modes: Vec<i64> = Vec::new();
    let mut sizes: Vec<i64> = Vec::new();
    let mut packed: Vec<bool> = Vec::new();

    loop {
        let params = PlanParams {
            project: source,
            range,
            query: &query,
            cache_versions: &[],
            with_hash: true,
        };
        let page = Page {
            after_path: cursor.as_deref(),
            limit: CHUNK_SIZE,
        };
        let rows: Vec<ObjectRow> = planner::build_query(&params, Some(&page))?
            .build_query_as()
            .fetch_all(&mut *conn)
            .await?;
        let fetched = rows.len() as i64;

        for row in rows {
            cursor = Some(row.path.clone());
            if row.deleted {
                removed.push(row.path);
                continue;
            }
            let hash = row.hash().ok_or_else(|| {
                Error::Internal(format!("diff row {} carries no hash", row.path))
            })?;
            paths.push(row.path);
            h1s.push(hash.h1);
            h2s.push(hash.h2);
            modes.push(row.mode);
            sizes.push(row.size);
            packed.push(row.packed);
        }

        if fetched < CHUNK_SIZE {
            break;
        }
    }

    if removed.is_empty() && paths.is_empty() {
        debug!(source, target, "clone diff is empty");
        return Ok(target_latest);
    }

    if !removed.is_empty() {
        sqlx::query(
            "UPDATE dl.objects SET stop_version = $3 \
             WHERE project = $1 AND path = ANY($2) AND stop_version IS NULL",
        )
        .bind(target)
        .bind(&removed)
        .bind(new_version)
        .execute(&mut *conn)
        .await?;
    }

    if !paths.is_empty() {
        sqlx::query(
            "UPDATE dl.objects SET stop_version = $3 \
             WHERE project = $1 AND path = ANY($2) \
               AND stop_version IS NULL AND start_version != $3",
        )
        .bind(target)
        .bind(&paths)
        .bind(new_version)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO dl.objects (project, start_version, stop_version, path, hash, mode, size, packed) \
             SELECT $1, $2, NULL, t.path, ROW(t.h1, t.h2)::hash, t.mode, t.size, t.packed \
             FROM UNNEST($3::text[], $4::uuid[], $5::uuid[], $6::int8[], $7::int8[], $8::bool[]) \
                  AS t(path, h1, h2, mode, size, packed) \
             ON CONFLICT DO NOTHING",
        )
        .bind(target)
        .bind(new_version)
        .bind(&paths)
        .bind(&h1s)
        .bind(&h2s)
        .bind(&modes)
        .bind(&sizes)
        .bind(&packed)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("UPDATE dl.projects SET latest_version = $2 WHERE id = $1")
        .bind(target)
        .bind(new_version)
        .execute(&mut *conn)
        .await?;

    Ok(new_version)
}
