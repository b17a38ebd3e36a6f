use std::collections::BTreeMap;

use futures::{Stream, TryStreamExt};
use sqlx::PgConnection;
use tracing::{debug, instrument};

use baumlager_pack::tar::{rewrite_pack, PackError};
use baumlager_pack::{ContentDecoder, ContentEncoder, Object, MODE_DIR};

use crate::matcher::PackMatcher;
use crate::{ContentHash, Error, Result};

/// One element of an update stream: a delta against `project`.
#[derive(Clone, Debug)]
pub struct UpdateEntry {
    pub project: i64,
    pub object: Object,
}

/// Per-write state, established on the first delta once the project row is
/// locked.
struct WriteState {
    project: i64,
    version: i64,
    matcher: PackMatcher,
    buffers: BTreeMap<String, Vec<Object>>,
    encoder: ContentEncoder,
    decoder: ContentDecoder,
}

impl WriteState {
    /// Lock the project row and pin the target version. The lock serializes
    /// writers per project, which is what keeps versions gap-free.
    async fn begin(conn: &mut PgConnection, project: i64) -> Result<WriteState> {
        let row: Option<(i64, Vec<String>)> = sqlx::query_as(
            "SELECT latest_version, pack_patterns FROM dl.projects WHERE id = $1 FOR UPDATE",
        )
        .bind(project)
        .fetch_optional(&mut *conn)
        .await?;
        let (latest_version, pack_patterns) =
            row.ok_or(Error::ProjectNotFound(project))?;

        Ok(WriteState {
            project,
            version: latest_version + 1,
            matcher: PackMatcher::compile(&pack_patterns)?,
            buffers: BTreeMap::new(),
            encoder: ContentEncoder::new(),
            decoder: ContentDecoder::new(),
        })
    }
}

/// The path itself plus every ancestor directory whose lifetime tracks it.
fn with_ancestor_dirs(path: &str) -> Vec<String> {
    let mut paths: Vec<String> = path
        .match_indices('/')
        .map(|(idx, _)| path[..=idx].to_string())
        .collect();
    if !path.ends_with('/') {
        paths.push(path.to_string());
    }
    paths
}

/// Close the live row for `path` at `version`. Closing a directory also
/// closes everything below it.
async fn close_object(
    conn: &mut PgConnection,
    project: i64,
    path: &str,
    version: i64,
) -> Result<()> {
    let sql = if path.ends_with('/') {
        "UPDATE dl.objects SET stop_version = $3 \
         WHERE project = $1 AND stop_version IS NULL \
           AND (path = $2 OR starts_with(path, $2))"
    } else {
        "UPDATE dl.objects SET stop_version = $3 \
         WHERE project = $1 AND path = $2 AND stop_version IS NULL"
    };
    sqlx::query(sql)
        .bind(project)
        .bind(path)
        .bind(version)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply one direct (non-packed) update.
async fn apply_update(
    conn: &mut PgConnection,
    state: &mut WriteState,
    object: Object,
) -> Result<()> {
    let content = object.content.clone().unwrap_or_default();
    let hash = ContentHash::of(&content);

    // No row back means this exact (path, hash, mode, size) was already
    // written at this version; there is nothing left to do. A differing
    // re-write at the same version updates the row in place, so the last
    // delta per path wins.
    let inserted: Option<(String,)> = sqlx::query_as(
        "INSERT INTO dl.objects (project, start_version, stop_version, path, hash, mode, size, packed) \
         VALUES ($1, $2, NULL, $3, $4, $5, $6, false) \
         ON CONFLICT (project, path, start_version) DO UPDATE \
            SET hash = EXCLUDED.hash, mode = EXCLUDED.mode, size = EXCLUDED.size \
          WHERE (dl.objects.hash, dl.objects.mode, dl.objects.size) \
                IS DISTINCT FROM (EXCLUDED.hash, EXCLUDED.mode, EXCLUDED.size) \
         RETURNING path",
    )
    .bind(state.project)
    .bind(state.version)
    .bind(&object.path)
    .bind(hash)
    .bind(object.mode)
    .bind(object.size)
    .fetch_optional(&mut *conn)
    .await?;
    if inserted.is_none() {
        return Ok(());
    }

    // One round trip: close the superseded row and the ancestor directory
    // chain, and store the blob.
    let encoded = state.encoder.encode(&content)?;
    sqlx::query(
        "WITH closed AS (\
            UPDATE dl.objects SET stop_version = $2 \
             WHERE project = $1 AND path = ANY($3) \
               AND stop_version IS NULL AND start_version != $2) \
         INSERT INTO dl.contents (hash, bytes) VALUES ($4, $5) \
         ON CONFLICT (hash) DO NOTHING",
    )
    .bind(state.project)
    .bind(state.version)
    .bind(with_ancestor_dirs(&object.path))
    .bind(hash)
    .bind(encoded.as_ref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fold the buffered overrides for one pack prefix into its aggregate.
async fn apply_pack(
    conn: &mut PgConnection,
    state: &mut WriteState,
    prefix: String,
    overrides: Vec<Object>,
) -> Result<()> {
    let existing: Option<(ContentHash, Vec<u8>)> = sqlx::query_as(
        "SELECT o.hash, c.bytes FROM dl.objects o \
         JOIN dl.contents c ON c.hash = o.hash \
         WHERE o.project = $1 AND o.path = $2 AND o.packed AND o.stop_version IS NULL",
    )
    .bind(state.project)
    .bind(&prefix)
    .fetch_optional(&mut *conn)
    .await?;

    let existing_tar = match &existing {
        Some((_, bytes)) => Some(state.decoder.decode(bytes)?),
        None => None,
    };

    match rewrite_pack(existing_tar.as_deref(), &overrides) {
        Ok((content_tar, names_tar)) => {
            let new_hash = ContentHash::of(&content_tar);
            if existing.as_ref().map(|(hash, _)| *hash) == Some(new_hash) {
                debug!(prefix, "aggregate unchanged");
                return Ok(());
            }

            let encoded_content = state.encoder.encode(&content_tar)?;
            let encoded_names = state.encoder.encode(&names_tar)?;

            sqlx::query(
                "UPDATE dl.objects SET stop_version = $2 \
                 WHERE project = $1 AND path = ANY($3) \
                   AND stop_version IS NULL AND start_version != $2",
            )
            .bind(state.project)
            .bind(state.version)
            .bind(with_ancestor_dirs(&prefix))
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO dl.objects (project, start_version, stop_version, path, hash, mode, size, packed) \
                 VALUES ($1, $2, NULL, $3, $4, $5, $6, true)",
            )
            .bind(state.project)
            .bind(state.version)
            .bind(&prefix)
            .bind(new_hash)
            .bind(MODE_DIR | 0o755)
            .bind(content_tar.len() as i64)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO dl.contents (hash, bytes, names_tar) VALUES ($1, $2, $3) \
                 ON CONFLICT (hash) DO NOTHING",
            )
            .bind(new_hash)
            .bind(encoded_content.as_ref())
            .bind(encoded_names.as_ref())
            .execute(&mut *conn)
            .await?;
        }
        // Every member was deleted: the aggregate ceases to exist.
        Err(PackError::Empty) => {
            sqlx::query(
                "UPDATE dl.objects SET stop_version = $2 \
                 WHERE project = $1 AND path = $3 \
                   AND stop_version IS NULL AND start_version != $2",
            )
            .bind(state.project)
            .bind(state.version)
            .bind(&prefix)
            .execute(&mut *conn)
            .await?;
        }
        Err(PackError::Io(err)) => return Err(err.into()),
    }
    Ok(())
}

/// Apply a stream of deltas to one project inside the caller's transaction.
///
/// Returns the new version, or -1 when the stream carried no deltas (the
/// caller is expected to roll back in that case). Direct paths apply as
/// they arrive; pack-prefix paths are buffered and folded into their
/// aggregates after the stream ends, so a prefix costs one extra round trip
/// no matter how many deltas fell into it.
#[instrument(skip_all)]
pub(crate) async fn apply_updates<S>(conn: &mut PgConnection, entries: S) -> Result<i64>
where
    S: Stream<Item = Result<UpdateEntry>>,
{
    tokio::pin!(entries);

    let mut state: Option<WriteState> = None;
    while let Some(entry) = entries.try_next().await? {
        if state.is_none() {
            state = Some(WriteState::begin(conn, entry.project).await?);
        }
        let st = state.as_mut().unwrap();
        if st.project != entry.project {
            return Err(Error::MultipleProjectsPerUpdate(st.project, entry.project));
        }

        match st.matcher.pack_prefix(&entry.object.path).map(str::to_string) {
            Some(prefix) => st.buffers.entry(prefix).or_default().push(entry.object),
            None if entry.object.deleted => {
                close_object(conn, st.project, &entry.object.path, st.version).await?
            }
            None => apply_update(conn, st, entry.object).await?,
        }
    }

    let Some(mut st) = state else {
        return Ok(-1);
    };

    let buffers = std::mem::take(&mut st.buffers);
    for (prefix, overrides) in buffers {
        apply_pack(conn, &mut st, prefix, overrides).await?;
    }

    sqlx::query("UPDATE dl.projects SET latest_version = $2 WHERE id = $1")
        .bind(st.project)
        .bind(st.version)
        .execute(&mut *conn)
        .await?;

    debug!(project = st.project, version = st.version, "update applied");
    Ok(st.version)
}
