use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::planner::CHUNK_SIZE;
use crate::{ContentHash, Error, Result};

/// One element of the cache-manifest stream: the manifest version, the
/// stored (compressed) aggregate blob, and its hash.
#[derive(Clone, Debug)]
pub struct CacheTar {
    pub version: i64,
    pub bytes: Bytes,
    pub hash: ContentHash,
}

/// Create a new cache version holding the `limit` most-referenced aggregate
/// hashes under `prefix`, across all projects. Returns the version.
#[instrument(skip(conn))]
pub(crate) async fn create_cache(
    conn: &mut PgConnection,
    prefix: &str,
    limit: i64,
) -> Result<i64> {
    let version: i64 = sqlx::query_scalar(
        "INSERT INTO dl.cache_versions (version, hashes) \
         SELECT COALESCE((SELECT MAX(version) FROM dl.cache_versions), 0) + 1, \
                ARRAY(SELECT hash FROM (\
                    SELECT hash, COUNT(*) AS refs FROM dl.objects \
                     WHERE packed AND stop_version IS NULL AND starts_with(path, $1) \
                     GROUP BY hash ORDER BY refs DESC, hash LIMIT $2) top) \
         RETURNING version",
    )
    .bind(prefix.to_string())
    .bind(limit)
    .fetch_one(&mut *conn)
    .await?;
    Ok(version)
}

/// Stream the blobs of the most recent cache version. An empty stream means
/// no cache version exists yet; superseded versions stay readable for
/// in-flight readers but are never served here.
pub(crate) fn cache_tars(
    pool: PgPool,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<CacheTar>> {
    Box::pin(try_stream! {
        let mut conn = pool.acquire().await.map_err(Error::from)?;

        let latest: Option<(i64, Vec<ContentHash>)> = sqlx::query_as(
            "SELECT version, hashes FROM dl.cache_versions ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::from)?;

        if let Some((version, hashes)) = latest {
            for chunk in hashes.chunks(CHUNK_SIZE as usize) {
                if cancel.is_cancelled() {
                    Err(Error::Cancelled)?;
                }
                let rows: Vec<(ContentHash, Vec<u8>)> = sqlx::query_as(
                    "SELECT hash, bytes FROM dl.contents WHERE hash = ANY($1)",
                )
                .bind(chunk.to_vec())
                .fetch_all(&mut *conn)
                .await
                .map_err(Error::from)?;

                for (hash, bytes) in rows {
                    yield CacheTar {
                        version,
                        bytes: Bytes::from(bytes),
                        hash,
                    };
                }
            }
        }
    })
}
