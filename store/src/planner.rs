use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{ContentHash, Error, Result};

/// Rows pulled from the backing store per round trip.
pub(crate) const CHUNK_SIZE: i64 = 200;

/// A half-open `(from, to]` interval of project versions.
///
/// `from = 0` asks for a plain snapshot at `to`; `from > 0` asks for the
/// diff between the two versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionRange {
    pub from: i64,
    pub to: i64,
}

impl VersionRange {
    pub fn validate(&self) -> Result<()> {
        if self.from < 0 || self.to < self.from {
            return Err(Error::InvalidArgument(format!(
                "invalid version range ({}, {}]",
                self.from, self.to
            )));
        }
        Ok(())
    }

    pub fn is_snapshot(&self) -> bool {
        self.from == 0
    }
}

/// Which objects a read wants, and in what form.
#[derive(Clone, Debug)]
pub struct ObjectQuery {
    pub path: String,
    pub is_prefix: bool,
    pub with_content: bool,
    /// Path prefixes to exclude; only meaningful for prefix queries, and
    /// each must extend `path`.
    pub ignores: Vec<String>,
}

impl ObjectQuery {
    pub fn exact(path: impl Into<String>) -> Self {
        ObjectQuery {
            path: path.into(),
            is_prefix: false,
            with_content: true,
            ignores: Vec::new(),
        }
    }

    pub fn prefix(path: impl Into<String>) -> Self {
        ObjectQuery {
            path: path.into(),
            is_prefix: true,
            with_content: true,
            ignores: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ignores.is_empty() {
            return Ok(());
        }
        if !self.is_prefix {
            return Err(Error::InvalidArgument(
                "ignores are only valid on prefix queries".to_string(),
            ));
        }
        for ignore in &self.ignores {
            if !ignore.starts_with(&self.path) || ignore == &self.path {
                return Err(Error::InvalidArgument(format!(
                    "ignore {:?} does not extend query path {:?}",
                    ignore, self.path
                )));
            }
        }
        Ok(())
    }
}

/// Everything the planner needs to emit one diff query.
pub(crate) struct PlanParams<'a> {
    pub project: i64,
    pub range: VersionRange,
    pub query: &'a ObjectQuery,
    pub cache_versions: &'a [i64],
    pub with_hash: bool,
}

/// Keyset pagination over the plan's path-ordered output.
pub(crate) struct Page<'a> {
    pub after_path: Option<&'a str>,
    pub limit: i64,
}

/// One result row of a planned query.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ObjectRow {
    pub path: String,
    pub mode: i64,
    pub size: i64,
    pub packed: bool,
    pub cached: bool,
    pub deleted: bool,
    pub bytes: Option<Vec<u8>>,
    #[sqlx(default)]
    pub h1: Option<Uuid>,
    #[sqlx(default)]
    pub h2: Option<Uuid>,
}

impl ObjectRow {
    pub fn hash(&self) -> Option<ContentHash> {
        match (self.h1, self.h2) {
            (Some(h1), Some(h2)) => Some(ContentHash { h1, h2 }),
            _ => None,
        }
    }
}

/// Escape `prefix` for use as the pattern of a LIKE, matching any path it
/// prefixes.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Emit the diff query for `(project, range, query, cache_versions)`.
///
/// The shape is three CTEs — candidate rows, cached hashes, updated rows —
/// plus a removed-paths arm on non-snapshot reads, unioned and ordered by
/// path so the result can be paged with a keyset cursor.
pub(crate) fn build_query(
    params: &PlanParams<'_>,
    page: Option<&Page<'_>>,
) -> Result<QueryBuilder<'static, Postgres>> {
    params.range.validate()?;
    params.query.validate()?;

    let snapshot = params.range.is_snapshot();
    let with_cache = !params.cache_versions.is_empty();
    let content_column = if params.query.with_content {
        "c.bytes"
    } else {
        "c.names_tar"
    };

    let mut qb = QueryBuilder::new(
        "WITH possible_objects AS (\
         SELECT path, mode, size, packed, hash, start_version, stop_version \
         FROM dl.objects WHERE project = ",
    );
    qb.push_bind(params.project);

    if snapshot {
        // A pure snapshot needs only the rows live at `to`.
        qb.push(" AND start_version <= ");
        qb.push_bind(params.range.to);
        qb.push(" AND (stop_version IS NULL OR stop_version > ");
        qb.push_bind(params.range.to);
        qb.push(")");
    } else {
        qb.push(" AND ((start_version > ");
        qb.push_bind(params.range.from);
        qb.push(" AND start_version <= ");
        qb.push_bind(params.range.to);
        qb.push(") OR (stop_version > ");
        qb.push_bind(params.range.from);
        qb.push(" AND stop_version <= ");
        qb.push_bind(params.range.to);
        qb.push("))");
    }

    if !(params.query.path.is_empty() && params.query.is_prefix) {
        if params.query.is_prefix {
            qb.push(" AND path LIKE ");
            qb.push_bind(like_prefix(&params.query.path));
        } else {
            qb.push(" AND path = ");
            qb.push_bind(params.query.path.clone());
        }
    }

    if !params.query.ignores.is_empty() {
        let patterns: Vec<String> = params.query.ignores.iter().map(|i| like_prefix(i)).collect();
        qb.push(" AND path NOT LIKE ALL(");
        qb.push_bind(patterns);
        qb.push(")");
    }
    qb.push(")");

    if with_cache {
        qb.push(
            ", cached_object_hashes AS (\
             SELECT DISTINCT unnest(hashes) AS hash \
             FROM dl.cache_versions WHERE version = ANY(",
        );
        qb.push_bind(params.cache_versions.to_vec());
        qb.push("))");
    }

    qb.push(", updated_objects AS (SELECT o.path, o.mode, o.size, o.packed, o.hash, ");
    if with_cache {
        // The client already holds cached blobs, so their bytes stay home.
        qb.push("(ch.hash IS NOT NULL) AS cached, CASE WHEN ch.hash IS NOT NULL THEN NULL ELSE ");
        qb.push(content_column);
        qb.push(" END AS bytes");
    } else {
        qb.push("false AS cached, ");
        qb.push(content_column);
        qb.push(" AS bytes");
    }
    qb.push(" FROM possible_objects o ");
    if params.query.with_content {
        qb.push("JOIN dl.contents c ON c.hash = o.hash ");
    } else {
        // Metadata-only: unpacked objects return no content at all, packed
        // ones return their names tar.
        qb.push("LEFT JOIN dl.contents c ON c.hash = o.hash AND o.packed ");
    }
    if with_cache {
        qb.push("LEFT JOIN cached_object_hashes ch ON ch.hash = o.hash ");
    }
    if !snapshot {
        qb.push("WHERE (o.stop_version IS NULL OR o.stop_version > ");
        qb.push_bind(params.range.to);
        qb.push(")");
    }
    qb.push(")");

    if !snapshot {
        // Paths whose interval closed inside the range and were not
        // replaced. A directory is not "removed" while a descendant was
        // updated; it merely changed.
        qb.push(
            ", removed_objects AS (\
             SELECT DISTINCT o.path FROM possible_objects o WHERE o.stop_version > ",
        );
        qb.push_bind(params.range.from);
        qb.push(" AND o.stop_version <= ");
        qb.push_bind(params.range.to);
        qb.push(
            " AND NOT EXISTS (SELECT 1 FROM updated_objects u WHERE u.path = o.path) \
             AND NOT (right(o.path, 1) = '/' AND EXISTS \
             (SELECT 1 FROM updated_objects u WHERE starts_with(u.path, o.path))))",
        );
    }

    qb.push(" SELECT path, mode, size, packed, cached, deleted, bytes");
    if params.with_hash {
        qb.push(", h1, h2");
    }
    qb.push(" FROM (SELECT path, mode, size, packed, cached, false AS deleted, bytes");
    if params.with_hash {
        qb.push(", (hash).h1 AS h1, (hash).h2 AS h2");
    }
    qb.push(" FROM updated_objects");
    if !snapshot {
        qb.push(
            " UNION ALL SELECT path, 0 AS mode, 0 AS size, false AS packed, \
             false AS cached, true AS deleted, NULL AS bytes",
        );
        if params.with_hash {
            qb.push(", NULL::uuid AS h1, NULL::uuid AS h2");
        }
        qb.push(" FROM removed_objects");
    }
    qb.push(") q");

    if let Some(page) = page {
        if let Some(after) = page.after_path {
            qb.push(" WHERE q.path > ");
            qb.push_bind(after.to_string());
        }
        qb.push(" ORDER BY q.path LIMIT ");
        qb.push_bind(page.limit);
    } else {
        qb.push(" ORDER BY q.path");
    }

    Ok(qb)
}
