use std::collections::VecDeque;

use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use sqlx::{PgPool, Postgres, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use baumlager_pack::{tar, ContentDecoder, ContentEncoder, Object};

use crate::matcher::PackMatcher;
use crate::planner::{self, ObjectQuery, ObjectRow, Page, PlanParams, VersionRange, CHUNK_SIZE};
use crate::projects;
use crate::{Error, Result};

/// Flush an output tar once its accumulated size crosses this target.
const TARGET_TAR_SIZE: u64 = 512 * 1024;

/// One turn of a lazy producer.
#[derive(Debug)]
pub enum Step<T> {
    /// An item is ready.
    Yield(T),
    /// Nothing this turn; ask again.
    Skip,
    /// The stream is exhausted.
    Done,
}

/// One emission of the tar producer: a compressed tar, plus the pack prefix
/// when it is a forwarded aggregate the receiver must re-scope.
#[derive(Debug)]
pub struct SentTar {
    pub bytes: Bytes,
    pub pack_path: Option<String>,
}

/// The original query, retained for post-filtering after a pack redirect.
#[derive(Clone, Debug)]
struct ObjectFilter {
    path: String,
    is_prefix: bool,
    ignores: Vec<String>,
}

impl ObjectFilter {
    fn from_query(query: &ObjectQuery) -> Self {
        ObjectFilter {
            path: query.path.clone(),
            is_prefix: query.is_prefix,
            ignores: query.ignores.clone(),
        }
    }

    fn matches(&self, path: &str) -> bool {
        let hit = if self.is_prefix {
            path.starts_with(&self.path)
        } else {
            path == self.path
        };
        hit && !self.ignores.iter().any(|ignore| path.starts_with(ignore.as_str()))
    }

    /// A removed directory also answers queries below it.
    fn matches_removed(&self, path: &str) -> bool {
        self.matches(path) || (path.ends_with('/') && self.path.starts_with(path))
    }
}

/// Pulls planned rows out of the backing store in path-ordered chunks,
/// holding one repeatable-read transaction open for its whole life.
struct RowPump {
    tx: Transaction<'static, Postgres>,
    project: i64,
    range: VersionRange,
    query: ObjectQuery,
    cache_versions: Vec<i64>,
    cursor: Option<String>,
    buffer: VecDeque<ObjectRow>,
    exhausted: bool,
}

impl RowPump {
    async fn next_row(&mut self) -> Result<Option<ObjectRow>> {
        if let Some(row) = self.buffer.pop_front() {
            return Ok(Some(row));
        }
        if self.exhausted {
            return Ok(None);
        }

        let params = PlanParams {
            project: self.project,
            range: self.range,
            query: &self.query,
            cache_versions: &self.cache_versions,
            with_hash: true,
        };
        let page = Page {
            after_path: self.cursor.as_deref(),
            limit: CHUNK_SIZE,
        };
        let mut qb = planner::build_query(&params, Some(&page))?;
        let rows: Vec<ObjectRow> = qb
            .build_query_as()
            .fetch_all(&mut *self.tx)
            .await?;

        if (rows.len() as i64) < CHUNK_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = Some(last.path.clone());
        }
        self.buffer = rows.into();
        Ok(self.buffer.pop_front())
    }
}

/// Begin a read: open a snapshot transaction, resolve the target version,
/// and redirect the query to its covering aggregate when the project's pack
/// patterns say so.
async fn open_pump(
    pool: &PgPool,
    project: i64,
    mut range: VersionRange,
    query: ObjectQuery,
    cache_versions: Vec<i64>,
) -> Result<(RowPump, ObjectFilter)> {
    query.validate()?;

    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;

    let (latest_version, pack_patterns) = projects::project_row(&mut tx, project).await?;
    if range.to <= 0 {
        range.to = latest_version;
    }
    range.validate()?;

    let matcher = PackMatcher::compile(&pack_patterns)?;
    let filter = ObjectFilter::from_query(&query);
    let pack_prefix = matcher.pack_prefix(&query.path).map(str::to_string);
    let effective = match pack_prefix {
        Some(prefix) => ObjectQuery {
            path: prefix,
            is_prefix: true,
            with_content: query.with_content,
            ignores: query.ignores,
        },
        None => query,
    };

    Ok((
        RowPump {
            tx,
            project,
            range,
            query: effective,
            cache_versions,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        },
        filter,
    ))
}

/// Yields one object per live row, expanding aggregates into their members.
pub struct ObjectStream {
    pump: RowPump,
    filter: ObjectFilter,
    with_content: bool,
    unpacked: VecDeque<Object>,
    decoder: ContentDecoder,
    cancel: CancellationToken,
}

#[instrument(skip_all, fields(project = project))]
pub(crate) async fn object_stream(
    pool: &PgPool,
    project: i64,
    range: VersionRange,
    query: ObjectQuery,
    cache_versions: Vec<i64>,
    cancel: CancellationToken,
) -> Result<ObjectStream> {
    let with_content = query.with_content;
    let (pump, filter) = open_pump(pool, project, range, query, cache_versions).await?;
    Ok(ObjectStream {
        pump,
        filter,
        with_content,
        unpacked: VecDeque::new(),
        decoder: ContentDecoder::new(),
        cancel,
    })
}

impl ObjectStream {
    pub async fn next(&mut self) -> Result<Step<Object>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(member) = self.unpacked.pop_front() {
            return Ok(Step::Yield(member));
        }

        let Some(row) = self.pump.next_row().await? else {
            return Ok(Step::Done);
        };

        if row.deleted {
            return if self.filter.matches_removed(&row.path) {
                Ok(Step::Yield(Object::deleted(row.path)))
            } else {
                Ok(Step::Skip)
            };
        }
        if row.cached {
            return Err(Error::CachedInObjectMode);
        }
        if row.packed {
            let bytes = row.bytes.as_deref().ok_or_else(|| {
                Error::Internal(format!("aggregate {} has no stored tar", row.path))
            })?;
            let decoded = self.decoder.decode(bytes)?;
            let members = tar::read_objects(&decoded)?;
            self.unpacked = members
                .into_iter()
                .filter(|member| self.filter.matches(&member.path))
                .collect();
            return Ok(Step::Skip);
        }
        if !self.filter.matches(&row.path) {
            return Ok(Step::Skip);
        }

        let content = match (self.with_content, row.bytes.as_deref()) {
            (true, Some(bytes)) => Some(self.decoder.decode(bytes)?),
            _ => None,
        };
        Ok(Step::Yield(Object {
            path: row.path,
            mode: row.mode,
            size: row.size,
            deleted: false,
            content,
        }))
    }

    pub fn into_stream(mut self) -> BoxStream<'static, Result<Object>> {
        Box::pin(try_stream! {
            loop {
                match self.next().await? {
                    Step::Yield(object) => yield object,
                    Step::Skip => continue,
                    Step::Done => break,
                }
            }
        })
    }
}

/// Groups rows into compressed output tars, forwarding stored aggregates
/// untouched and replacing cached blobs with `'C'` placeholders.
pub struct TarStream {
    pump: RowPump,
    filter: ObjectFilter,
    with_content: bool,
    writer: tar::TarWriter,
    encoder: ContentEncoder,
    decoder: ContentDecoder,
    pending: VecDeque<SentTar>,
    cancel: CancellationToken,
    done: bool,
}

#[instrument(skip_all, fields(project = project))]
pub(crate) async fn tar_stream(
    pool: &PgPool,
    project: i64,
    range: VersionRange,
    query: ObjectQuery,
    cache_versions: Vec<i64>,
    cancel: CancellationToken,
) -> Result<TarStream> {
    let with_content = query.with_content;
    let (pump, filter) = open_pump(pool, project, range, query, cache_versions).await?;
    Ok(TarStream {
        pump,
        filter,
        with_content,
        writer: tar::TarWriter::new(),
        encoder: ContentEncoder::new(),
        decoder: ContentDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        done: false,
    })
}

impl TarStream {
    pub async fn next(&mut self) -> Result<Step<SentTar>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(tar) = self.pending.pop_front() {
            return Ok(Step::Yield(tar));
        }
        if self.done {
            return Ok(Step::Done);
        }

        let Some(row) = self.pump.next_row().await? else {
            self.done = true;
            if !self.writer.is_empty() {
                return Ok(Step::Yield(self.flush()?));
            }
            return Ok(Step::Done);
        };

        if row.deleted {
            if self.filter.matches_removed(&row.path) {
                self.writer.append(&Object::deleted(row.path), false)?;
            }
        } else if row.cached {
            let hash = row.hash().ok_or_else(|| {
                Error::Internal(format!("cached row {} carries no hash", row.path))
            })?;
            self.writer.append_cached(&row.path, &hash.as_bytes())?;
        } else if row.packed {
            // The stored aggregate is itself a compressed tar of the
            // subtree; forward it whole.
            let bytes = row.bytes.ok_or_else(|| {
                Error::Internal(format!("aggregate {} has no stored tar", row.path))
            })?;
            let forward = SentTar {
                bytes: Bytes::from(bytes),
                pack_path: Some(row.path),
            };
            if !self.writer.is_empty() {
                let flushed = self.flush()?;
                self.pending.push_back(forward);
                return Ok(Step::Yield(flushed));
            }
            return Ok(Step::Yield(forward));
        } else if self.filter.matches(&row.path) {
            let content = match row.bytes.as_deref() {
                Some(bytes) => Some(self.decoder.decode(bytes)?),
                None => None,
            };
            let object = Object {
                path: row.path,
                mode: row.mode,
                size: row.size,
                deleted: false,
                content,
            };
            self.writer.append(&object, self.with_content)?;
        }

        if self.writer.size() >= TARGET_TAR_SIZE {
            return Ok(Step::Yield(self.flush()?));
        }
        Ok(Step::Skip)
    }

    fn flush(&mut self) -> Result<SentTar> {
        let raw = self.writer.finish_reset()?;
        Ok(SentTar {
            bytes: self.encoder.encode(&raw)?,
            pack_path: None,
        })
    }

    pub fn into_stream(mut self) -> BoxStream<'static, Result<SentTar>> {
        Box::pin(try_stream! {
            loop {
                match self.next().await? {
                    Step::Yield(tar) => yield tar,
                    Step::Skip => continue,
                    Step::Done => break,
                }
            }
        })
    }
}
