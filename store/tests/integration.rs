//! Database-backed test scenarios.
//!
//! Run with `cargo test --features integration` against a PostgreSQL
//! reachable via DATABASE_URL; the schema is installed on first use. Each
//! test owns its project ids so the suite can run concurrently.
#![cfg(feature = "integration")]

use std::collections::BTreeMap;
use std::io::Read;

use futures::{stream, TryStreamExt};
use sqlx::{Executor, PgPool};
use tokio_util::sync::CancellationToken;

use baumlager_pack::{ContentDecoder, Object};
use baumlager_store::{
    ContentHash, Environment, Error, ObjectQuery, Step, TreeStore, UpdateEntry, VersionRange,
};

async fn test_store() -> TreeStore {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must point at a disposable test database");
    let store = TreeStore::connect(&url).await.expect("connect");
    install_schema(store.pool()).await;
    store
}

async fn install_schema(pool: &PgPool) {
    let mut conn = pool.acquire().await.expect("acquire");
    sqlx::query("SELECT pg_advisory_lock(871234)")
        .execute(&mut *conn)
        .await
        .expect("lock");
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = 'dl')",
    )
    .fetch_one(&mut *conn)
    .await
    .expect("check schema");
    if !exists {
        conn.execute(include_str!("../schema.sql"))
            .await
            .expect("install schema");
    }
    sqlx::query("SELECT pg_advisory_unlock(871234)")
        .execute(&mut *conn)
        .await
        .expect("unlock");
}

async fn fresh_project(store: &TreeStore, project: i64, patterns: &[&str]) {
    match store.delete_project(project).await {
        Ok(()) | Err(Error::ProjectNotFound(_)) => {}
        Err(err) => panic!("cleanup failed: {err}"),
    }
    store
        .create_project(project, patterns.iter().map(|p| p.to_string()).collect())
        .await
        .expect("create project");
}

fn updates(project: i64, objects: Vec<Object>) -> impl futures::Stream<Item = Result<UpdateEntry, Error>> {
    stream::iter(
        objects
            .into_iter()
            .map(move |object| Ok(UpdateEntry { project, object }))
            .collect::<Vec<_>>(),
    )
}

async fn collect_objects(
    store: &TreeStore,
    project: i64,
    range: VersionRange,
    query: ObjectQuery,
    cache_versions: Vec<i64>,
) -> Result<Vec<Object>, Error> {
    let stream = store
        .get_objects(project, range, query, cache_versions, CancellationToken::new())
        .await?;
    stream.into_stream().try_collect().await
}

fn content_of(object: &Object) -> &[u8] {
    object.content.as_deref().unwrap_or_default()
}

#[tokio::test]
async fn create_write_read() {
    let store = test_store().await;
    fresh_project(&store, 9101, &[]).await;

    let version = store
        .update(updates(
            9101,
            vec![Object::regular("a/b.txt", &b"hello"[..])],
        ))
        .await
        .expect("update");
    assert_eq!(version, 1);
    assert_eq!(store.latest_version(9101).await.expect("latest"), 1);

    let objects = collect_objects(
        &store,
        9101,
        VersionRange { from: 0, to: 1 },
        ObjectQuery::prefix(""),
        Vec::new(),
    )
    .await
    .expect("read");

    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].path, "a/b.txt");
    assert!(!objects[0].deleted);
    assert_eq!(content_of(&objects[0]), b"hello");
}

#[tokio::test]
async fn delete_shows_tombstone_in_diff() {
    let store = test_store().await;
    fresh_project(&store, 9102, &[]).await;

    store
        .update(updates(
            9102,
            vec![Object::regular("a/b.txt", &b"hello"[..])],
        ))
        .await
        .expect("v1");
    store
        .update(updates(9102, vec![Object::deleted("a/b.txt")]))
        .await
        .expect("v2");

    let objects = collect_objects(
        &store,
        9102,
        VersionRange { from: 1, to: 2 },
        ObjectQuery::prefix(""),
        Vec::new(),
    )
    .await
    .expect("diff");

    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].path, "a/b.txt");
    assert!(objects[0].deleted);
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let store = test_store().await;
    fresh_project(&store, 9103, &[]).await;
    fresh_project(&store, 9104, &[]).await;

    let blob = b"dedup blob 9103/9104";
    store
        .update(updates(9103, vec![Object::regular("a.txt", &blob[..])]))
        .await
        .expect("first write");
    store
        .update(updates(9104, vec![Object::regular("b.txt", &blob[..])]))
        .await
        .expect("second write");

    let hash = ContentHash::of(blob);
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dl.contents WHERE hash = $1")
        .bind(hash)
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn packed_subtree_serves_single_members() {
    let store = test_store().await;
    fresh_project(&store, 9105, &["^node_modules/"]).await;

    let mut objects = Vec::new();
    for i in 0..100 {
        objects.push(Object::regular(
            format!("node_modules/pkg/mod{i}.js"),
            format!("export default {i};\n").into_bytes(),
        ));
    }
    let version = store.update(updates(9105, objects)).await.expect("update");
    assert_eq!(version, 1);

    // A single aggregate row landed at the prefix.
    let packed_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM dl.objects \
         WHERE project = $1 AND packed AND stop_version IS NULL",
    )
    .bind(9105_i64)
    .fetch_one(store.pool())
    .await
    .expect("count");
    assert_eq!(packed_rows, 1);

    let objects = collect_objects(
        &store,
        9105,
        VersionRange { from: 0, to: 1 },
        ObjectQuery::exact("node_modules/pkg/mod42.js"),
        Vec::new(),
    )
    .await
    .expect("read");

    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].path, "node_modules/pkg/mod42.js");
    assert_eq!(content_of(&objects[0]), b"export default 42;\n");
}

#[tokio::test]
async fn cached_aggregates_become_placeholder_entries() {
    let store = test_store().await;
    fresh_project(&store, 9106, &["^npmcache/"]).await;

    store
        .update(updates(
            9106,
            vec![
                Object::regular("npmcache/pkg/a.js", &b"cached module a"[..]),
                Object::regular("npmcache/pkg/b.js", &b"cached module b"[..]),
            ],
        ))
        .await
        .expect("update");

    let (h1, h2): (sqlx::types::Uuid, sqlx::types::Uuid) = sqlx::query_as(
        "SELECT (hash).h1, (hash).h2 FROM dl.objects \
         WHERE project = $1 AND path = 'npmcache/' AND stop_version IS NULL",
    )
    .bind(9106_i64)
    .fetch_one(store.pool())
    .await
    .expect("aggregate hash");
    let aggregate_hash = ContentHash { h1, h2 };

    let cache_version = store
        .create_cache("npmcache/", 10)
        .await
        .expect("create cache");

    let mut tars = store
        .get_tars(
            9106,
            VersionRange { from: 0, to: 1 },
            ObjectQuery::prefix("npmcache/"),
            vec![cache_version],
            CancellationToken::new(),
        )
        .await
        .expect("tar stream");

    let mut decoder = ContentDecoder::new();
    let mut placeholder_payload = None;
    loop {
        match tars.next().await.expect("next tar") {
            Step::Yield(sent) => {
                // Forwarded aggregates never appear for cached hashes.
                assert!(sent.pack_path.is_none());
                let raw = decoder.decode(&sent.bytes).expect("decode tar");
                let mut archive = tar::Archive::new(std::io::Cursor::new(&raw[..]));
                for entry in archive.entries().expect("entries") {
                    let mut entry = entry.expect("entry");
                    if entry.header().entry_type().as_byte() == b'C' {
                        let mut payload = Vec::new();
                        entry.read_to_end(&mut payload).expect("payload");
                        placeholder_payload = Some(payload);
                    }
                }
            }
            Step::Skip => continue,
            Step::Done => break,
        }
    }

    assert_eq!(
        placeholder_payload.expect("placeholder entry"),
        aggregate_hash.as_bytes().to_vec()
    );
}

#[tokio::test]
async fn reset_winds_versions_back() {
    let store = test_store().await;
    fresh_project(&store, 9107, &[]).await;

    store
        .update(updates(9107, vec![Object::regular("keep.txt", &b"v1"[..])]))
        .await
        .expect("v1");
    store
        .update(updates(9107, vec![Object::regular("keep.txt", &b"v2"[..])]))
        .await
        .expect("v2");
    store
        .update(updates(9107, vec![Object::regular("later.txt", &b"v3"[..])]))
        .await
        .expect("v3");

    store.reset_project(9107, 1).await.expect("reset");
    assert_eq!(store.latest_version(9107).await.expect("latest"), 1);

    let objects = collect_objects(
        &store,
        9107,
        VersionRange { from: 0, to: 1 },
        ObjectQuery::prefix(""),
        Vec::new(),
    )
    .await
    .expect("read");

    // Rows born after version 1 are gone, the v1 row is live again.
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].path, "keep.txt");
    assert_eq!(content_of(&objects[0]), b"v1");
}

#[tokio::test]
async fn versions_are_gap_free_and_empty_updates_commit_nothing() {
    let store = test_store().await;
    fresh_project(&store, 9108, &[]).await;

    for expected in 1..=3 {
        let version = store
            .update(updates(
                9108,
                vec![Object::regular("f.txt", format!("gen {expected}").into_bytes())],
            ))
            .await
            .expect("update");
        assert_eq!(version, expected);
    }

    let version = store.update(updates(9108, vec![])).await.expect("empty");
    assert_eq!(version, -1);
    assert_eq!(store.latest_version(9108).await.expect("latest"), 3);
}

#[tokio::test]
async fn one_live_row_per_path() {
    let store = test_store().await;
    fresh_project(&store, 9109, &[]).await;

    for generation in 0..4 {
        store
            .update(updates(
                9109,
                vec![
                    Object::regular("dup.txt", format!("gen {generation}").into_bytes()),
                    Object::directory("dir/"),
                ],
            ))
            .await
            .expect("update");
    }

    let max_live: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(live), 0) FROM (\
           SELECT COUNT(*) AS live FROM dl.objects \
            WHERE project = $1 AND stop_version IS NULL GROUP BY path) counts",
    )
    .bind(9109_i64)
    .fetch_one(store.pool())
    .await
    .expect("count");
    assert_eq!(max_live, 1);
}

#[tokio::test]
async fn diff_treats_delete_after_modify_as_removal() {
    let store = test_store().await;
    fresh_project(&store, 9110, &[]).await;

    store
        .update(updates(9110, vec![Object::regular("a.txt", &b"one"[..])]))
        .await
        .expect("v1");
    store
        .update(updates(
            9110,
            vec![
                Object::regular("a.txt", &b"two"[..]),
                Object::regular("b.txt", &b"bee"[..]),
            ],
        ))
        .await
        .expect("v2");
    store
        .update(updates(9110, vec![Object::deleted("a.txt")]))
        .await
        .expect("v3");

    let objects = collect_objects(
        &store,
        9110,
        VersionRange { from: 1, to: 3 },
        ObjectQuery::prefix(""),
        Vec::new(),
    )
    .await
    .expect("diff");

    let by_path: BTreeMap<&str, &Object> =
        objects.iter().map(|o| (o.path.as_str(), o)).collect();
    assert_eq!(by_path.len(), 2);
    assert!(by_path["a.txt"].deleted);
    assert!(!by_path["b.txt"].deleted);
    assert_eq!(content_of(by_path["b.txt"]), b"bee");
}

#[tokio::test]
async fn update_stream_must_stay_in_one_project() {
    let store = test_store().await;
    fresh_project(&store, 9111, &[]).await;
    fresh_project(&store, 9112, &[]).await;

    let entries = stream::iter(vec![
        Ok(UpdateEntry {
            project: 9111,
            object: Object::regular("a.txt", &b"a"[..]),
        }),
        Ok(UpdateEntry {
            project: 9112,
            object: Object::regular("b.txt", &b"b"[..]),
        }),
    ]);

    let err = store.update(entries).await.expect_err("must fail");
    assert!(matches!(err, Error::MultipleProjectsPerUpdate(9111, 9112)));

    // The failed stream rolled back entirely.
    assert_eq!(store.latest_version(9111).await.expect("latest"), 0);
    assert_eq!(store.latest_version(9112).await.expect("latest"), 0);
}

#[tokio::test]
async fn gc_returns_dead_hashes_and_spares_referenced_content() {
    let store = test_store().await;
    fresh_project(&store, 9113, &[]).await;

    let generations: Vec<&[u8]> = vec![b"gc blob 9113 g1", b"gc blob 9113 g2", b"gc blob 9113 g3"];
    for blob in &generations {
        store
            .update(updates(9113, vec![Object::regular("a.txt", blob.to_vec())]))
            .await
            .expect("update");
    }

    let retired = store
        .gc_project_objects(9113, 0, 0)
        .await
        .expect("gc objects");
    let mut expected = vec![
        ContentHash::of(generations[0]),
        ContentHash::of(generations[1]),
    ];
    let mut retired_sorted = retired.clone();
    retired_sorted.sort();
    expected.sort();
    assert_eq!(retired_sorted, expected);

    // Sweep the retired hashes plus the still-live one; only the dead two
    // may disappear.
    let mut candidates = retired;
    candidates.push(ContentHash::of(generations[2]));
    let swept = store
        .gc_content_hashes(&candidates)
        .await
        .expect("gc contents");
    assert_eq!(swept, 2);

    let live_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dl.contents WHERE hash = $1")
        .bind(ContentHash::of(generations[2]))
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(live_rows, 1);
}

#[tokio::test]
async fn clone_applies_source_diffs_to_target() {
    let store = test_store().await;
    fresh_project(&store, 9114, &[]).await;
    fresh_project(&store, 9115, &[]).await;

    store
        .update(updates(
            9114,
            vec![
                Object::regular("x.txt", &b"clone x"[..]),
                Object::regular("y/z.txt", &b"clone z"[..]),
            ],
        ))
        .await
        .expect("source v1");

    let target_version = store
        .clone_to_project(9114, 9115, VersionRange { from: 0, to: 1 })
        .await
        .expect("clone");
    assert_eq!(target_version, 1);

    let objects = collect_objects(
        &store,
        9115,
        VersionRange { from: 0, to: 1 },
        ObjectQuery::prefix(""),
        Vec::new(),
    )
    .await
    .expect("read target");
    assert_eq!(objects.len(), 2);
    assert_eq!(content_of(&objects[0]), b"clone x");

    // Incremental clone of the next source version.
    store
        .update(updates(9114, vec![Object::regular("x.txt", &b"clone x2"[..])]))
        .await
        .expect("source v2");
    let target_version = store
        .clone_to_project(9114, 9115, VersionRange { from: 1, to: 2 })
        .await
        .expect("clone 2");
    assert_eq!(target_version, 2);

    let objects = collect_objects(
        &store,
        9115,
        VersionRange { from: 0, to: 2 },
        ObjectQuery::exact("x.txt"),
        Vec::new(),
    )
    .await
    .expect("read target 2");
    assert_eq!(content_of(&objects[0]), b"clone x2");
}

#[tokio::test]
async fn copying_requires_identical_pack_patterns() {
    let store = test_store().await;
    fresh_project(&store, 9116, &["^node_modules/"]).await;
    fresh_project(&store, 9117, &[]).await;

    let err = store
        .copy_all_objects(9116, 9117, Environment::Test)
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn destructive_operations_refuse_production() {
    let store = test_store().await;

    assert!(matches!(
        store.reset_all(Environment::Prod).await,
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        store.drop_other_projects(&[1], Environment::Prod).await,
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        store.copy_all_objects(1, 2, Environment::Prod).await,
        Err(Error::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn cancellation_stops_streams_cleanly() {
    let store = test_store().await;
    fresh_project(&store, 9118, &[]).await;
    store
        .update(updates(9118, vec![Object::regular("a.txt", &b"a"[..])]))
        .await
        .expect("update");

    let cancel = CancellationToken::new();
    let mut stream = store
        .get_objects(
            9118,
            VersionRange { from: 0, to: 1 },
            ObjectQuery::prefix(""),
            Vec::new(),
            cancel.clone(),
        )
        .await
        .expect("open");
    cancel.cancel();
    assert!(matches!(stream.next().await, Err(Error::Cancelled)));
}

#[tokio::test]
async fn cached_hashes_error_in_object_mode() {
    let store = test_store().await;
    fresh_project(&store, 9119, &["^blobcache/"]).await;
    store
        .update(updates(
            9119,
            vec![Object::regular("blobcache/pkg/a.js", &b"object mode cache"[..])],
        ))
        .await
        .expect("update");
    let cache_version = store
        .create_cache("blobcache/", 10)
        .await
        .expect("create cache");

    let mut stream = store
        .get_objects(
            9119,
            VersionRange { from: 0, to: 1 },
            ObjectQuery::prefix("blobcache/"),
            vec![cache_version],
            CancellationToken::new(),
        )
        .await
        .expect("open");

    let result = loop {
        match stream.next().await {
            Ok(Step::Skip) => continue,
            other => break other,
        }
    };
    assert!(matches!(result, Err(Error::CachedInObjectMode)));
}

#[tokio::test]
async fn packed_and_direct_storage_read_identically() {
    let store = test_store().await;
    fresh_project(&store, 9120, &["^assets/"]).await;
    fresh_project(&store, 9121, &[]).await;

    let tree = vec![
        Object::regular("assets/img/logo.svg", &b"<svg/>"[..]),
        Object::regular("assets/readme.md", &b"# assets"[..]),
        Object::regular("main.rs", &b"fn main() {}"[..]),
    ];
    store
        .update(updates(9120, tree.clone()))
        .await
        .expect("packed write");
    store
        .update(updates(9121, tree.clone()))
        .await
        .expect("direct write");

    let read = |project| {
        collect_objects(
            &store,
            project,
            VersionRange { from: 0, to: 1 },
            ObjectQuery::prefix(""),
            Vec::new(),
        )
    };
    let packed = read(9120).await.expect("packed read");
    let direct = read(9121).await.expect("direct read");

    let tuples = |objects: &[Object]| {
        objects
            .iter()
            .map(|o| {
                (
                    o.path.clone(),
                    o.mode,
                    o.size,
                    o.content.clone().unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(tuples(&packed), tuples(&direct));
}

#[tokio::test]
async fn snapshot_reads_are_deterministic() {
    let store = test_store().await;
    fresh_project(&store, 9122, &[]).await;
    store
        .update(updates(
            9122,
            vec![
                Object::regular("one.txt", &b"1"[..]),
                Object::regular("two.txt", &b"2"[..]),
                Object::symlink("link", &b"one.txt"[..]),
            ],
        ))
        .await
        .expect("update");

    let read = || {
        collect_objects(
            &store,
            9122,
            VersionRange { from: 0, to: 1 },
            ObjectQuery::prefix(""),
            Vec::new(),
        )
    };
    let first = read().await.expect("first read");
    let second = read().await.expect("second read");
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn vacuum_is_limited_to_engine_tables() {
    let store = test_store().await;
    store
        .vacuum_analyze("dl.objects", 2)
        .await
        .expect("vacuum objects");
    assert!(matches!(
        store.vacuum_analyze("pg_catalog.pg_class", 2).await,
        Err(Error::InvalidArgument(_))
    ));
}
