//! A versioned, content-addressed file tree store.
//!
//! Projects hold an append-only history of path bindings; every write
//! advances a gap-free version counter under a per-project row lock.
//! Content is deduplicated by SHA-256, selected subtrees are stored as
//! single tar aggregates, and reads materialize the diff between any two
//! versions as either an object stream or a stream of compressed tars.
//!
//! The backing store is PostgreSQL; see `schema.sql` for the expected
//! layout. Transport, authentication and on-disk materialization live with
//! the callers of [TreeStore].

mod cache;
mod errors;
mod gc;
mod hashes;
mod maintenance;
mod matcher;
mod planner;
mod projects;
mod read;
mod store;
mod write;

pub use baumlager_pack::{Object, MODE_DIR, MODE_REGULAR, MODE_SYMLINK, MODE_TYPE_MASK};

pub use cache::CacheTar;
pub use errors::{Error, Result};
pub use hashes::ContentHash;
pub use matcher::PackMatcher;
pub use planner::{ObjectQuery, VersionRange};
pub use read::{ObjectStream, SentTar, Step, TarStream};
pub use store::{Environment, TreeStore};
pub use projects::Project;
pub use write::UpdateEntry;
