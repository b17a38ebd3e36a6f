//! Content encoding and tar packing for the baumlager tree store.
//!
//! This crate is deliberately free of any storage backend: it deals in
//! in-memory byte blobs only. The engine crate layers versioning and the
//! database on top.

mod codec;
mod object;
pub mod tar;

pub use codec::{hash_content, ContentDecoder, ContentEncoder, HASH_LEN};
pub use object::{Object, MODE_DIR, MODE_REGULAR, MODE_SYMLINK, MODE_TYPE_MASK};
