//! Tar framing for object groups.
//!
//! Objects are framed as ustar/GNU entries whose header carries the path,
//! permission bits, type flag and size. Two typeflags extend the format on
//! the wire:
//!
//! * `'D'` — a deleted path (size 0, no body).
//! * `'C'` — a cached-by-hash placeholder whose 32-byte body is the content
//!   hash; the receiver substitutes the blob from its local cache.
//!
//! Packed subtree aggregates are themselves tars in this format, minus the
//! `'C'` flag, which only ever appears on outgoing streams.

mod reader;
mod rewrite;
mod writer;


pub use reader::read_objects;
pub use rewrite::rewrite_pack;
pub use writer::{write_pack, TarWriter};

use thiserror::Error;

/// Typeflag marking a deleted path.
pub const TYPE_DELETED: u8 = b'D';
/// Typeflag marking a cached-by-hash placeholder.
pub const TYPE_CACHED: u8 = b'C';

#[derive(Debug, Error)]
pub enum PackError {
    /// The input produced no entries, so there is no aggregate to store.
    #[error("no entries written to pack")]
    Empty,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
