use std::io::{self, Cursor};

use bytes::Bytes;

use super::{PackError, TYPE_CACHED, TYPE_DELETED};
use crate::{Object, HASH_LEN};

/// Writes objects into an in-memory tar archive.
///
/// The writer is reusable: [TarWriter::finish_reset] hands back the raw
/// (uncompressed) archive bytes and leaves the writer empty. Compression is
/// the caller's business, which lets stored aggregates be forwarded without
/// a decode/encode round trip.
pub struct TarWriter {
    builder: tar::Builder<Vec<u8>>,
    size: u64,
    entries: usize,
}

impl TarWriter {
    pub fn new() -> Self {
        TarWriter {
            builder: tar::Builder::new(Vec::new()),
            size: 0,
            entries: 0,
        }
    }

    /// Append one object. With `with_content` unset, regular files get a
    /// header-only entry of size zero (the names-tar form).
    pub fn append(&mut self, object: &Object, with_content: bool) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_mode(object.permissions());
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        if object.deleted {
            header.set_entry_type(tar::EntryType::new(TYPE_DELETED));
            header.set_size(0);
            self.builder
                .append_data(&mut header, &object.path, io::empty())?;
        } else if object.is_dir() {
            header.set_entry_type(tar::EntryType::dir());
            header.set_size(0);
            self.builder
                .append_data(&mut header, &object.path, io::empty())?;
        } else if object.is_symlink() {
            let target = object.content.as_deref().unwrap_or_default();
            let target = std::str::from_utf8(target).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("symlink target for {} is not valid utf-8", object.path),
                )
            })?;
            header.set_entry_type(tar::EntryType::symlink());
            header.set_size(0);
            self.builder
                .append_link(&mut header, &object.path, target)?;
        } else {
            header.set_entry_type(tar::EntryType::file());
            let content = if with_content {
                object.content.clone().unwrap_or_default()
            } else {
                Bytes::new()
            };
            header.set_size(content.len() as u64);
            self.builder
                .append_data(&mut header, &object.path, Cursor::new(content))?;
        }

        // Approximation of emitted bytes, used as the flush threshold when
        // cutting output tars. Header blocks are not counted exactly.
        self.size += object.size.max(0) as u64 + object.path.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Append a `'C'` placeholder whose body is the 32-byte content hash.
    pub fn append_cached(&mut self, path: &str, hash: &[u8; HASH_LEN]) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::new(TYPE_CACHED));
        header.set_size(HASH_LEN as u64);
        self.builder.append_data(&mut header, path, &hash[..])?;

        self.size += HASH_LEN as u64 + path.len() as u64;
        self.entries += 1;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Terminate the archive and return its bytes, resetting the writer.
    pub fn finish_reset(&mut self) -> io::Result<Bytes> {
        let builder = std::mem::replace(&mut self.builder, tar::Builder::new(Vec::new()));
        let buf = builder.into_inner()?;
        self.size = 0;
        self.entries = 0;
        Ok(Bytes::from(buf))
    }
}

impl Default for TarWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame `objects` as the two parallel tars an aggregate is stored as: the
/// content-tar (full bodies) and the names-tar (headers only).
///
/// Tombstones are dropped; an aggregate only ever holds live members.
/// Yields [PackError::Empty] when nothing was written, which callers treat
/// as "the aggregate ceased to exist".
pub fn write_pack<I>(objects: I) -> Result<(Bytes, Bytes), PackError>
where
    I: IntoIterator<Item = Object>,
{
    let mut content = TarWriter::new();
    let mut names = TarWriter::new();

    for object in objects {
        if object.deleted {
            continue;
        }
        content.append(&object, true)?;
        names.append(&object, false)?;
    }

    if content.is_empty() {
        return Err(PackError::Empty);
    }
    Ok((content.finish_reset()?, names.finish_reset()?))
}
