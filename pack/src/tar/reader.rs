use std::io::{self, Cursor, Read};

use bytes::Bytes;

use super::{TYPE_CACHED, TYPE_DELETED};
use crate::{Object, MODE_DIR, MODE_REGULAR, MODE_SYMLINK};

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Read the members of an in-memory (decoded) tar blob back into objects.
///
/// `'D'` tombstones survive the round trip; `'C'` placeholders never occur
/// inside stored aggregates and are rejected.
pub fn read_objects(tar_bytes: &[u8]) -> io::Result<Vec<Object>> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    let mut objects = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8(entry.path_bytes().to_vec())
            .map_err(|_| invalid_data("tar member path is not valid utf-8".into()))?;
        let entry_type = entry.header().entry_type();
        let perms = (entry.header().mode()? & 0o7777) as i64;

        let object = match entry_type.as_byte() {
            TYPE_DELETED => Object::deleted(path),
            TYPE_CACHED => {
                return Err(invalid_data(format!(
                    "cached placeholder for {} inside an aggregate",
                    path
                )))
            }
            // pax extension headers carry no object
            b'x' | b'g' => continue,
            _ if entry_type.is_dir() => Object {
                path,
                mode: MODE_DIR | perms,
                size: 0,
                deleted: false,
                content: Some(Bytes::new()),
            },
            _ if entry_type.is_symlink() => {
                let target = entry.link_name()?.ok_or_else(|| {
                    invalid_data(format!("symlink {} has no target", path))
                })?;
                let target = target.to_string_lossy().into_owned().into_bytes();
                Object {
                    path,
                    mode: MODE_SYMLINK | perms,
                    size: 0,
                    deleted: false,
                    content: Some(Bytes::from(target)),
                }
            }
            _ if entry_type.is_file() => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                Object {
                    path,
                    mode: MODE_REGULAR | perms,
                    size: data.len() as i64,
                    deleted: false,
                    content: Some(Bytes::from(data)),
                }
            }
            other => {
                return Err(invalid_data(format!(
                    "unsupported tar entry type {:?} for {}",
                    other as char, path
                )))
            }
        };
        objects.push(object);
    }

    Ok(objects)
}
