use std::collections::BTreeMap;

use bytes::Bytes;

use super::{read_objects, write_pack, PackError};
use crate::Object;

/// Rewrite a packed aggregate with a list of overrides keyed by path.
///
/// Walks the existing tar once: members named by an override are replaced
/// (or dropped when the override is a tombstone), everything else is
/// re-emitted unchanged. Overrides that named no existing member are
/// appended afterwards in path order, so equal logical trees serialize to
/// equal bytes and an unchanged aggregate can be detected by hash.
///
/// Among overrides for the same path, the last one wins. Yields
/// [PackError::Empty] when the merge leaves no members.
pub fn rewrite_pack(
    existing: Option<&[u8]>,
    overrides: &[Object],
) -> Result<(Bytes, Bytes), PackError> {
    let mut pending: BTreeMap<&str, &Object> = overrides
        .iter()
        .map(|object| (object.path.as_str(), object))
        .collect();

    let mut merged: Vec<Object> = Vec::new();
    if let Some(tar_bytes) = existing {
        for member in read_objects(tar_bytes)? {
            match pending.remove(member.path.as_str()) {
                Some(object) if object.deleted => continue,
                Some(object) => merged.push(object.clone()),
                None => merged.push(member),
            }
        }
    }

    merged.extend(
        pending
            .into_values()
            .filter(|object| !object.deleted)
            .cloned(),
    );

    write_pack(merged)
}
