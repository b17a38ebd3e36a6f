use data_encoding::HEXLOWER;
use uuid::Uuid;

use baumlager_pack::{hash_content, HASH_LEN};

/// A content hash: SHA-256 over the decoded blob.
///
/// Held as two 128-bit halves so it maps directly onto the backing store's
/// composite `hash` type; treat it as a single opaque 256-bit value
/// everywhere else.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(type_name = "hash")]
pub struct ContentHash {
    pub h1: Uuid,
    pub h2: Uuid,
}

impl sqlx::postgres::PgHasArrayType for ContentHash {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_hash")
    }
}

impl ContentHash {
    /// Hash the given decoded content.
    pub fn of(plain: &[u8]) -> Self {
        Self::from(hash_content(plain))
    }

    pub fn as_bytes(&self) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        out[..16].copy_from_slice(self.h1.as_bytes());
        out[16..].copy_from_slice(self.h2.as_bytes());
        out
    }
}

impl From<[u8; HASH_LEN]> for ContentHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        let mut h1 = [0u8; 16];
        let mut h2 = [0u8; 16];
        h1.copy_from_slice(&bytes[..16]);
        h2.copy_from_slice(&bytes[16..]);
        ContentHash {
            h1: Uuid::from_bytes(h1),
            h2: Uuid::from_bytes(h2),
        }
    }
}

impl TryFrom<&[u8]> for ContentHash {
    type Error = crate::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HASH_LEN] = value.try_into().map_err(|_| {
            crate::Error::InvalidArgument(format!("invalid hash length: {}", value.len()))
        })?;
        Ok(Self::from(bytes))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.as_bytes()))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.as_bytes()))
    }
}
