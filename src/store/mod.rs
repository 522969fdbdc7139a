//! # Sharded Key-Value Store
//!
//! Partitions the logical key space across independent storage backend
//! instances, each guarded by its own reader-writer lock. Routing is
//! FNV-1a (32-bit) of the key modulo the shard count, so a key always
//! lands on the same shard.

use thiserror::Error;

use crate::storage::StorageError;

mod sharded;

pub use sharded::{ShardedKv, ShardedKvStats};

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Empty or oversize key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Construction-time misconfiguration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation after shutdown
    #[error("store is closed")]
    Closed,

    /// Forwarded storage-layer failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash, the routing function for both shard and partition
/// selection.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Validate a key before any lock is taken.
pub(crate) fn validate_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        // Standard FNV-1a 32-bit test vectors.
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_fnv1a_deterministic() {
        for key in [&b"alpha"[..], b"beta", b"\x00\xff\x7f", b"long-key-with-more-bytes"] {
            assert_eq!(fnv1a_32(key), fnv1a_32(key));
        }
    }

    #[test]
    fn test_validate_key_rejects_empty() {
        assert!(matches!(validate_key(b""), Err(StoreError::InvalidKey(_))));
        assert!(validate_key(b"k").is_ok());
    }

    #[test]
    fn test_validate_key_rejects_oversize() {
        let big = vec![0u8; MAX_KEY_LEN + 1];
        assert!(matches!(validate_key(&big), Err(StoreError::InvalidKey(_))));
        let max = vec![0u8; MAX_KEY_LEN];
        assert!(validate_key(&max).is_ok());
    }
}
