//! # Storage Backend Abstraction
//!
//! Defines the ordered byte-KV interface the rest of the data plane is
//! built on: point reads and writes with optional TTL, atomic write
//! batches, prefix iteration, and closure-based transactions.
//!
//! Two implementations are provided:
//! - `SledBackend`: persistent, one `sled::Db` per instance
//! - `MemoryBackend`: `BTreeMap` under a lock, for diskless deployments
//!
//! Both store values behind an 8-byte big-endian expiry header so that TTL
//! semantics are identical across backends. Expiry is lazy: reads treat
//! expired entries as absent, physical removal happens on overwrite or
//! delete.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub mod memory;
pub mod sled_backend;

pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying engine failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored bytes did not match the expected encoding
    #[error("corrupted entry: {0}")]
    Corrupted(String),

    /// Operation on a closed backend
    #[error("storage backend is closed")]
    Closed,

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A single operation inside a write batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Key bytes
        key: Vec<u8>,
        /// Value bytes
        value: Vec<u8>,
        /// Optional time-to-live
        ttl: Option<Duration>,
    },
    /// Remove a key.
    Delete {
        /// Key bytes
        key: Vec<u8>,
    },
}

/// An atomic group of writes applied in one engine commit.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Queue an insert without expiry.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            key,
            value,
            ttl: None,
        });
    }

    /// Queue an insert with a time-to-live.
    pub fn put_with_ttl(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) {
        self.ops.push(BatchOp::Put {
            key,
            value,
            ttl: Some(ttl),
        });
    }

    /// Queue a removal.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding its operations.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Read/write view inside a storage transaction.
///
/// All mutations made through the view commit together when the
/// transaction body returns `Ok`; a body returning `Err` aborts the
/// transaction and no mutation becomes visible.
pub trait TransactionView {
    /// Read a key within the transaction.
    fn get(&mut self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Write a key within the transaction (no expiry).
    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Remove a key within the transaction.
    fn delete(&mut self, key: &[u8]) -> StorageResult<()>;
}

/// Transaction body signature accepted by [`StorageBackend::transact`].
pub type TxBody<'a> = dyn FnMut(&mut dyn TransactionView) -> StorageResult<()> + 'a;

/// Ordered byte-KV storage engine.
///
/// Keys are opaque byte strings, ordered lexicographically. Values are
/// opaque byte strings with an optional TTL. `get` and `iter_prefix` must
/// report expired entries as absent.
pub trait StorageBackend: Send + Sync {
    /// Point read. Returns `None` for missing or expired keys.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Insert or overwrite a key, optionally with a time-to-live.
    fn put(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> StorageResult<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Collect live entries whose keys start with `prefix`, in key order.
    ///
    /// `limit == 0` means unlimited. Expired entries are skipped and do
    /// not count against the limit.
    fn iter_prefix(&self, prefix: &[u8], limit: usize) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch of writes in one atomic commit.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Run `body` inside a transaction.
    ///
    /// Mutations are atomic: they all commit when `body` returns `Ok` and
    /// none are visible when it returns `Err`. The error is forwarded to
    /// the caller.
    fn transact(&self, body: &mut TxBody<'_>) -> StorageResult<()>;

    /// Flush and close the backend. Idempotent; operations after close
    /// fail with [`StorageError::Closed`].
    fn close(&self) -> StorageResult<()>;
}

/// Length of the expiry header stamped in front of every stored value.
pub(crate) const ENTRY_HEADER_LEN: usize = 8;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wrap a value with its expiry header. A zero header means no expiry.
pub(crate) fn encode_entry(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let deadline = match ttl {
        Some(d) if !d.is_zero() => now_millis().saturating_add(d.as_millis() as u64),
        _ => 0,
    };
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + value.len());
    out.extend_from_slice(&deadline.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Unwrap a stored entry. Returns `None` when the entry has expired.
pub(crate) fn decode_entry(raw: &[u8]) -> StorageResult<Option<Vec<u8>>> {
    if raw.len() < ENTRY_HEADER_LEN {
        return Err(StorageError::Corrupted(format!(
            "entry shorter than expiry header: {} bytes",
            raw.len()
        )));
    }
    let mut header = [0u8; ENTRY_HEADER_LEN];
    header.copy_from_slice(&raw[..ENTRY_HEADER_LEN]);
    let deadline = u64::from_be_bytes(header);
    if deadline != 0 && now_millis() >= deadline {
        return Ok(None);
    }
    Ok(Some(raw[ENTRY_HEADER_LEN..].to_vec()))
}
