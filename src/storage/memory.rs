//! In-memory storage
//!
//! Diskless implementation of [`StorageBackend`] over a `BTreeMap` guarded
//! by a reader-writer lock. Used when the server runs without a data
//! directory. Entries carry the same expiry envelope as the sled backend,
//! so TTL behaviour is identical.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use super::{
    decode_entry, encode_entry, BatchOp, StorageBackend, StorageError, StorageResult,
    TransactionView, TxBody, WriteBatch,
};

/// Diskless storage backend over an ordered map.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// Staged view over the map: reads see staged writes first, then the
/// committed state. Staged mutations are applied only when the
/// transaction body succeeds.
struct MemoryTxView<'a> {
    committed: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl TransactionView for MemoryTxView<'_> {
    fn get(&mut self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(key) {
            return match staged {
                Some(raw) => decode_entry(raw),
                None => Ok(None),
            };
        }
        match self.committed.get(key) {
            Some(raw) => decode_entry(raw),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.staged
            .insert(key.to_vec(), Some(encode_entry(value, None)));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.staged.insert(key.to_vec(), None);
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let map = self.inner.read();
        match map.get(key) {
            Some(raw) => decode_entry(raw),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> StorageResult<()> {
        self.ensure_open()?;
        self.inner.write().insert(key.to_vec(), encode_entry(value, ttl));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        self.inner.write().remove(key);
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8], limit: usize) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let map = self.inner.read();
        let mut out = Vec::new();
        for (key, raw) in map.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(value) = decode_entry(raw)? {
                out.push((key.clone(), value));
                if limit != 0 && out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        self.ensure_open()?;
        let mut map = self.inner.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value, ttl } => {
                    map.insert(key, encode_entry(&value, ttl));
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn transact(&self, body: &mut TxBody<'_>) -> StorageResult<()> {
        self.ensure_open()?;
        let mut map = self.inner.write();
        let mut view = MemoryTxView {
            committed: &map,
            staged: BTreeMap::new(),
        };
        body(&mut view)?;
        let staged = view.staged;
        for (key, op) in staged {
            match op {
                Some(raw) => {
                    map.insert(key, raw);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let db = MemoryBackend::new();
        db.put(b"k", b"v", None).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.delete(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let db = MemoryBackend::new();
        db.put(b"k", b"v", Some(Duration::from_millis(30))).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_prefix_respects_boundaries() {
        let db = MemoryBackend::new();
        db.put(b"a:1", b"x", None).unwrap();
        db.put(b"b:1", b"y", None).unwrap();
        db.put(b"b:2", b"z", None).unwrap();
        db.put(b"c:1", b"w", None).unwrap();
        let items = db.iter_prefix(b"b:", 0).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, b"b:1".to_vec());
        assert_eq!(items[1].0, b"b:2".to_vec());
    }

    #[test]
    fn test_transaction_staging_visible_to_itself() {
        let db = MemoryBackend::new();
        db.transact(&mut |view: &mut dyn TransactionView| {
            view.put(b"k", b"v1")?;
            assert_eq!(view.get(b"k")?, Some(b"v1".to_vec()));
            view.delete(b"k")?;
            assert_eq!(view.get(b"k")?, None);
            view.put(b"k", b"v2")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_transaction_aborts_on_err() {
        let db = MemoryBackend::new();
        db.put(b"k", b"old", None).unwrap();
        let result = db.transact(&mut |view: &mut dyn TransactionView| {
            view.put(b"k", b"new")?;
            Err(StorageError::Backend("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.get(b"k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_operations_after_close_fail() {
        let db = MemoryBackend::new();
        db.close().unwrap();
        assert!(matches!(db.get(b"k"), Err(StorageError::Closed)));
        assert!(matches!(db.put(b"k", b"v", None), Err(StorageError::Closed)));
    }
}
