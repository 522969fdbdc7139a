//! Sled-backed storage
//!
//! Persistent implementation of [`StorageBackend`] over a single
//! `sled::Db`. Multi-key atomicity comes from sled's tree transactions;
//! batches map onto `sled::Batch`.

use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, UnabortableTransactionError,
};

use super::{
    decode_entry, encode_entry, BatchOp, StorageBackend, StorageError, StorageResult,
    TransactionView, TxBody, WriteBatch,
};

/// Persistent storage backend over an embedded sled database.
pub struct SledBackend {
    db: sled::Db,
    closed: AtomicBool,
}

impl SledBackend {
    /// Open (or create) a database rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            db,
            closed: AtomicBool::new(false),
        })
    }

    /// Open a throwaway database backed by a temporary directory.
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            db,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// Transaction view over a sled transactional tree.
///
/// sled reports optimistic-concurrency conflicts through its own error
/// channel; the view records them so the outer closure can ask sled to
/// retry instead of aborting.
struct SledTxView<'a> {
    tree: &'a TransactionalTree,
    conflict: bool,
}

impl SledTxView<'_> {
    fn map_err(&mut self, err: UnabortableTransactionError) -> StorageError {
        match err {
            UnabortableTransactionError::Conflict => {
                self.conflict = true;
                StorageError::Backend("transaction conflict".to_string())
            }
            UnabortableTransactionError::Storage(e) => StorageError::Backend(e.to_string()),
        }
    }
}

impl TransactionView for SledTxView<'_> {
    fn get(&mut self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        match self.tree.get(key) {
            Ok(Some(raw)) => decode_entry(&raw),
            Ok(None) => Ok(None),
            Err(e) => Err(self.map_err(e)),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        match self.tree.insert(key, encode_entry(value, None)) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.map_err(e)),
        }
    }

    fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        match self.tree.remove(key) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.map_err(e)),
        }
    }
}

impl StorageBackend for SledBackend {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        match self
            .db
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?
        {
            Some(raw) => decode_entry(&raw),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> StorageResult<()> {
        self.ensure_open()?;
        self.db
            .insert(key, encode_entry(value, ttl))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        self.db
            .remove(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8], limit: usize) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, raw) = item.map_err(|e| StorageError::Backend(e.to_string()))?;
            if let Some(value) = decode_entry(&raw)? {
                out.push((key.to_vec(), value));
                if limit != 0 && out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        self.ensure_open()?;
        let mut inner = sled::Batch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value, ttl } => {
                    inner.insert(key, encode_entry(&value, ttl));
                }
                BatchOp::Delete { key } => {
                    inner.remove(key);
                }
            }
        }
        self.db
            .apply_batch(inner)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn transact(&self, body: &mut TxBody<'_>) -> StorageResult<()> {
        self.ensure_open()?;
        // sled may call the closure more than once on conflict; the body is
        // FnMut, so route it through a RefCell.
        let body = RefCell::new(body);
        let result = self.db.transaction(|tree| {
            let mut view = SledTxView {
                tree,
                conflict: false,
            };
            let mut guard = body.borrow_mut();
            match (&mut **guard)(&mut view) {
                Ok(()) => Ok(()),
                Err(_) if view.conflict => Err(ConflictableTransactionError::Conflict),
                Err(err) => Err(ConflictableTransactionError::Abort(err)),
            }
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(e)) => Err(StorageError::Backend(e.to_string())),
        }
    }

    fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SledBackend {
        SledBackend::temporary().unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let db = backend();
        db.put(b"k", b"v", None).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.delete(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let db = backend();
        db.put(b"k", b"v", Some(Duration::from_millis(30))).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_prefix_iteration_is_ordered() {
        let db = backend();
        db.put(b"p:b", b"2", None).unwrap();
        db.put(b"p:a", b"1", None).unwrap();
        db.put(b"q:c", b"3", None).unwrap();
        let items = db.iter_prefix(b"p:", 0).unwrap();
        assert_eq!(
            items,
            vec![
                (b"p:a".to_vec(), b"1".to_vec()),
                (b"p:b".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_prefix_limit() {
        let db = backend();
        for i in 0..10u8 {
            db.put(format!("p:{i}").as_bytes(), &[i], None).unwrap();
        }
        assert_eq!(db.iter_prefix(b"p:", 3).unwrap().len(), 3);
    }

    #[test]
    fn test_write_batch_applies_all_ops() {
        let db = backend();
        db.put(b"gone", b"x", None).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"gone".to_vec());
        db.write_batch(batch).unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let db = backend();
        db.transact(&mut |view: &mut dyn TransactionView| {
            view.put(b"a", b"1")?;
            view.put(b"b", b"2")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_transaction_aborts_on_err() {
        let db = backend();
        let result = db.transact(&mut |view: &mut dyn TransactionView| {
            view.put(b"a", b"1")?;
            Err(StorageError::Backend("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let db = backend();
        db.put(b"k", b"v", None).unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.get(b"k"), Err(StorageError::Closed)));
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = SledBackend::open(dir.path()).unwrap();
            db.put(b"persist", b"yes", None).unwrap();
            db.close().unwrap();
        }
        let db = SledBackend::open(dir.path()).unwrap();
        assert_eq!(db.get(b"persist").unwrap(), Some(b"yes".to_vec()));
    }
}
