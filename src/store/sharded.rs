//! Sharded key-value engine
//!
//! Each shard owns one storage backend instance and one reader-writer
//! lock. Single-key operations route by hash, lock one shard, and call
//! straight into the backend. Batch operations group keys by shard and
//! fan out in parallel, one atomic batch per shard; atomicity across
//! shards is explicitly not provided.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::storage::{StorageBackend, WriteBatch};

use super::{fnv1a_32, validate_key, StoreError, StoreResult};

/// One shard: a backend instance plus its guarding lock.
///
/// The lock carries no data; it enforces the reader/writer discipline
/// around backend calls for this slice of the key space.
struct Shard {
    index: usize,
    backend: Box<dyn StorageBackend>,
    guard: RwLock<()>,
}

/// Counter snapshot for the sharded store.
#[derive(Debug, Clone, Default)]
pub struct ShardedKvStats {
    /// Number of shards
    pub shard_count: usize,
    /// Single-key writes (set, delete)
    pub writes: u64,
    /// Single-key reads (get, exists)
    pub reads: u64,
    /// Counter mutations (incr, decr)
    pub counter_ops: u64,
    /// Batch operations (set/get/delete many)
    pub batches: u64,
    /// Prefix scans
    pub scans: u64,
}

/// Key-value store partitioned across independent backends.
///
/// Shard routing is `fnv1a_32(key) % shard_count` and is stable for the
/// lifetime of the store. The shard count must match across restarts of a
/// persistent deployment; changing it without migration invalidates
/// routing.
pub struct ShardedKv {
    shards: Vec<Shard>,
    closed: AtomicBool,
    stats: RwLock<ShardedKvStats>,
}

impl ShardedKv {
    /// Build a store over the given backend instances, one per shard.
    ///
    /// The shard count is the number of backends and must be in
    /// `[1, 256]`.
    pub fn new(backends: Vec<Box<dyn StorageBackend>>) -> StoreResult<Self> {
        let count = backends.len();
        if count == 0 || count > 256 {
            return Err(StoreError::InvalidConfig(format!(
                "shard count {} out of range [1, 256]",
                count
            )));
        }
        let shards = backends
            .into_iter()
            .enumerate()
            .map(|(index, backend)| Shard {
                index,
                backend,
                guard: RwLock::new(()),
            })
            .collect();
        Ok(Self {
            shards,
            closed: AtomicBool::new(false),
            stats: RwLock::new(ShardedKvStats::default()),
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index a key routes to. Deterministic for a fixed shard count.
    pub fn shard_for(&self, key: &[u8]) -> usize {
        (fnv1a_32(key) as usize) % self.shards.len()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_for(key)]
    }

    /// Insert or overwrite a key.
    pub fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.set_with_ttl(key, value, None)
    }

    /// Insert or overwrite a key with an optional time-to-live.
    ///
    /// A `None` or zero TTL means the key never expires.
    pub fn set_with_ttl(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        validate_key(key)?;
        self.ensure_open()?;
        let shard = self.shard(key);
        let _guard = shard.guard.write();
        shard.backend.put(key, value, ttl)?;
        self.stats.write().writes += 1;
        Ok(())
    }

    /// Read a key. Returns `None` for missing or expired keys.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        self.ensure_open()?;
        let shard = self.shard(key);
        let _guard = shard.guard.read();
        let value = shard.backend.get(key)?;
        self.stats.write().reads += 1;
        Ok(value)
    }

    /// Remove a key. Removing a missing key succeeds.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        self.ensure_open()?;
        let shard = self.shard(key);
        let _guard = shard.guard.write();
        shard.backend.delete(key)?;
        self.stats.write().writes += 1;
        Ok(())
    }

    /// True when the key exists and has not expired.
    pub fn exists(&self, key: &[u8]) -> StoreResult<bool> {
        validate_key(key)?;
        self.ensure_open()?;
        let shard = self.shard(key);
        let _guard = shard.guard.read();
        let present = shard.backend.get(key)?.is_some();
        self.stats.write().reads += 1;
        Ok(present)
    }

    /// Increment a counter key by one, returning the new value.
    pub fn incr(&self, key: &[u8]) -> StoreResult<i64> {
        self.add(key, 1)
    }

    /// Decrement a counter key by one, returning the new value.
    pub fn decr(&self, key: &[u8]) -> StoreResult<i64> {
        self.add(key, -1)
    }

    /// Counter read-modify-write inside one backend transaction.
    ///
    /// A missing key counts from zero. A stored value that is not exactly
    /// 8 bytes is treated as zero; the write always emits 8 big-endian
    /// bytes.
    fn add(&self, key: &[u8], delta: i64) -> StoreResult<i64> {
        validate_key(key)?;
        self.ensure_open()?;
        let shard = self.shard(key);
        let _guard = shard.guard.write();
        let mut result = 0i64;
        shard.backend.transact(&mut |view| {
            let current = match view.get(key)? {
                Some(raw) if raw.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&raw);
                    i64::from_be_bytes(buf)
                }
                _ => 0,
            };
            result = current.wrapping_add(delta);
            view.put(key, &result.to_be_bytes())
        })?;
        self.stats.write().counter_ops += 1;
        Ok(result)
    }

    /// Write many pairs, one atomic batch per shard.
    ///
    /// Batches are atomic within a shard only; a failure may leave some
    /// shards written and others not.
    pub fn set_many(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> StoreResult<()> {
        for (key, _) in pairs {
            validate_key(key)?;
        }
        self.ensure_open()?;
        let mut groups: Vec<Vec<&(Vec<u8>, Vec<u8>)>> = vec![Vec::new(); self.shards.len()];
        for pair in pairs {
            groups[self.shard_for(&pair.0)].push(pair);
        }
        self.shards
            .par_iter()
            .zip(groups.par_iter())
            .try_for_each(|(shard, group)| {
                if group.is_empty() {
                    return Ok(());
                }
                let mut batch = WriteBatch::new();
                for (key, value) in group.iter().map(|p| (&p.0, &p.1)) {
                    batch.put(key.clone(), value.clone());
                }
                let _guard = shard.guard.write();
                shard.backend.write_batch(batch).map_err(StoreError::from)
            })?;
        self.stats.write().batches += 1;
        Ok(())
    }

    /// Read many keys, preserving input order in the result.
    pub fn get_many(&self, keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        for key in keys {
            validate_key(key)?;
        }
        self.ensure_open()?;
        let mut groups: Vec<Vec<(usize, &[u8])>> = vec![Vec::new(); self.shards.len()];
        for (position, key) in keys.iter().enumerate() {
            groups[self.shard_for(key)].push((position, key.as_slice()));
        }
        let chunks: Vec<Vec<(usize, Option<Vec<u8>>)>> = self
            .shards
            .par_iter()
            .zip(groups.par_iter())
            .map(|(shard, group)| {
                if group.is_empty() {
                    return Ok(Vec::new());
                }
                let _guard = shard.guard.read();
                let mut found = Vec::with_capacity(group.len());
                for &(position, key) in group {
                    found.push((position, shard.backend.get(key)?));
                }
                Ok(found)
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let mut results = vec![None; keys.len()];
        for (position, value) in chunks.into_iter().flatten() {
            results[position] = value;
        }
        self.stats.write().batches += 1;
        Ok(results)
    }

    /// Delete many keys, one atomic batch per shard.
    pub fn delete_many(&self, keys: &[Vec<u8>]) -> StoreResult<()> {
        for key in keys {
            validate_key(key)?;
        }
        self.ensure_open()?;
        let mut groups: Vec<Vec<&[u8]>> = vec![Vec::new(); self.shards.len()];
        for key in keys {
            groups[self.shard_for(key)].push(key);
        }
        self.shards
            .par_iter()
            .zip(groups.par_iter())
            .try_for_each(|(shard, group)| {
                if group.is_empty() {
                    return Ok(());
                }
                let mut batch = WriteBatch::new();
                for key in group {
                    batch.delete(key.to_vec());
                }
                let _guard = shard.guard.write();
                shard.backend.write_batch(batch).map_err(StoreError::from)
            })?;
        self.stats.write().batches += 1;
        Ok(())
    }

    /// Prefix scan fanned out across all shards under read locks.
    ///
    /// A `limit <= 0` means unlimited; a positive limit applies per shard,
    /// so up to `limit * shard_count` items may be returned. Results are
    /// concatenated in shard order; no global key ordering is guaranteed.
    pub fn scan(&self, prefix: &[u8], limit: i64) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let per_shard = if limit <= 0 { 0 } else { limit as usize };
        let chunks: Vec<Vec<(Vec<u8>, Vec<u8>)>> = self
            .shards
            .par_iter()
            .map(|shard| {
                let _guard = shard.guard.read();
                shard
                    .backend
                    .iter_prefix(prefix, per_shard)
                    .map_err(StoreError::from)
            })
            .collect::<StoreResult<Vec<_>>>()?;
        self.stats.write().scans += 1;
        Ok(chunks.into_iter().flatten().collect())
    }

    /// Close every shard in order.
    ///
    /// Continues past failures and reports the last error. Idempotent: a
    /// second call returns `Ok` without touching the backends again.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut last_err = None;
        for shard in &self.shards {
            let _guard = shard.guard.write();
            if let Err(err) = shard.backend.close() {
                log::error!("failed to close shard {}: {}", shard.index, err);
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ShardedKvStats {
        let mut stats = self.stats.read().clone();
        stats.shard_count = self.shards.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn store(shards: usize) -> ShardedKv {
        let backends = (0..shards)
            .map(|_| Box::new(MemoryBackend::new()) as Box<dyn StorageBackend>)
            .collect();
        ShardedKv::new(backends).unwrap()
    }

    #[test]
    fn test_shard_routing_is_deterministic() {
        let kv = store(16);
        for key in [&b"alpha"[..], b"beta", b"counter", b"queue:data:tasks:0"] {
            let first = kv.shard_for(key);
            for _ in 0..10 {
                assert_eq!(kv.shard_for(key), first);
            }
        }
    }

    #[test]
    fn test_set_get_delete_roundtrip() {
        let kv = store(4);
        kv.set(b"alpha", "value-\u{3b1}".as_bytes()).unwrap();
        assert_eq!(
            kv.get(b"alpha").unwrap(),
            Some("value-\u{3b1}".as_bytes().to_vec())
        );
        kv.delete(b"alpha").unwrap();
        assert_eq!(kv.get(b"alpha").unwrap(), None);
    }

    #[test]
    fn test_exists() {
        let kv = store(4);
        assert!(!kv.exists(b"k").unwrap());
        kv.set(b"k", b"v").unwrap();
        assert!(kv.exists(b"k").unwrap());
    }

    #[test]
    fn test_counter_sequence() {
        let kv = store(4);
        for expected in 1..=5i64 {
            assert_eq!(kv.incr(b"counter").unwrap(), expected);
        }
        assert_eq!(
            kv.get(b"counter").unwrap(),
            Some(vec![0, 0, 0, 0, 0, 0, 0, 5])
        );
        assert_eq!(kv.decr(b"counter").unwrap(), 4);
    }

    #[test]
    fn test_counter_tolerates_non_numeric_value() {
        let kv = store(2);
        kv.set(b"k", b"not a number").unwrap();
        assert_eq!(kv.incr(b"k").unwrap(), 1);
    }

    #[test]
    fn test_concurrent_increments() {
        use std::sync::Arc;
        let kv = Arc::new(store(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let kv = Arc::clone(&kv);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    kv.incr(b"shared").unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            kv.get(b"shared").unwrap(),
            Some(800i64.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn test_batch_roundtrip_across_shard_counts() {
        for shards in [1, 4, 16] {
            let kv = store(shards);
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
                .map(|i| {
                    (
                        format!("key-{i}").into_bytes(),
                        format!("val-{i}").into_bytes(),
                    )
                })
                .collect();
            kv.set_many(&pairs).unwrap();
            let keys: Vec<Vec<u8>> = pairs.iter().map(|p| p.0.clone()).collect();
            let values = kv.get_many(&keys).unwrap();
            for (i, value) in values.iter().enumerate() {
                assert_eq!(value.as_deref(), Some(format!("val-{i}").as_bytes()));
            }
        }
    }

    #[test]
    fn test_random_keys_route_stably_and_roundtrip() {
        use rand::Rng;
        let kv = store(16);
        let mut rng = rand::thread_rng();
        let keys: Vec<Vec<u8>> = (0..500)
            .map(|_| {
                (0..12)
                    .map(|_| rng.sample(rand::distributions::Alphanumeric))
                    .collect()
            })
            .collect();
        let routes: Vec<usize> = keys.iter().map(|k| kv.shard_for(k)).collect();
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = keys
            .iter()
            .map(|k| (k.clone(), fnv1a_32(k).to_be_bytes().to_vec()))
            .collect();
        kv.set_many(&pairs).unwrap();
        // Routing is stable across repeated hashing and the values come
        // back under the same keys.
        for (key, route) in keys.iter().zip(&routes) {
            assert_eq!(kv.shard_for(key), *route);
        }
        let values = kv.get_many(&keys).unwrap();
        for (i, value) in values.iter().enumerate() {
            assert_eq!(value.as_deref(), Some(pairs[i].1.as_slice()));
        }
    }

    #[test]
    fn test_get_many_preserves_input_order_with_gaps() {
        let kv = store(8);
        kv.set(b"present-1", b"a").unwrap();
        kv.set(b"present-2", b"b").unwrap();
        let keys = vec![
            b"missing-1".to_vec(),
            b"present-2".to_vec(),
            b"present-1".to_vec(),
            b"missing-2".to_vec(),
        ];
        let values = kv.get_many(&keys).unwrap();
        assert_eq!(values[0], None);
        assert_eq!(values[1], Some(b"b".to_vec()));
        assert_eq!(values[2], Some(b"a".to_vec()));
        assert_eq!(values[3], None);
    }

    #[test]
    fn test_delete_many() {
        let kv = store(4);
        let keys: Vec<Vec<u8>> = (0..20).map(|i| format!("k{i}").into_bytes()).collect();
        for key in &keys {
            kv.set(key, b"v").unwrap();
        }
        kv.delete_many(&keys).unwrap();
        for key in &keys {
            assert!(!kv.exists(key).unwrap());
        }
    }

    #[test]
    fn test_scan_finds_all_prefixed_keys() {
        let kv = store(8);
        for i in 0..50 {
            kv.set(format!("scan:{i}").as_bytes(), b"v").unwrap();
        }
        kv.set(b"other:1", b"v").unwrap();
        let items = kv.scan(b"scan:", 0).unwrap();
        assert_eq!(items.len(), 50);
        let limited = kv.scan(b"scan:", 3).unwrap();
        assert!(limited.len() >= 3);
    }

    #[test]
    fn test_invalid_key_rejected_before_storage() {
        let kv = store(2);
        assert!(matches!(kv.set(b"", b"v"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(kv.get(b""), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_ops() {
        let kv = store(2);
        kv.set(b"k", b"v").unwrap();
        kv.close().unwrap();
        kv.close().unwrap();
        assert!(matches!(kv.get(b"k"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_ttl_expiry_via_store() {
        let kv = store(2);
        kv.set_with_ttl(b"k", b"v", Some(Duration::from_millis(30)))
            .unwrap();
        assert!(kv.exists(b"k").unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!kv.exists(b"k").unwrap());
        assert_eq!(kv.get(b"k").unwrap(), None);
    }
}
