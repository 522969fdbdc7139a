//! # Persistent FIFO Queues
//!
//! Named queues over one shared storage backend. Each queue keeps a
//! 16-byte metadata record of big-endian `head` and `tail` pointers;
//! items live at keys whose sequence number is zero-padded to 20 decimal
//! digits so lexicographic order equals numeric order.
//!
//! Every push and pop mutates exactly one item key and the metadata key
//! inside a single backend transaction, so `head <= tail` holds at every
//! commit and a reader never observes head moving past tail.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::storage::{StorageBackend, StorageError};

/// Queue error types
#[derive(Error, Debug)]
pub enum QueueError {
    /// Empty queue name
    #[error("invalid queue name: {0}")]
    InvalidQueue(String),

    /// Pop or peek on a queue with no items
    #[error("queue is empty")]
    Empty,

    /// Forwarded storage-layer failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

const META_PREFIX: &str = "queue:meta:";
const DATA_PREFIX: &str = "queue:data:";
const META_LEN: usize = 16;

/// Items removed per transaction during `clear` so one huge queue cannot
/// pin a transaction open indefinitely.
const CLEAR_CHUNK: u64 = 4096;

fn meta_key(name: &str) -> Vec<u8> {
    format!("{META_PREFIX}{name}").into_bytes()
}

fn data_key(name: &str, seq: u64) -> Vec<u8> {
    format!("{DATA_PREFIX}{name}:{seq:020}").into_bytes()
}

fn encode_meta(head: u64, tail: u64) -> [u8; META_LEN] {
    let mut out = [0u8; META_LEN];
    out[..8].copy_from_slice(&head.to_be_bytes());
    out[8..].copy_from_slice(&tail.to_be_bytes());
    out
}

/// Decode a metadata record. A missing record means the queue has never
/// been pushed to and reads as `(0, 0)`.
fn decode_meta(raw: Option<Vec<u8>>) -> Result<(u64, u64), StorageError> {
    match raw {
        None => Ok((0, 0)),
        Some(bytes) => {
            if bytes.len() != META_LEN {
                return Err(StorageError::Corrupted(format!(
                    "queue metadata is {} bytes, expected {}",
                    bytes.len(),
                    META_LEN
                )));
            }
            let mut head = [0u8; 8];
            let mut tail = [0u8; 8];
            head.copy_from_slice(&bytes[..8]);
            tail.copy_from_slice(&bytes[8..]);
            Ok((u64::from_be_bytes(head), u64::from_be_bytes(tail)))
        }
    }
}

fn validate_name(name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::InvalidQueue("empty queue name".to_string()));
    }
    Ok(())
}

/// Counter snapshot for the queue engine.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Completed pushes
    pub pushes: u64,
    /// Completed pops (items returned)
    pub pops: u64,
    /// Pops and peeks that found the queue empty
    pub empty_hits: u64,
    /// Clears
    pub clears: u64,
}

/// FIFO queue engine over one shared backend.
///
/// Queues coexist in the backend by key prefix; the engine takes no lock
/// of its own and relies on backend transaction atomicity to serialise
/// pointer updates.
pub struct QueueEngine {
    backend: Arc<dyn StorageBackend>,
    stats: RwLock<QueueStats>,
}

impl QueueEngine {
    /// Build a queue engine over the given backend.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            stats: RwLock::new(QueueStats::default()),
        }
    }

    /// Append a value to the queue, creating the queue on first push.
    pub fn push(&self, name: &str, value: &[u8]) -> QueueResult<()> {
        validate_name(name)?;
        self.backend.transact(&mut |view| {
            let (head, tail) = decode_meta(view.get(&meta_key(name))?)?;
            view.put(&data_key(name, tail), value)?;
            view.put(&meta_key(name), &encode_meta(head, tail + 1))
        })?;
        self.stats.write().pushes += 1;
        Ok(())
    }

    /// Remove and return the oldest value.
    pub fn pop(&self, name: &str) -> QueueResult<Vec<u8>> {
        validate_name(name)?;
        let mut popped: Option<Vec<u8>> = None;
        self.backend.transact(&mut |view| {
            // The body may re-run on transaction conflict; start clean.
            popped = None;
            let (head, tail) = decode_meta(view.get(&meta_key(name))?)?;
            if head >= tail {
                // Nothing staged, so committing here mutates nothing.
                return Ok(());
            }
            let item_key = data_key(name, head);
            let value = view.get(&item_key)?.ok_or_else(|| {
                StorageError::Corrupted(format!("queue {name} missing item at seq {head}"))
            })?;
            view.delete(&item_key)?;
            view.put(&meta_key(name), &encode_meta(head + 1, tail))?;
            popped = Some(value);
            Ok(())
        })?;
        match popped {
            Some(value) => {
                self.stats.write().pops += 1;
                Ok(value)
            }
            None => {
                self.stats.write().empty_hits += 1;
                Err(QueueError::Empty)
            }
        }
    }

    /// Return the oldest value without removing it.
    pub fn peek(&self, name: &str) -> QueueResult<Vec<u8>> {
        validate_name(name)?;
        let mut peeked: Option<Vec<u8>> = None;
        self.backend.transact(&mut |view| {
            peeked = None;
            let (head, tail) = decode_meta(view.get(&meta_key(name))?)?;
            if head >= tail {
                return Ok(());
            }
            let value = view.get(&data_key(name, head))?.ok_or_else(|| {
                StorageError::Corrupted(format!("queue {name} missing item at seq {head}"))
            })?;
            peeked = Some(value);
            Ok(())
        })?;
        match peeked {
            Some(value) => Ok(value),
            None => {
                self.stats.write().empty_hits += 1;
                Err(QueueError::Empty)
            }
        }
    }

    /// Number of items currently in the queue.
    pub fn len(&self, name: &str) -> QueueResult<u64> {
        validate_name(name)?;
        let (head, tail) = decode_meta(self.backend.get(&meta_key(name))?)?;
        Ok(tail.saturating_sub(head))
    }

    /// True when the queue holds no items.
    pub fn is_empty(&self, name: &str) -> QueueResult<bool> {
        Ok(self.len(name)? == 0)
    }

    /// Remove every item and reset the pointers to `(0, 0)`.
    ///
    /// Large queues are drained in bounded chunks, one transaction each;
    /// head only ever advances, so `head <= tail` holds at every
    /// intermediate commit and concurrent readers see a shrinking queue,
    /// never an inconsistent one.
    pub fn clear(&self, name: &str) -> QueueResult<()> {
        validate_name(name)?;
        loop {
            let mut done = false;
            self.backend.transact(&mut |view| {
                done = false;
                let (head, tail) = decode_meta(view.get(&meta_key(name))?)?;
                let end = tail.min(head.saturating_add(CLEAR_CHUNK));
                for seq in head..end {
                    view.delete(&data_key(name, seq))?;
                }
                if end == tail {
                    view.put(&meta_key(name), &encode_meta(0, 0))?;
                    done = true;
                } else {
                    view.put(&meta_key(name), &encode_meta(end, tail))?;
                }
                Ok(())
            })?;
            if done {
                break;
            }
        }
        self.stats.write().clears += 1;
        Ok(())
    }

    /// Close the underlying backend.
    pub fn close(&self) -> QueueResult<()> {
        self.backend.close()?;
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        self.stats.read().clone()
    }
}
