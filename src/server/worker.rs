//! Worker pool
//!
//! `W` long-lived tasks draining one bounded queue of decoded requests.
//! Submission blocks when the queue is full, which stalls the submitting
//! connection's reader and pushes back on the client; no request is ever
//! dropped. Deadlines are advisory: they are checked once before
//! execution begins, never mid-operation.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::{codec, Request, Response};

use super::dispatch::Handler;

/// A sequenced response frame on its way back to a connection's writer.
#[derive(Debug)]
pub struct Completion {
    /// Per-connection request sequence number
    pub seq: u64,
    /// Fully encoded response frame
    pub frame: Vec<u8>,
}

/// One unit of slow-path work.
#[derive(Debug)]
pub struct WorkItem {
    /// Decoded request
    pub request: Request,
    /// Per-connection sequence number for response reassembly
    pub seq: u64,
    /// Sink back to the originating connection's writer task
    pub completions: mpsc::Sender<Completion>,
    /// Advisory deadline checked before execution starts
    pub deadline: Option<Instant>,
}

/// Counter snapshot for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Items accepted into the queue
    pub submitted: u64,
    /// Items executed to completion
    pub completed: u64,
    /// Items whose deadline passed before execution
    pub expired: u64,
    /// Handler panics translated into error responses
    pub panics: u64,
}

#[derive(Default)]
struct WorkerCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    panics: AtomicU64,
}

/// Bounded multi-producer pool of request workers.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
    counters: Arc<WorkerCounters>,
}

impl WorkerPool {
    /// Spawn `workers` tasks over a queue of `workers * queue_factor`
    /// slots.
    pub fn new(workers: usize, queue_factor: usize, handler: Arc<Handler>) -> Self {
        let capacity = workers.max(1) * queue_factor.max(1);
        let (tx, rx) = mpsc::channel::<WorkItem>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(WorkerCounters::default());
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&counters);
            handles.push(tokio::spawn(worker_loop(id, rx, handler, counters)));
        }
        log::info!(
            "worker pool started: {} workers, queue capacity {}",
            workers.max(1),
            capacity
        );
        Self {
            tx: Some(tx),
            handles,
            counters,
        }
    }

    /// Handle connections use to submit work. Cheap to clone.
    pub fn submitter(&self) -> Option<mpsc::Sender<WorkItem>> {
        self.tx.clone()
    }

    /// Enqueue one item, waiting while the queue is full.
    ///
    /// Returns the item back when the pool has shut down so the caller
    /// can fail the request instead of losing it silently.
    pub async fn submit(&self, item: WorkItem) -> Result<(), WorkItem> {
        let Some(tx) = &self.tx else {
            return Err(item);
        };
        match tx.send(item).await {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => Err(err.0),
        }
    }

    /// Number of items waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Stop accepting new work. Queued items still run.
    pub fn close(&mut self) {
        self.tx.take();
    }

    /// Wait for every worker to drain and exit. Call after `close` and
    /// after connection submitters have dropped.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                log::error!("worker task failed to join: {err}");
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            panics: self.counters.panics.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    handler: Arc<Handler>,
    counters: Arc<WorkerCounters>,
) {
    loop {
        // Exactly one worker waits on the receiver at a time; the lock is
        // released as soon as an item (or channel close) is observed.
        let item = { rx.lock().await.recv().await };
        let Some(item) = item else {
            log::debug!("worker {id} exiting: queue closed and drained");
            break;
        };

        if let Some(deadline) = item.deadline {
            if Instant::now() > deadline {
                counters.expired.fetch_add(1, Ordering::Relaxed);
                let frame = codec::encode_response(&Response::Error(
                    "request timed out before execution".to_string(),
                ));
                let _ = item
                    .completions
                    .send(Completion { seq: item.seq, frame })
                    .await;
                continue;
            }
        }

        // A storage-layer panic must not take the worker down with it.
        let response =
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&item.request))) {
                Ok(response) => response,
                Err(_) => {
                    counters.panics.fetch_add(1, Ordering::Relaxed);
                    log::error!("worker {id}: handler panicked, reporting backend error");
                    Response::Error("internal error: backend failure".to_string())
                }
            };

        let frame = codec::encode_response(&response);
        // The connection may already be gone; discarding is correct.
        let _ = item
            .completions
            .send(Completion { seq: item.seq, frame })
            .await;
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueEngine;
    use crate::storage::{MemoryBackend, StorageBackend};
    use crate::store::ShardedKv;
    use std::time::Duration;

    fn handler() -> Arc<Handler> {
        let backends: Vec<Box<dyn StorageBackend>> = (0..2)
            .map(|_| Box::new(MemoryBackend::new()) as Box<dyn StorageBackend>)
            .collect();
        Arc::new(Handler::new(
            Arc::new(ShardedKv::new(backends).unwrap()),
            Arc::new(QueueEngine::new(Arc::new(MemoryBackend::new()))),
        ))
    }

    #[tokio::test]
    async fn test_pool_executes_and_completes() {
        let mut pool = WorkerPool::new(4, 8, handler());
        let (tx, mut rx) = mpsc::channel(16);
        for seq in 0..8u64 {
            pool.submit(WorkItem {
                request: Request::Set {
                    key: format!("k{seq}").into_bytes(),
                    value: b"v".to_vec(),
                },
                seq,
                completions: tx.clone(),
                deadline: None,
            })
            .await
            .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(rx.recv().await.unwrap().seq);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert_eq!(pool.stats().completed, 8);
        pool.close();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_execution() {
        let h = handler();
        let mut pool = WorkerPool::new(1, 4, Arc::clone(&h));
        let (tx, mut rx) = mpsc::channel(4);
        pool.submit(WorkItem {
            request: Request::Set {
                key: b"never".to_vec(),
                value: b"v".to_vec(),
            },
            seq: 0,
            completions: tx,
            deadline: Some(Instant::now() - Duration::from_secs(1)),
        })
        .await
        .unwrap();
        let completion = rx.recv().await.unwrap();
        // Status byte of the response frame is ERROR.
        assert_eq!(completion.frame[0], 0x01);
        assert!(!h.kv().exists(b"never").unwrap());
        assert_eq!(pool.stats().expired, 1);
        pool.close();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_submit_after_close_returns_item() {
        let mut pool = WorkerPool::new(1, 4, handler());
        pool.close();
        pool.join().await;
        let (tx, _rx) = mpsc::channel(1);
        let result = pool
            .submit(WorkItem {
                request: Request::Get { key: b"k".to_vec() },
                seq: 0,
                completions: tx,
                deadline: None,
            })
            .await;
        assert!(result.is_err());
    }
}
