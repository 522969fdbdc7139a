//! Request dispatch
//!
//! Maps decoded requests onto the sharded store and the queue engine and
//! folds their results into wire responses. The same handler serves both
//! the fast path (inline on the reader task) and the worker pool.

use std::sync::Arc;

use crate::protocol::{Request, Response};
use crate::queue::{QueueEngine, QueueError};
use crate::store::{ShardedKv, StoreResult};

/// Shared execution context for all connections and workers.
pub struct Handler {
    kv: Arc<ShardedKv>,
    queues: Arc<QueueEngine>,
}

impl Handler {
    /// Build a handler over the server's engines.
    pub fn new(kv: Arc<ShardedKv>, queues: Arc<QueueEngine>) -> Self {
        Self { kv, queues }
    }

    /// The sharded store this handler serves.
    pub fn kv(&self) -> &Arc<ShardedKv> {
        &self.kv
    }

    /// The queue engine this handler serves.
    pub fn queues(&self) -> &Arc<QueueEngine> {
        &self.queues
    }

    /// Execute one request to completion.
    ///
    /// Missing keys and empty queues map to `NotFound`; every other error
    /// becomes an `Error` response with a diagnostic message. Nothing in
    /// here panics on bad input.
    pub fn execute(&self, request: &Request) -> Response {
        match request {
            Request::Set { key, value } => empty_ok(self.kv.set(key, value)),
            Request::Get { key } => match self.kv.get(key) {
                Ok(Some(value)) => Response::Ok(value),
                Ok(None) => Response::NotFound,
                Err(err) => Response::Error(err.to_string()),
            },
            Request::Delete { key } => empty_ok(self.kv.delete(key)),
            Request::Exists { key } => match self.kv.exists(key) {
                Ok(present) => Response::Ok(vec![u8::from(present)]),
                Err(err) => Response::Error(err.to_string()),
            },
            Request::Incr { key } => counter_ok(self.kv.incr(key)),
            Request::Decr { key } => counter_ok(self.kv.decr(key)),
            Request::SetMany { pairs } => empty_ok(self.kv.set_many(pairs)),
            Request::GetMany { keys } => match self.kv.get_many(keys) {
                Ok(values) => Response::Multi(values),
                Err(err) => Response::Error(err.to_string()),
            },
            Request::DeleteMany { keys } => empty_ok(self.kv.delete_many(keys)),
            Request::QueuePush { name, value } => match self.queues.push(name, value) {
                Ok(()) => Response::Ok(Vec::new()),
                Err(err) => Response::Error(err.to_string()),
            },
            Request::QueuePop { name } => queue_value(self.queues.pop(name)),
            Request::QueuePeek { name } => queue_value(self.queues.peek(name)),
            Request::QueueLen { name } => match self.queues.len(name) {
                Ok(len) => Response::Ok(len.to_be_bytes().to_vec()),
                Err(err) => Response::Error(err.to_string()),
            },
            Request::QueueClear { name } => match self.queues.clear(name) {
                Ok(()) => Response::Ok(Vec::new()),
                Err(err) => Response::Error(err.to_string()),
            },
        }
    }
}

fn empty_ok(result: StoreResult<()>) -> Response {
    match result {
        Ok(()) => Response::Ok(Vec::new()),
        Err(err) => Response::Error(err.to_string()),
    }
}

fn counter_ok(result: StoreResult<i64>) -> Response {
    match result {
        Ok(value) => Response::Ok(value.to_be_bytes().to_vec()),
        Err(err) => Response::Error(err.to_string()),
    }
}

fn queue_value(result: Result<Vec<u8>, QueueError>) -> Response {
    match result {
        Ok(value) => Response::Ok(value),
        Err(QueueError::Empty) => Response::NotFound,
        Err(err) => Response::Error(err.to_string()),
    }
}
