//! # Data-Plane Server
//!
//! Owns the engines, the listener, and the worker pool, and wires a
//! connection task per accepted socket. Shutdown is graceful: the
//! listener stops accepting, live connections are signalled, workers
//! drain their queue, and the shards close last.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::queue::{QueueEngine, QueueError};
use crate::storage::{MemoryBackend, SledBackend, StorageBackend, StorageError};
use crate::store::{ShardedKv, StoreError};

pub mod connection;
pub mod dispatch;
pub mod worker;

pub use dispatch::Handler;
pub use worker::{WorkerPool, WorkerStats};

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listener or socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid startup configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage initialisation or shutdown failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Store-layer failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue-layer failure
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result type for server operations
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Handle for requesting a graceful shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal the server to stop accepting and drain.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The Flin data-plane server.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    kv: Arc<ShardedKv>,
    queues: Arc<QueueEngine>,
    handler: Arc<Handler>,
    pool: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Open storage, bind the listener, and spawn the worker pool.
    ///
    /// With a data directory, shard `i` lives at `<dir>/shard_<i>` and the
    /// queue backend at `<dir>/queue`; without one, everything is held in
    /// memory. The shard count must match across restarts of a persistent
    /// deployment.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let mut backends: Vec<Box<dyn StorageBackend>> = Vec::with_capacity(config.shards);
        for index in 0..config.shards {
            let backend: Box<dyn StorageBackend> = match &config.data_dir {
                Some(dir) => Box::new(SledBackend::open(dir.join(format!("shard_{index}")))?),
                None => Box::new(MemoryBackend::new()),
            };
            backends.push(backend);
        }
        let kv = Arc::new(ShardedKv::new(backends)?);

        let queue_backend: Arc<dyn StorageBackend> = match &config.data_dir {
            Some(dir) => Arc::new(SledBackend::open(dir.join("queue"))?),
            None => Arc::new(MemoryBackend::new()),
        };
        let queues = Arc::new(QueueEngine::new(queue_backend));

        let handler = Arc::new(Handler::new(Arc::clone(&kv), Arc::clone(&queues)));
        let pool = WorkerPool::new(config.workers, config.worker_queue_factor, Arc::clone(&handler));

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        // The receiver is held from bind time so a shutdown requested
        // before serve() starts is not lost. A watch channel carries the
        // flag: late subscribers can read the current value instead of
        // depending on having seen the edge.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        log::info!(
            "node {} listening on {} ({} shards, {} workers, {})",
            config.node_id,
            local_addr,
            config.shards,
            config.workers,
            match &config.data_dir {
                Some(dir) => format!("data dir {}", dir.display()),
                None => "in-memory".to_string(),
            }
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            kv,
            queues,
            handler,
            pool,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address the listener is bound to. With port 0 this is the actual
    /// ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The sharded store behind this server.
    pub fn kv(&self) -> &Arc<ShardedKv> {
        &self.kv
    }

    /// The queue engine behind this server.
    pub fn queues(&self) -> &Arc<QueueEngine> {
        &self.queues
    }

    /// Handle other tasks can use to stop this server.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until a shutdown signal arrives, then tear
    /// everything down in order.
    pub async fn serve(mut self) -> ServerResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    log::info!("node {}: shutdown requested", self.config.node_id);
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("accepted connection from {peer}");
                            let handler = Arc::clone(&self.handler);
                            let Some(submit) = self.pool.submitter() else {
                                break;
                            };
                            let conn_shutdown = self.shutdown_tx.subscribe();
                            tokio::spawn(connection::serve_connection(
                                stream, peer, handler, submit, conn_shutdown,
                            ));
                        }
                        Err(err) => {
                            log::error!("accept failed: {err}");
                        }
                    }
                }
            }
        }

        // Stop accepting before draining: the listener drops here.
        drop(self.listener);

        let pending = self.pool.pending();
        if pending > 0 {
            log::info!("draining {pending} queued requests");
        }
        self.pool.close();
        self.pool.join().await;

        if let Err(err) = self.kv.close() {
            log::error!("error closing shards: {err}");
        }
        if let Err(err) = self.queues.close() {
            log::error!("error closing queue backend: {err}");
        }
        log::info!("node {}: shutdown complete", self.config.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig::default()
            .with_node_id("test-node")
            .with_port(0)
            .with_shards(4)
            .with_workers(4)
    }

    #[tokio::test]
    async fn test_bind_assigns_ephemeral_port() {
        let server = Server::bind(test_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_serve() {
        let server = Server::bind(test_config()).await.unwrap();
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.serve());
        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = test_config().with_shards(0);
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Config(_))
        ));
    }
}
