//! Per-node connection pools
//!
//! Each node gets a pool of persistent framed TCP connections held in a
//! channel of handles. `get` blocks while every connection is in use; a
//! connection that observes a send or receive error is handed to a
//! background repair task that reconnects it with a fixed delay and
//! returns it to the pool.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::protocol::{ProtocolError, HEADER_LEN, MAX_FRAME_LEN};

use super::{ClientError, ClientResult};

/// Buffered stream capacity.
const STREAM_BUF: usize = 32 * 1024;

/// Kernel socket buffer request.
const SOCKET_BUF: usize = 4 * 1024 * 1024;

/// TCP keep-alive probe period.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Pool tuning parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Persistent connections kept per node
    pub connections: usize,

    /// Deadline for establishing a TCP connection
    pub connect_timeout: Duration,

    /// Deadline for reading one response
    pub read_timeout: Duration,

    /// Deadline for writing one request
    pub write_timeout: Duration,

    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections: 256,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Counter snapshot for one node's pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Configured pool size
    pub size: usize,
    /// Connections currently checked out
    pub in_use: usize,
    /// Successful reconnections
    pub reconnects: u64,
    /// Send/receive failures observed
    pub failures: u64,
}

#[derive(Default)]
struct PoolCounters {
    in_use: AtomicUsize,
    reconnects: AtomicU64,
    failures: AtomicU64,
}

/// One pooled connection with framed request/response I/O.
///
/// The stream is established lazily on first checkout and dropped when a
/// send or receive fails; the pool's repair task re-establishes it.
pub struct FramedConn {
    addr: String,
    stream: Option<BufStream<TcpStream>>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl FramedConn {
    fn new(addr: String, config: &PoolConfig) -> Self {
        Self {
            addr,
            stream: None,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    async fn connect(&mut self, connect_timeout: Duration) -> ClientResult<()> {
        let stream = timeout(connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Connection(format!("{}: {e}", self.addr)))?;
        tune_socket(&stream, &self.addr);
        self.stream = Some(BufStream::with_capacity(STREAM_BUF, STREAM_BUF, stream));
        Ok(())
    }

    /// Send one request frame and read the matching response.
    ///
    /// Returns the status byte and response payload. Any failure leaves
    /// the connection disconnected; hand it back with
    /// [`NodePool::recycle`].
    pub async fn roundtrip(&mut self, frame: &[u8]) -> ClientResult<(u8, Vec<u8>)> {
        let result = self.roundtrip_inner(frame).await;
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    async fn roundtrip_inner(&mut self, frame: &[u8]) -> ClientResult<(u8, Vec<u8>)> {
        let read_timeout = self.read_timeout;
        let write_timeout = self.write_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ClientError::Connection("not connected".to_string()))?;

        timeout(write_timeout, async {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let mut header = [0u8; HEADER_LEN];
        timeout(read_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[1..]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(payload_len).into());
        }
        let mut payload = vec![0u8; payload_len];
        timeout(read_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok((header[0], payload))
    }
}

fn tune_socket(stream: &TcpStream, addr: &str) {
    let sock = SockRef::from(stream);
    if let Err(err) = sock.set_nodelay(true) {
        log::warn!("{addr}: failed to disable Nagle: {err}");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        log::warn!("{addr}: failed to enable keep-alive: {err}");
    }
    if let Err(err) = sock.set_recv_buffer_size(SOCKET_BUF) {
        log::debug!("{addr}: recv buffer request refused: {err}");
    }
    if let Err(err) = sock.set_send_buffer_size(SOCKET_BUF) {
        log::debug!("{addr}: send buffer request refused: {err}");
    }
}

/// Pool of persistent connections to one node.
pub struct NodePool {
    addr: String,
    config: PoolConfig,
    idle_tx: mpsc::Sender<FramedConn>,
    idle_rx: Mutex<mpsc::Receiver<FramedConn>>,
    repair_tx: mpsc::UnboundedSender<FramedConn>,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    counters: Arc<PoolCounters>,
}

impl NodePool {
    /// Build a pool and start its repair task. Connections are
    /// established lazily on first checkout.
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let addr = addr.into();
        let size = config.connections.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(size);
        let (repair_tx, repair_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        for _ in 0..size {
            // Cannot fail: the channel capacity equals the handle count.
            let _ = idle_tx.try_send(FramedConn::new(addr.clone(), &config));
        }
        let counters = Arc::new(PoolCounters::default());
        let pool = Arc::new(Self {
            addr: addr.clone(),
            config: config.clone(),
            idle_tx: idle_tx.clone(),
            idle_rx: Mutex::new(idle_rx),
            repair_tx,
            closed: Arc::new(AtomicBool::new(false)),
            close_tx,
            close_rx: close_rx.clone(),
            counters: Arc::clone(&counters),
        });
        tokio::spawn(repair_loop(
            addr, config, repair_rx, idle_tx, close_rx, counters,
        ));
        pool
    }

    /// Address this pool connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check out a connection, waiting while all are in use.
    ///
    /// The wait is bounded by the connect timeout: while the node is down
    /// every handle sits with the repair task, and an unbounded wait here
    /// would let one dead replica stall a whole quorum fan-out.
    ///
    /// The connection is live on return; if the node is unreachable the
    /// handle goes to the repair task and the error surfaces immediately.
    pub async fn get(&self) -> ClientResult<FramedConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let mut close_rx = self.close_rx.clone();
        let mut conn = {
            let mut rx = self.idle_rx.lock().await;
            tokio::select! {
                _ = close_rx.changed() => return Err(ClientError::Closed),
                _ = tokio::time::sleep(self.config.connect_timeout) => {
                    return Err(ClientError::Connection(format!(
                        "{}: connection checkout timed out",
                        self.addr
                    )));
                }
                conn = rx.recv() => conn.ok_or(ClientError::Closed)?,
            }
        };
        if !conn.is_connected() {
            if let Err(err) = conn.connect(self.config.connect_timeout).await {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let _ = self.repair_tx.send(conn);
                return Err(err);
            }
        }
        self.counters.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Return a healthy connection.
    pub async fn put(&self, conn: FramedConn) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        if self.idle_tx.send(conn).await.is_err() {
            log::debug!("{}: pool closed while returning connection", self.addr);
        }
    }

    /// Return a connection that observed an error. The repair task
    /// reconnects it in the background.
    pub fn recycle(&self, mut conn: FramedConn) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        conn.disconnect();
        let _ = self.repair_tx.send(conn);
    }

    /// Stop the repair task and fail subsequent checkouts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.close_tx.send(true);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.config.connections.max(1),
            in_use: self.counters.in_use.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Reconnect broken handles with a fixed delay until the pool closes.
async fn repair_loop(
    addr: String,
    config: PoolConfig,
    mut repair_rx: mpsc::UnboundedReceiver<FramedConn>,
    idle_tx: mpsc::Sender<FramedConn>,
    mut close_rx: watch::Receiver<bool>,
    counters: Arc<PoolCounters>,
) {
    loop {
        let conn = tokio::select! {
            _ = close_rx.changed() => break,
            conn = repair_rx.recv() => match conn {
                Some(conn) => conn,
                None => break,
            },
        };
        let mut conn = conn;
        loop {
            if *close_rx.borrow() {
                return;
            }
            match conn.connect(config.connect_timeout).await {
                Ok(()) => {
                    counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    log::debug!("{addr}: connection repaired");
                    if idle_tx.send(conn).await.is_err() {
                        return;
                    }
                    break;
                }
                Err(err) => {
                    log::debug!("{addr}: reconnect failed: {err}");
                    tokio::select! {
                        _ = close_rx.changed() => return,
                        _ = tokio::time::sleep(config.reconnect_delay) => {}
                    }
                }
            }
        }
    }
}
