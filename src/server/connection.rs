//! Per-connection loop
//!
//! Each accepted socket gets one reader task and one writer task. The
//! reader parses frames and either executes fast-path opcodes inline or
//! submits the request to the worker pool. Every request carries a
//! per-connection sequence number; the writer buffers out-of-order
//! completions and releases frames strictly in sequence, so responses
//! always leave in request order no matter where they were executed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::protocol::{codec, Response, HEADER_LEN, MAX_FRAME_LEN};

use super::dispatch::Handler;
use super::worker::{Completion, WorkItem};

/// Per-connection read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered reader/writer capacity.
const STREAM_BUF: usize = 32 * 1024;

/// Kernel socket buffer request.
const SOCKET_BUF: usize = 4 * 1024 * 1024;

/// TCP keep-alive probe period.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// In-flight completions a connection can buffer before its producers
/// block.
const COMPLETION_QUEUE: usize = 1024;

/// Advisory deadline attached to slow-path work items.
const TASK_DEADLINE: Duration = Duration::from_secs(30);

/// Apply the connection tuning profile. Buffer sizing is best-effort;
/// the OS may clamp or refuse it.
fn tune_socket(stream: &TcpStream, peer: SocketAddr) {
    let sock = SockRef::from(stream);
    if let Err(err) = sock.set_nodelay(true) {
        log::warn!("{peer}: failed to disable Nagle: {err}");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        log::warn!("{peer}: failed to enable keep-alive: {err}");
    }
    if let Err(err) = sock.set_recv_buffer_size(SOCKET_BUF) {
        log::debug!("{peer}: recv buffer request refused: {err}");
    }
    if let Err(err) = sock.set_send_buffer_size(SOCKET_BUF) {
        log::debug!("{peer}: send buffer request refused: {err}");
    }
}

/// Drive one client connection until EOF, error, or shutdown.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    submit: mpsc::Sender<WorkItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    tune_socket(&stream, peer);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(STREAM_BUF, read_half);
    let writer = BufWriter::with_capacity(STREAM_BUF, write_half);

    let (completions_tx, completions_rx) = mpsc::channel::<Completion>(COMPLETION_QUEUE);
    let writer_task = tokio::spawn(writer_loop(writer, completions_rx, peer));

    let mut seq = 0u64;
    loop {
        // A connection accepted concurrently with the shutdown signal may
        // have subscribed after the edge; the flag read catches it.
        if *shutdown.borrow() {
            log::debug!("{peer}: connection closing on shutdown signal");
            break;
        }
        let header = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                log::debug!("{peer}: connection closing on shutdown signal");
                break;
            }
            header = read_header(&mut reader) => header,
        };
        let (opcode, payload_len) = match header {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(err) => {
                log::debug!("{peer}: read error: {err}");
                break;
            }
        };

        if payload_len > MAX_FRAME_LEN {
            // The stream cannot be resynchronised without consuming the
            // oversized payload, so refuse and drop the connection.
            let frame = codec::encode_response(&Response::Error(format!(
                "frame of {payload_len} bytes exceeds maximum"
            )));
            let _ = completions_tx.send(Completion { seq, frame }).await;
            break;
        }

        let mut payload = vec![0u8; payload_len];
        match timeout(READ_TIMEOUT, reader.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                log::debug!("{peer}: payload read error: {err}");
                break;
            }
            Err(_) => {
                log::debug!("{peer}: payload read timed out");
                break;
            }
        }

        let request = match codec::decode_request(opcode, &payload) {
            Ok(request) => request,
            Err(err) => {
                // Framing is still intact: the declared payload was fully
                // consumed, so reply and keep the connection.
                let frame = codec::encode_response(&Response::Error(err.to_string()));
                if completions_tx.send(Completion { seq, frame }).await.is_err() {
                    break;
                }
                seq += 1;
                continue;
            }
        };

        if request.is_fast_path() {
            let response = handler.execute(&request);
            let frame = codec::encode_response(&response);
            if completions_tx.send(Completion { seq, frame }).await.is_err() {
                break;
            }
        } else {
            let item = WorkItem {
                request,
                seq,
                completions: completions_tx.clone(),
                deadline: Some(Instant::now() + TASK_DEADLINE),
            };
            // Blocks while the pool queue is full: the reader stops
            // consuming and the kernel pushes back on the client.
            if submit.send(item).await.is_err() {
                let frame = codec::encode_response(&Response::Error(
                    "server is shutting down".to_string(),
                ));
                let _ = completions_tx.send(Completion { seq, frame }).await;
                break;
            }
        }
        seq += 1;
    }

    // Dropping our sender lets the writer drain what is already queued;
    // completions from still-running workers go to a closed socket and
    // are discarded there.
    drop(completions_tx);
    let _ = writer_task.await;
    log::debug!("{peer}: connection closed after {seq} requests");
}

/// Read one frame header. `Ok(None)` is a clean EOF at a frame boundary.
async fn read_header(
    reader: &mut BufReader<OwnedReadHalf>,
) -> std::io::Result<Option<(u8, usize)>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_u8().await {
        Ok(byte) => header[0] = byte,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    match timeout(READ_TIMEOUT, reader.read_exact(&mut header[1..])).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "header read timed out",
            ))
        }
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[1..]);
    Ok(Some((header[0], u32::from_be_bytes(len_bytes) as usize)))
}

/// Reassemble sequence-tagged completions and write frames in order.
async fn writer_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut completions: mpsc::Receiver<Completion>,
    peer: SocketAddr,
) {
    let mut next_seq = 0u64;
    let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    while let Some(completion) = completions.recv().await {
        pending.insert(completion.seq, completion.frame);
        while let Some(frame) = pending.remove(&next_seq) {
            match timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await {
                Ok(Ok(())) => next_seq += 1,
                Ok(Err(err)) => {
                    log::debug!("{peer}: write error: {err}");
                    return;
                }
                Err(_) => {
                    log::debug!("{peer}: write timed out");
                    return;
                }
            }
        }
        // Flush once the channel momentarily runs dry instead of after
        // every frame, so pipelined bursts batch into fewer syscalls.
        if completions.is_empty() {
            match timeout(WRITE_TIMEOUT, writer.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::debug!("{peer}: flush error: {err}");
                    return;
                }
                Err(_) => {
                    log::debug!("{peer}: flush timed out");
                    return;
                }
            }
        }
    }
    let _ = timeout(WRITE_TIMEOUT, writer.flush()).await;
}
