//! End-to-end queue tests over a real listener and the cluster client.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flin::client::{ClientConfig, ClusterClient, PoolConfig};
use flin::server::ShutdownHandle;
use flin::{Server, ServerConfig};

async fn start_node(name: &str) -> (SocketAddr, ShutdownHandle) {
    let config = ServerConfig::default()
        .with_node_id(name)
        .with_host("127.0.0.1")
        .with_port(0)
        .with_shards(8)
        .with_workers(4);
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    tokio::spawn(server.serve());
    (addr, handle)
}

fn test_client_config() -> ClientConfig {
    ClientConfig {
        partitions: 64,
        pool: PoolConfig {
            connections: 8,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(100),
        },
    }
}

#[tokio::test]
async fn test_fifo_scenario() {
    let (addr, handle) = start_node("queue-fifo").await;
    let client = ClusterClient::single(addr.to_string(), test_client_config()).unwrap();

    client.queue_push("tasks", b"A").await.unwrap();
    client.queue_push("tasks", b"B").await.unwrap();
    client.queue_push("tasks", b"C").await.unwrap();
    assert_eq!(client.queue_len("tasks").await.unwrap(), 3);

    assert_eq!(client.queue_pop("tasks").await.unwrap(), Some(b"A".to_vec()));
    assert_eq!(client.queue_pop("tasks").await.unwrap(), Some(b"B".to_vec()));
    assert_eq!(client.queue_pop("tasks").await.unwrap(), Some(b"C".to_vec()));
    assert_eq!(client.queue_pop("tasks").await.unwrap(), None);

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn test_peek_and_clear() {
    let (addr, handle) = start_node("queue-peek").await;
    let client = ClusterClient::single(addr.to_string(), test_client_config()).unwrap();

    assert_eq!(client.queue_peek("jobs").await.unwrap(), None);
    client.queue_push("jobs", b"first").await.unwrap();
    client.queue_push("jobs", b"second").await.unwrap();
    assert_eq!(client.queue_peek("jobs").await.unwrap(), Some(b"first".to_vec()));
    assert_eq!(client.queue_len("jobs").await.unwrap(), 2);

    client.queue_clear("jobs").await.unwrap();
    assert_eq!(client.queue_len("jobs").await.unwrap(), 0);
    assert_eq!(client.queue_pop("jobs").await.unwrap(), None);

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn test_queues_do_not_interfere() {
    let (addr, handle) = start_node("queue-many").await;
    let client = ClusterClient::single(addr.to_string(), test_client_config()).unwrap();

    for i in 0..5u8 {
        client.queue_push("left", &[i]).await.unwrap();
        client.queue_push("right", &[100 + i]).await.unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(client.queue_pop("left").await.unwrap(), Some(vec![i]));
        assert_eq!(client.queue_pop("right").await.unwrap(), Some(vec![100 + i]));
    }

    client.close();
    handle.shutdown();
}

/// Concurrent pushers and poppers on one queue: every pushed payload is
/// either popped exactly once or still enqueued at the end, and the
/// length never goes negative (it is unsigned on the wire; the check is
/// that accounting balances).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_push_pop_accounting() {
    let (addr, handle) = start_node("queue-stress").await;
    let client = Arc::new(ClusterClient::single(addr.to_string(), test_client_config()).unwrap());

    let pushers = 4usize;
    let per_pusher = 100usize;
    let total = pushers * per_pusher;

    let mut tasks = Vec::new();
    for p in 0..pushers {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for i in 0..per_pusher {
                client
                    .queue_push("stress", format!("{p}:{i}").as_bytes())
                    .await
                    .unwrap();
            }
        }));
    }

    let mut poppers = Vec::new();
    for _ in 0..pushers {
        let client = Arc::clone(&client);
        poppers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut misses = 0;
            loop {
                match client.queue_pop("stress").await.unwrap() {
                    Some(payload) => {
                        seen.push(payload);
                        misses = 0;
                    }
                    None => {
                        misses += 1;
                        // Stop after the queue stays dry for a while.
                        if misses > 20 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            seen
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    let mut popped = Vec::new();
    for popper in poppers {
        popped.extend(popper.await.unwrap());
    }

    let remaining = client.queue_len("stress").await.unwrap() as usize;
    assert_eq!(popped.len() + remaining, total, "push/pop accounting");

    // No payload may be popped twice.
    let unique: HashSet<&Vec<u8>> = popped.iter().collect();
    assert_eq!(unique.len(), popped.len(), "duplicate pop detected");

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn test_large_values_roundtrip() {
    let (addr, handle) = start_node("queue-large").await;
    let client = ClusterClient::single(addr.to_string(), test_client_config()).unwrap();

    let value = vec![0xabu8; 512 * 1024];
    client.queue_push("big", &value).await.unwrap();
    assert_eq!(client.queue_pop("big").await.unwrap(), Some(value));

    client.close();
    handle.shutdown();
}
