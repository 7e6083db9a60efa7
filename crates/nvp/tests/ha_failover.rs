//! Failover: reconnection to a peer endpoint and replay of unacknowledged
//! requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nvp::{Client, ClientConfig};
use nvp_server::MemBackend;

mod common;
use common::TestServer;

const WAIT: Duration = Duration::from_secs(30);

/// Two servers over one shared backend, both advertised as cluster nodes.
fn start_pair() -> (TestServer, TestServer) {
    let backend = Arc::new(MemBackend::new("tcp://127.0.0.1:0"));
    let a = TestServer::start(Arc::clone(&backend), Default::default());
    let b = TestServer::start(backend, Default::default());
    a.backend
        .set_cluster_uris(&[a.uri.as_str(), b.uri.as_str()]);
    (a, b)
}

#[test_log::test]
fn writes_replay_on_peer_after_server_death() {
    let (mut a, b) = start_pair();
    let client = Client::connect(&a.uri, &ClientConfig::default()).unwrap();
    client.create_volume("v4", 1 << 20).unwrap();
    client.open_volume("v4").unwrap();

    // First write is acknowledged on the original server.
    let w1 = client.aio_write(&[0x01; 4096], 0).unwrap();
    assert_eq!(w1.wait_timeout(WAIT).unwrap(), 4096);

    // Kill the original; the remaining writes must fire exactly once each
    // through the replacement core.
    a.stop();
    let w2 = client.aio_write(&[0x02; 4096], 4096).unwrap();
    let w3 = client.aio_write(&[0x03; 4096], 8192).unwrap();
    assert_eq!(w2.wait_timeout(WAIT).unwrap(), 4096);
    assert_eq!(w3.wait_timeout(WAIT).unwrap(), 4096);

    // All three write cookies were observed, nothing else.
    assert_eq!(client.seen_request_ids().len(), 3);
    assert_eq!(client.inflight_requests(), 0);

    // The data is visible through the surviving peer.
    for (i, pattern) in [(0u64, 0x01u8), (4096, 0x02), (8192, 0x03)] {
        let buf = client.allocate_buffer(4096).unwrap();
        let read = client.aio_read(buf, i).unwrap();
        assert_eq!(read.wait_timeout(WAIT).unwrap(), 4096);
        assert!(read.take_buffer().unwrap().as_slice().iter().all(|b| *b == pattern));
    }
    drop(b);
}

#[test_log::test]
fn completions_are_delivered_exactly_once_across_failover() {
    let (mut a, b) = start_pair();
    let client = Client::connect(&a.uri, &ClientConfig::default()).unwrap();
    client.create_volume("v5", 1 << 20).unwrap();
    client.open_volume("v5").unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let mut completions = Vec::new();
    for i in 0..8u64 {
        let fired = Arc::clone(&fired);
        let c = client
            .aio_write_with_callback(&[i as u8; 512], i * 512, move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        completions.push(c);
        if i == 2 {
            a.stop();
        }
    }
    for c in &completions {
        assert_eq!(c.wait_timeout(WAIT).unwrap(), 512);
    }
    // Callbacks ran exactly once per request despite the replay.
    let deadline = std::time::Instant::now() + WAIT;
    while fired.load(Ordering::SeqCst) < 8 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 8);
    assert_eq!(client.inflight_requests(), 0);
    drop(b);
}

#[test_log::test]
fn control_plane_follows_the_active_core() {
    let (mut a, b) = start_pair();
    let client = Client::connect(&a.uri, &ClientConfig::default()).unwrap();
    client.create_volume("v6", 1 << 20).unwrap();
    client.open_volume("v6").unwrap();

    a.stop();
    // Force the supervisor to notice by pushing I/O through the dead core.
    let w = client.aio_write(&[9u8; 512], 0).unwrap();
    assert_eq!(w.wait_timeout(WAIT).unwrap(), 512);

    // Control ops now go to the replacement endpoint.
    let uris = client.list_cluster_node_uri().unwrap();
    assert!(uris.contains(&b.uri));
    assert_eq!(client.stat_volume("v6").unwrap(), 1 << 20);
    drop(b);
}
