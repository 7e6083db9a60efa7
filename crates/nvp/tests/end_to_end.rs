//! End-to-end tests: real client against a real server with the in-memory
//! backend.

use std::time::Duration;

use nvp::{Client, ClientConfig, Error};
use nvp::msg::errno;

mod common;
use common::TestServer;

const WAIT: Duration = Duration::from_secs(10);

fn client_for(server: &TestServer) -> Client {
    Client::connect(&server.uri, &ClientConfig::default()).expect("connect client")
}

#[test_log::test]
fn round_trip_read_returns_zeroes() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v1", 1 << 20).unwrap();
    client.open_volume("v1").unwrap();

    let buf = client.allocate_buffer(4096).unwrap();
    let read = client.aio_read(buf, 0).unwrap();
    assert_eq!(read.wait_timeout(WAIT).unwrap(), 4096);
    assert_eq!(read.errval(), 0);
    let buf = read.take_buffer().unwrap();
    assert!(buf.as_slice().iter().all(|b| *b == 0));

    client.close_volume().unwrap();
}

#[test_log::test]
fn write_then_read_sees_the_pattern() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v2", 1 << 20).unwrap();
    client.open_volume("v2").unwrap();

    let pattern = vec![0xab; 4096];
    let write = client.aio_write(&pattern, 4096).unwrap();
    assert_eq!(write.wait_timeout(WAIT).unwrap(), 4096);

    let buf = client.allocate_buffer(4096).unwrap();
    let read = client.aio_read(buf, 4096).unwrap();
    assert_eq!(read.wait_timeout(WAIT).unwrap(), 4096);
    assert_eq!(read.take_buffer().unwrap().as_slice(), &pattern[..]);
}

#[test_log::test]
fn flush_completes() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v", 4096).unwrap();
    client.open_volume("v").unwrap();
    let flush = client.aio_flush().unwrap();
    assert_eq!(flush.wait_timeout(WAIT).unwrap(), 0);
}

#[test_log::test]
fn snapshot_lifecycle_error_codes() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v3", 1 << 20).unwrap();

    client.snapshot_create("v3", "s1", 5).unwrap();
    match client.snapshot_create("v3", "s1", 5) {
        Err(Error::Remote(e)) => assert_eq!(e, errno::EEXIST),
        other => panic!("expected EEXIST, got {other:?}"),
    }
    let (snaps, size) = client.snapshot_list("v3").unwrap();
    assert_eq!(snaps, ["s1"]);
    assert_eq!(size, 1 << 20);
    assert!(client.is_snapshot_synced("v3", "s1").unwrap());

    client.snapshot_remove("v3", "s1").unwrap();
    match client.snapshot_remove("v3", "s1") {
        Err(Error::Remote(e)) => assert_eq!(e, errno::ENOENT),
        other => panic!("expected ENOENT, got {other:?}"),
    }
}

#[test_log::test]
fn volume_management_roundtrip() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    for name in ["a", "b", "c"] {
        client.create_volume(name, 4096).unwrap();
    }
    assert_eq!(client.list_volumes().unwrap(), ["a", "b", "c"]);
    assert_eq!(client.stat_volume("b").unwrap(), 4096);

    client.truncate_volume("b", 8192).unwrap();
    assert_eq!(client.stat_volume("b").unwrap(), 8192);

    client.remove_volume("b").unwrap();
    assert_eq!(client.list_volumes().unwrap(), ["a", "c"]);
    match client.stat_volume("b") {
        Err(Error::Remote(e)) => assert_eq!(e, errno::ENOENT),
        other => panic!("expected ENOENT, got {other:?}"),
    }
}

#[test_log::test]
fn create_existing_volume_is_eexist() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("dup", 4096).unwrap();
    match client.create_volume("dup", 4096) {
        Err(Error::Remote(e)) => assert_eq!(e, errno::EEXIST),
        other => panic!("expected EEXIST, got {other:?}"),
    }
}

#[test_log::test]
fn open_missing_volume_is_eacces() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    match client.open_volume("missing") {
        Err(Error::Remote(e)) => assert_eq!(e, errno::EACCES),
        other => panic!("expected EACCES, got {other:?}"),
    }
}

#[test_log::test]
fn second_open_on_session_is_eio() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v", 4096).unwrap();
    client.create_volume("w", 4096).unwrap();
    client.open_volume("v").unwrap();
    match client.open_volume("w") {
        Err(Error::Remote(e)) => assert_eq!(e, errno::EIO),
        other => panic!("expected EIO, got {other:?}"),
    }
}

#[test_log::test]
fn callbacks_fire_on_dispatcher() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v", 1 << 20).unwrap();
    client.open_volume("v").unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let write = client
        .aio_write_with_callback(&[0x11; 4096], 0, move |retval, errval| {
            tx.send((retval, errval)).unwrap();
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (4096, 0));
    assert!(write.is_done());
}

#[test_log::test]
fn cancel_is_unsupported() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v", 1 << 20).unwrap();
    client.open_volume("v").unwrap();
    let write = client.aio_write(&[0u8; 16], 0).unwrap();
    assert!(matches!(write.cancel(), Err(Error::NotSupported)));
    write.wait_timeout(WAIT).unwrap();
}

#[test_log::test]
fn cluster_and_volume_uris() {
    let server = TestServer::start_default();
    let client = client_for(&server);
    client.create_volume("v", 4096).unwrap();
    assert_eq!(client.list_cluster_node_uri().unwrap(), [server.uri.clone()]);
    assert_eq!(client.get_volume_uri("v").unwrap(), server.uri);
    match client.get_volume_uri("missing") {
        Err(Error::Remote(e)) => assert_eq!(e, errno::ENOENT),
        other => panic!("expected ENOENT, got {other:?}"),
    }
}

#[test_log::test]
fn five_concurrent_reads_with_tiny_pool_slab() {
    use nvp_server::{MemPool, ServerConfig};

    // One 4 KiB slab capped at 4 blocks: the fifth concurrent reply buffer
    // must come from the heap fallback, invisibly to the client.
    let pool = MemPool::builder()
        .add_slab(4096, 0, 4, 4)
        .check_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let backend = std::sync::Arc::new(nvp_server::MemBackend::new("tcp://127.0.0.1:0"));
    let server = TestServer::start(
        backend,
        ServerConfig {
            pool: Some(pool),
            ..Default::default()
        },
    );
    let client = client_for(&server);
    client.create_volume("v", 1 << 20).unwrap();
    client.open_volume("v").unwrap();
    client.aio_write(&[0x5a; 4096], 0).unwrap().wait_timeout(WAIT).unwrap();

    let reads: Vec<_> = (0..5)
        .map(|_| {
            let buf = client.allocate_buffer(4096).unwrap();
            client.aio_read(buf, 0).unwrap()
        })
        .collect();
    for read in &reads {
        assert_eq!(read.wait_timeout(WAIT).unwrap(), 4096);
        let buf = read.take_buffer().unwrap();
        assert!(buf.as_slice().iter().all(|b| *b == 0x5a));
    }
}

#[test_log::test]
fn non_ha_client_fails_after_connection_loss() {
    let mut server = TestServer::start_default();
    let config = ClientConfig {
        ha_enabled: false,
        ..Default::default()
    };
    let client = Client::connect(&server.uri, &config).unwrap();
    client.create_volume("v", 1 << 20).unwrap();
    client.open_volume("v").unwrap();
    server.stop();

    // Either the submit is rejected outright or the request completes with
    // EIO; it must not hang and must not succeed.
    match client.aio_write(&[1u8; 4096], 0) {
        Ok(write) => match write.wait_timeout(WAIT) {
            Err(Error::Remote(e)) => assert_eq!(e, errno::EIO),
            other => panic!("expected EIO completion, got {other:?}"),
        },
        Err(e) => assert_ne!(e.to_errno(), 0),
    }
}
