//! Test harness: a real server on an ephemeral port, driven on its own
//! thread, backed by the in-memory backend.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use nvp_server::{MemBackend, Server, ServerConfig, ServerHandle};

pub struct TestServer {
    pub uri: String,
    pub backend: Arc<MemBackend>,
    handle: ServerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(backend: Arc<MemBackend>, config: ServerConfig) -> TestServer {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build server runtime");
        let server = rt
            .block_on(Server::bind(
                &"tcp://127.0.0.1:0".parse().expect("parse uri"),
                backend.clone(),
                config,
            ))
            .expect("bind server");
        let uri = server.local_uri().expect("local uri").to_string();
        let handle = server.handle();
        let thread = thread::spawn(move || {
            rt.block_on(server.run()).expect("server run");
        });
        TestServer {
            uri,
            backend,
            handle,
            thread: Some(thread),
        }
    }

    pub fn start_default() -> TestServer {
        let backend = Arc::new(MemBackend::new("tcp://127.0.0.1:0"));
        let server = Self::start(backend, ServerConfig::default());
        server.backend.set_node_uri(&server.uri);
        server.backend.set_cluster_uris(&[server.uri.as_str()]);
        server
    }

    /// Graceful shutdown; waits for the event loop to drain.
    pub fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("join server thread");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}
