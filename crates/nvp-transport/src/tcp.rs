//! TCP connection establishment.

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream, lookup_host};

use crate::{KeepaliveConfig, Result, TransportError, Uri};

fn apply_keepalive(stream: &TcpStream, keepalive: &KeepaliveConfig) -> std::io::Result<()> {
    let ka = TcpKeepalive::new()
        .with_time(keepalive.time)
        .with_interval(keepalive.interval)
        .with_retries(keepalive.probes);
    SockRef::from(stream).set_tcp_keepalive(&ka)
}

/// Connects to `uri` and applies `keepalive` to the socket.
pub async fn connect(uri: &Uri, keepalive: &KeepaliveConfig) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host(uri.authority()).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                apply_keepalive(&stream, keepalive)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => TransportError::Io(e),
        None => TransportError::Unresolvable(uri.to_string()),
    })
}

/// Binds a listener on `uri`.
pub async fn listen(uri: &Uri) -> Result<TcpListener> {
    let mut last_err = None;
    for addr in lookup_host(uri.authority()).await? {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => TransportError::Io(e),
        None => TransportError::Unresolvable(uri.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_applies_keepalive() {
        let listener = listen(&Uri::tcp("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect(&Uri::tcp("127.0.0.1", port), &KeepaliveConfig::default())
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn connect_to_dead_port_fails() {
        let listener = listen(&Uri::tcp("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect(&Uri::tcp("127.0.0.1", port), &KeepaliveConfig::default()).await;
        assert!(err.is_err());
    }
}
