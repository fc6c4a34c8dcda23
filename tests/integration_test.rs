//! Integration tests for UDP TLS Pool
//!
//! Runs both sides over loopback sockets:
//! - Datagram round trip through client, pooled streams, server and destination
//! - Session affinity as seen on the wire
//! - Isolation of a failed pool member
//! - Shutdown of every session and link
//! - The same round trip over TLS

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use udp_tls_pool::client::{UdpListener, UdpListenerConfig};
use udp_tls_pool::protocol::{read_handshake, SessionId};
use udp_tls_pool::server::{Dispatcher, DispatcherConfig, StreamListener};
use udp_tls_pool::transport::{Acceptor, Connector, TcpAcceptor, TcpConnector};
use udp_tls_pool::tunnel::{read_frame, LinkState, PoolConfig, SessionFactory};

const STEP: Duration = Duration::from_secs(10);

/// UDP destination answering every datagram with `reply`
async fn reply_destination(reply: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<Bytes>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                break;
            }
            let _ = socket.send_to(reply, from).await;
        }
    });

    (addr, rx)
}

struct Server {
    listener: StreamListener,
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
}

impl Server {
    async fn start(acceptor: Arc<dyn Acceptor>, destination: SocketAddr) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::new(destination.to_string())));
        let listener = StreamListener::new("127.0.0.1:0", acceptor, Arc::clone(&dispatcher));
        let addr = listener.start().await.unwrap();
        Self {
            listener,
            dispatcher,
            addr,
        }
    }

    async fn stop(&self) {
        self.listener.stop().await;
        self.dispatcher.stop().await;
    }
}

async fn start_client(
    connector: Arc<dyn Connector>,
    remote: String,
    pool: PoolConfig,
) -> (UdpListener, SocketAddr) {
    let factory = SessionFactory::new(remote, connector, pool);
    let listener = UdpListener::new(UdpListenerConfig::new("127.0.0.1:0"), factory);
    let addr = listener.start().await.unwrap();
    (listener, addr)
}

fn pool(pool_size: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        ..PoolConfig::default()
    }
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65535];
    let n = tokio::time::timeout(STEP, socket.recv(&mut buf))
        .await
        .expect("datagram did not arrive")
        .unwrap();
    buf.truncate(n);
    buf
}

async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(STEP, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Datagram from a UDP peer reaches the destination and the reply comes back
#[tokio::test]
async fn test_end_to_end_over_tcp() {
    let (destination, mut seen) = reply_destination(b"\x03\x04").await;
    let server = Server::start(Arc::new(TcpAcceptor::new()), destination).await;
    let (client, client_addr) =
        start_client(Arc::new(TcpConnector::new()), server.addr.to_string(), pool(2)).await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.connect(client_addr).await.unwrap();
    peer.send(b"\x01\x02").await.unwrap();

    let forwarded = tokio::time::timeout(STEP, seen.recv()).await.unwrap().unwrap();
    assert_eq!(&forwarded[..], b"\x01\x02");
    assert_eq!(recv(&peer).await, b"\x03\x04");

    let peer_addr = peer.local_addr().unwrap();
    let session = client.session_for(&peer_addr).unwrap();
    assert_eq!(client.session_count(), 1);
    assert_eq!(server.dispatcher.session_count().await, 1);

    // A second datagram from the same peer uses the same session
    peer.send(b"\x05").await.unwrap();
    let forwarded = tokio::time::timeout(STEP, seen.recv()).await.unwrap().unwrap();
    assert_eq!(&forwarded[..], b"\x05");
    assert_eq!(recv(&peer).await, b"\x03\x04");
    assert_eq!(client.session_for(&peer_addr).unwrap().id(), session.id());

    client.stop().await;
    server.stop().await;
}

/// Every link of a session presents the same id; different peers get different ids
#[tokio::test]
async fn test_session_affinity_on_the_wire() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = raw.local_addr().unwrap().to_string();
    let (client, client_addr) = start_client(Arc::new(TcpConnector::new()), remote, pool(3)).await;

    let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer_a.send_to(b"a1", client_addr).await.unwrap();
    peer_a.send_to(b"a2", client_addr).await.unwrap();

    let mut conns = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (mut stream, _) = tokio::time::timeout(STEP, raw.accept()).await.unwrap().unwrap();
        ids.push(read_handshake(&mut stream).await.unwrap());
        conns.push(stream);
    }
    assert!(ids.iter().all(|id| *id == ids[0]));

    let a = client.session_for(&peer_a.local_addr().unwrap()).unwrap();
    assert_eq!(a.id(), ids[0]);

    peer_b.send_to(b"b1", client_addr).await.unwrap();
    let (mut stream, _) = tokio::time::timeout(STEP, raw.accept()).await.unwrap().unwrap();
    let id_b: SessionId = read_handshake(&mut stream).await.unwrap();
    assert_ne!(id_b, ids[0]);
    conns.push(stream);

    client.stop().await;
    assert_eq!(client.session_count(), 0);
}

/// Losing one pool member leaves the other seven delivering
#[tokio::test]
async fn test_failed_member_is_isolated() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = raw.local_addr().unwrap().to_string();
    let (client, client_addr) = start_client(Arc::new(TcpConnector::new()), remote, pool(8)).await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"first", client_addr).await.unwrap();

    let mut conns: Vec<TcpStream> = Vec::new();
    for _ in 0..8 {
        let (mut stream, _) = tokio::time::timeout(STEP, raw.accept()).await.unwrap().unwrap();
        read_handshake(&mut stream).await.unwrap();
        conns.push(stream);
    }

    let session = client.session_for(&peer.local_addr().unwrap()).unwrap();
    eventually(|| session.links().iter().all(|l| l.state() == LinkState::Streaming)).await;

    // Cut one connection
    drop(conns.pop());
    eventually(|| {
        session
            .links()
            .iter()
            .filter(|l| l.state() == LinkState::Backoff)
            .count()
            == 1
    })
    .await;
    assert_eq!(
        session
            .links()
            .iter()
            .filter(|l| l.state() == LinkState::Streaming)
            .count(),
        7
    );

    // Collect frames from the survivors
    let (tx, mut frames) = mpsc::unbounded_channel();
    for mut stream in conns {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(frame) = read_frame(&mut stream).await {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut expected = Vec::new();
    for i in 0..20u8 {
        peer.send_to(&[i], client_addr).await.unwrap();
        expected.push(Bytes::copy_from_slice(&[i]));
    }

    let mut delivered = Vec::new();
    while delivered.len() < expected.len() {
        let frame = tokio::time::timeout(STEP, frames.recv())
            .await
            .expect("datagram lost")
            .unwrap();
        // The session's first datagram may have gone out on any member
        if &frame[..] != b"first" {
            delivered.push(frame);
        }
    }
    delivered.sort();
    assert_eq!(delivered, expected);

    client.stop().await;
}

/// Stopping both sides leaves nothing running
#[tokio::test]
async fn test_shutdown_completeness() {
    let (destination, _seen) = reply_destination(b"ok").await;
    let server = Server::start(Arc::new(TcpAcceptor::new()), destination).await;
    let (client, client_addr) =
        start_client(Arc::new(TcpConnector::new()), server.addr.to_string(), pool(4)).await;

    let mut peers = Vec::new();
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(client_addr).await.unwrap();
        peer.send(b"ping").await.unwrap();
        assert_eq!(recv(&peer).await, b"ok");
        sessions.push(client.session_for(&peer.local_addr().unwrap()).unwrap());
        peers.push(peer);
    }
    assert_eq!(client.session_count(), 3);

    client.stop().await;
    assert_eq!(client.session_count(), 0);
    for session in &sessions {
        assert_eq!(session.queued(), 0);
        assert!(session.links().iter().all(|l| l.state() == LinkState::Stopped));
    }

    server.stop().await;
    assert_eq!(server.dispatcher.session_count().await, 0);

    // Second stop on both sides is a no-op
    client.stop().await;
    server.stop().await;
}

/// Server restarts are absorbed by link reconnects
#[tokio::test]
async fn test_links_reconnect_after_server_restart() {
    let (destination, _seen) = reply_destination(b"back").await;
    let server = Server::start(Arc::new(TcpAcceptor::new()), destination).await;
    let server_addr = server.addr;
    let (client, client_addr) = start_client(
        Arc::new(TcpConnector::new()),
        server_addr.to_string(),
        PoolConfig {
            pool_size: 2,
            backoff: Duration::from_millis(100),
            ..PoolConfig::default()
        },
    )
    .await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.connect(client_addr).await.unwrap();
    peer.send(b"one").await.unwrap();
    assert_eq!(recv(&peer).await, b"back");
    let session = client.session_for(&peer.local_addr().unwrap()).unwrap();

    server.stop().await;
    eventually(|| session.links().iter().all(|l| l.state() != LinkState::Streaming)).await;

    // Same port, fresh server
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::new(destination.to_string())));
    let listener = StreamListener::new(
        server_addr.to_string(),
        Arc::new(TcpAcceptor::new()),
        Arc::clone(&dispatcher),
    );
    listener.start().await.unwrap();

    eventually(|| session.links().iter().all(|l| l.state() == LinkState::Streaming)).await;
    peer.send(b"two").await.unwrap();
    assert_eq!(recv(&peer).await, b"back");

    client.stop().await;
    listener.stop().await;
    dispatcher.stop().await;
}

#[cfg(feature = "tls")]
mod tls {
    use super::*;
    use udp_tls_pool::transport::{build_client_config, build_server_config, TlsAcceptor, TlsConnector};

    struct Material {
        dir: std::path::PathBuf,
    }

    impl Material {
        fn generate(name: &str) -> Self {
            let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let dir = std::env::temp_dir().join(format!("udp-tls-pool-{}-{}", name, std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("cert.pem"), certified.cert.pem()).unwrap();
            std::fs::write(dir.join("key.pem"), certified.key_pair.serialize_pem()).unwrap();
            Self { dir }
        }

        fn cert(&self) -> std::path::PathBuf {
            self.dir.join("cert.pem")
        }

        fn key(&self) -> std::path::PathBuf {
            self.dir.join("key.pem")
        }
    }

    impl Drop for Material {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn test_end_to_end_over_tls() {
        let material = Material::generate("e2e");
        let server_config = build_server_config(&material.cert(), &material.key(), None).unwrap();
        let client_config = build_client_config(Some(material.cert().as_path()), None).unwrap();

        let (destination, mut seen) = reply_destination(b"\x03\x04").await;
        let server = Server::start(Arc::new(TlsAcceptor::new(Arc::new(server_config))), destination).await;
        let connector = TlsConnector::new(Arc::new(client_config), Some("localhost")).unwrap();
        let (client, client_addr) =
            start_client(Arc::new(connector), server.addr.to_string(), pool(2)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(client_addr).await.unwrap();
        peer.send(b"\x01\x02").await.unwrap();

        let forwarded = tokio::time::timeout(STEP, seen.recv()).await.unwrap().unwrap();
        assert_eq!(&forwarded[..], b"\x01\x02");
        assert_eq!(recv(&peer).await, b"\x03\x04");

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_untrusted_server_is_refused() {
        let server_material = Material::generate("server");
        let other_material = Material::generate("other");
        let server_config = build_server_config(&server_material.cert(), &server_material.key(), None).unwrap();
        let client_config = build_client_config(Some(other_material.cert().as_path()), None).unwrap();

        let (destination, _seen) = reply_destination(b"never").await;
        let server = Server::start(Arc::new(TlsAcceptor::new(Arc::new(server_config))), destination).await;
        let connector = TlsConnector::new(Arc::new(client_config), Some("localhost")).unwrap();
        let (client, client_addr) =
            start_client(Arc::new(connector), server.addr.to_string(), pool(1)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"x", client_addr).await.unwrap();

        eventually(|| client.session_count() == 1).await;
        let session = client.session_for(&peer.local_addr().unwrap()).unwrap();
        let mut state = session.links()[0].subscribe();
        tokio::time::timeout(STEP, state.wait_for(|s| *s == LinkState::Backoff))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.dispatcher.session_count().await, 0);

        client.stop().await;
        server.stop().await;
    }
}
