//! Transport layer implementations
//!
//! Links open streams through a [`Connector`]; the stream listener wraps
//! accepted sockets through an [`Acceptor`]. Two backends:
//! - TCP (raw, for testing and trusted networks)
//! - TLS via rustls

mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use tcp::{TcpAcceptor, TcpConnector};

#[cfg(feature = "tls")]
pub use tls::{
    build_client_config, build_server_config, load_certs, load_private_key, TlsAcceptor,
    TlsConnector,
};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Byte stream usable by links and the dispatcher
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream produced by connectors and acceptors
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound streams for client links
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `addr` and complete any transport handshake
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError>;
}

/// Wraps accepted sockets on the server side
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Complete the transport handshake on an accepted socket
    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream, TransportError>;
}

/// Open a TCP connection with small-write coalescing disabled
pub(crate) async fn connect_tcp(addr: &str) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Disable Nagle's algorithm so small frames are flushed promptly
    stream.set_nodelay(true).ok();
    Ok(stream)
}
