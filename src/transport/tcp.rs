//! Raw TCP transport (for testing and internal networks)

use super::{connect_tcp, Acceptor, BoxedStream, Connector, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Plain TCP connector
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a new TCP connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let stream = connect_tcp(addr).await?;
        Ok(Box::new(stream))
    }
}

/// Plain TCP acceptor: hands the socket through unchanged
#[derive(Debug, Clone, Default)]
pub struct TcpAcceptor;

impl TcpAcceptor {
    /// Create a new TCP acceptor
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream, TransportError> {
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
