//! TLS transport
//!
//! Wraps link connections in TLS using rustls. The TLS contexts themselves
//! are built by the binaries from PEM files (see [`build_client_config`] and
//! [`build_server_config`]); connectors and acceptors only consume them.

use super::{connect_tcp, Acceptor, BoxedStream, Connector, TransportError};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;

/// TLS connector for client links
#[derive(Clone)]
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl TlsConnector {
    /// Create a connector from a client TLS context
    ///
    /// When `server_name` is `None` the host part of the connect address is
    /// used for SNI and certificate verification.
    pub fn new(
        config: Arc<ClientConfig>,
        server_name: Option<&str>,
    ) -> Result<Self, TransportError> {
        let server_name = server_name.map(parse_server_name).transpose()?;
        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(config),
            server_name,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let server_name = match &self.server_name {
            Some(name) => name.clone(),
            None => parse_server_name(host_of(addr))?,
        };

        let tcp_stream = connect_tcp(addr).await?;
        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }
}

/// TLS acceptor for the stream listener
#[derive(Clone)]
pub struct TlsAcceptor {
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Create an acceptor from a server TLS context
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: tokio_rustls::TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl Acceptor for TlsAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream, TransportError> {
        stream.set_nodelay(true).ok();
        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Box::new(tls_stream))
    }
}

/// Build the client TLS context
///
/// Trusts `ca` exclusively when given, the webpki root set otherwise.
/// `identity` enables client certificate authentication.
pub fn build_client_config(
    ca: Option<&Path>,
    identity: Option<(&Path, &Path)>,
) -> Result<ClientConfig, TransportError> {
    let roots = match ca {
        Some(path) => root_store(path)?,
        None => RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        },
    };

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match identity {
        Some((cert, key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| TransportError::Tls(e.to_string())),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Build the server TLS context
///
/// `client_ca` turns on mandatory client certificate verification.
pub fn build_server_config(
    cert: &Path,
    key: &Path,
    client_ca: Option<&Path>,
) -> Result<ServerConfig, TransportError> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let builder = ServerConfig::builder();
    let builder = match client_ca {
        Some(path) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(path)?))
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Load TLS certificate chain from PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut file).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load TLS private key from PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)?.ok_or_else(|| {
        TransportError::Tls(format!("No private key found in {}", path.display()))
    })
}

fn root_store(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }
    Ok(roots)
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TransportError::Tls(format!("Invalid server name '{}': {}", name, e)))
}

/// Host part of a `host:port` address, without IPv6 brackets
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
