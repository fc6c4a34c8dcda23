//! Configuration management

use crate::client::UdpListenerConfig;
use crate::server::DispatcherConfig;
use crate::tunnel::PoolConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Serialize to TOML text
    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Stream listen address
    pub listen: String,
    /// UDP destination, `host:port`
    pub destination: String,
    /// TLS certificate chain (PEM)
    pub tls_cert: Option<String>,
    /// TLS private key (PEM)
    pub tls_key: Option<String>,
    /// CA bundle for client certificates (PEM); enables mutual TLS
    pub tls_client_ca: Option<String>,
    /// Accept plain TCP instead of TLS
    pub insecure_plain_tcp: bool,
    /// Seconds a new connection has to finish TLS and send its session id
    pub handshake_timeout: f64,
    /// Seconds an endpoint without connections is kept
    pub grace: f64,
    /// Outbound queue capacity per attached connection
    pub member_queue_capacity: usize,
    /// Largest inbound frame accepted
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            destination: "127.0.0.1:51820".to_string(),
            tls_cert: None,
            tls_key: None,
            tls_client_ca: None,
            insecure_plain_tcp: false,
            handshake_timeout: 10.0,
            grace: 5.0,
            member_queue_capacity: 128,
            max_frame_len: crate::protocol::MAX_DATAGRAM_SIZE,
        }
    }
}

impl ServerConfig {
    /// Check values before anything is bound
    pub fn validate(&self) -> Result<(), crate::Error> {
        parse_socket_addr("server.listen", &self.listen)?;
        check_host_port("server.destination", &self.destination)?;
        check_seconds("server.handshake_timeout", self.handshake_timeout)?;
        check_seconds("server.grace", self.grace)?;
        check_positive("server.member_queue_capacity", self.member_queue_capacity)?;
        check_positive("server.max_frame_len", self.max_frame_len)?;

        if !self.insecure_plain_tcp && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(crate::Error::Config(
                "server.tls_cert and server.tls_key are required unless insecure_plain_tcp is set"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            destination: self.destination.clone(),
            grace: Duration::from_secs_f64(self.grace),
            member_queue_capacity: self.member_queue_capacity,
            max_frame_len: self.max_frame_len,
        }
    }

    /// Deadline for TLS plus the session id on a new connection
    pub fn handshake_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_timeout)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local UDP listen address
    pub listen: String,
    /// Remote stream endpoint, `host:port`
    pub server: String,
    /// Name to verify the server certificate against (defaults to the host of `server`)
    pub tls_server_name: Option<String>,
    /// CA bundle trusted for the server (PEM); web PKI roots when unset
    pub tls_ca: Option<String>,
    /// Client certificate chain for mutual TLS (PEM)
    pub tls_cert: Option<String>,
    /// Client private key for mutual TLS (PEM)
    pub tls_key: Option<String>,
    /// Connect with plain TCP instead of TLS
    pub insecure_plain_tcp: bool,
    /// Links per session
    pub pool_size: usize,
    /// Outbound queue capacity per session
    pub queue_capacity: usize,
    /// Seconds of inactivity before a session is expired
    pub expire: f64,
    /// Seconds allowed for one connect attempt
    pub connect_timeout: f64,
    /// Seconds between connect attempts
    pub backoff: f64,
    /// Largest inbound frame accepted
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8443".to_string(),
            server: "127.0.0.1:8443".to_string(),
            tls_server_name: None,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            insecure_plain_tcp: false,
            pool_size: crate::tunnel::DEFAULT_POOL_SIZE,
            queue_capacity: crate::tunnel::DEFAULT_QUEUE_CAPACITY,
            expire: 120.0,
            connect_timeout: 4.0,
            backoff: 5.0,
            max_frame_len: crate::protocol::MAX_DATAGRAM_SIZE,
        }
    }
}

impl ClientConfig {
    /// Check values before anything is bound
    pub fn validate(&self) -> Result<(), crate::Error> {
        parse_socket_addr("client.listen", &self.listen)?;
        check_host_port("client.server", &self.server)?;
        check_positive("client.pool_size", self.pool_size)?;
        check_positive("client.queue_capacity", self.queue_capacity)?;
        check_positive("client.max_frame_len", self.max_frame_len)?;
        check_seconds("client.expire", self.expire)?;
        check_seconds("client.connect_timeout", self.connect_timeout)?;
        check_seconds("client.backoff", self.backoff)?;

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(crate::Error::Config(
                "client.tls_cert and client.tls_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            queue_capacity: self.queue_capacity,
            connect_timeout: Duration::from_secs_f64(self.connect_timeout),
            backoff: Duration::from_secs_f64(self.backoff),
            max_frame_len: self.max_frame_len,
        }
    }

    pub fn listener_config(&self) -> UdpListenerConfig {
        UdpListenerConfig {
            expire: Duration::from_secs_f64(self.expire),
            ..UdpListenerConfig::new(self.listen.clone())
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig {
            tls_cert: Some("server.crt".to_string()),
            tls_key: Some("server.key".to_string()),
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            server: "tunnel.example.com:8443".to_string(),
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}

fn parse_socket_addr(field: &str, value: &str) -> Result<SocketAddr, crate::Error> {
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}: invalid address {:?}: {}", field, value, e)))
}

fn check_host_port(field: &str, value: &str) -> Result<(), crate::Error> {
    let valid = match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(crate::Error::Config(format!(
            "{}: expected host:port, got {:?}",
            field, value
        )))
    }
}

fn check_seconds(field: &str, value: f64) -> Result<(), crate::Error> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(crate::Error::Config(format!(
            "{}: must be a positive number of seconds, got {}",
            field, value
        )))
    }
}

fn check_positive(field: &str, value: usize) -> Result<(), crate::Error> {
    if value > 0 {
        Ok(())
    } else {
        Err(crate::Error::Config(format!("{}: must be greater than zero", field)))
    }
}
