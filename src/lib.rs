//! # UDP TLS Pool
//!
//! Carries UDP datagrams between two hosts over a pool of persistent TLS
//! streams. The local side accepts datagrams from UDP peers and spreads each
//! peer's traffic across several reconnecting streams; the remote side
//! reassembles every session's streams and forwards its datagrams to a fixed
//! UDP destination.
//!
//! ## Architecture
//!
//! ```text
//!  UDP peers                                                     destination
//!     │                                                               ▲
//!     ▼                                                               │
//! ┌─────────────┐    ┌─────────┐  N x TLS   ┌────────────────┐   ┌────────────┐
//! │ UdpListener │───▶│ Session │═══════════▶│ StreamListener │──▶│ Dispatcher │
//! │ (endpoints) │◀───│ (links) │◀═══════════│   (acceptor)   │◀──│ (per id)   │
//! └─────────────┘    └─────────┘            └────────────────┘   └────────────┘
//! ```
//!
//! Each stream opens with the 16-byte session id, then carries
//! length-prefixed frames, one datagram per frame, in both directions.

pub mod client;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
