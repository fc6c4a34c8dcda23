//! Wire protocol definitions and constants
//!
//! Every stream opened by a client link starts with the raw 16-byte session
//! identifier. After that both directions carry length-prefixed frames (see
//! [`crate::tunnel::encode_frame`]).
//!
//! ```text
//! handshake:  +------------------------------+
//!             |     Session ID (16 bytes)    |
//!             +------------------------------+
//! frame:      +--------+--------+--------+--------+
//!             |      Length (4B, big endian)      |
//!             +--------+--------+--------+--------+
//!             |      Payload (one datagram)       |
//!             +-----------------------------------+
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Handshake truncated: got {received} of {expected} bytes")]
    ShortHandshake { expected: usize, received: usize },

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the peer went away before the handshake completed
    pub fn is_reset(&self) -> bool {
        match self {
            ProtocolError::ShortHandshake { .. } => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            ProtocolError::InvalidSessionId(_) => false,
        }
    }
}

/// Length of the session identifier sent as handshake
pub const SESSION_ID_LEN: usize = 16;

/// Width of the frame length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Identifier naming one logical UDP flow across the tunnel
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap raw bytes received from the wire
    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes as sent on the wire
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        self.0.as_bytes()
    }
}

impl FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidSessionId(s.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.simple(), f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0.simple())
    }
}

/// Write the handshake (raw session id) on a freshly opened stream
pub async fn write_handshake<W>(writer: &mut W, id: &SessionId) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(id.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the handshake from an accepted stream
pub async fn read_handshake<R>(reader: &mut R) -> Result<SessionId, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; SESSION_ID_LEN];
    let mut filled = 0;
    while filled < SESSION_ID_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProtocolError::ShortHandshake {
                expected: SESSION_ID_LEN,
                received: filled,
            });
        }
        filled += n;
    }
    Ok(SessionId::from_bytes(buf))
}
