//! Tunnel layer - pooled reconnecting streams
//!
//! Provides:
//! - Frame encoding/decoding
//! - Links: one reconnecting stream slot each
//! - Sessions: a pool of links sharing one outbound queue

mod frame;
mod link;
mod session;

pub use frame::{
    encode_frame, read_frame, read_frame_limited, write_frame, FramingError, MAX_FRAME_LEN,
};
pub use link::{Link, LinkState};
pub use session::{DatagramSink, PoolConfig, Session, SessionFactory};

use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Outbound queue closed")]
    QueueClosed,

    #[error("Dispatcher stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default number of links per session
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Default capacity of a session's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
