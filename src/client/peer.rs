//! Addressed send-back handle for one UDP peer

use crate::tunnel::DatagramSink;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::trace;

/// Last-activity timestamp of a peer
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    /// Start tracking from now
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last.lock())
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends datagrams back to one peer through the listener's socket
pub struct PeerHandle {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    activity: Arc<Activity>,
}

impl PeerHandle {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, activity: Arc<Activity>) -> Self {
        Self {
            socket,
            peer,
            activity,
        }
    }
}

#[async_trait]
impl DatagramSink for PeerHandle {
    async fn send(&self, payload: Bytes) -> std::io::Result<()> {
        self.activity.touch();
        self.socket.send_to(&payload, self.peer).await?;
        trace!("Sent {} bytes to {}", payload.len(), self.peer);
        Ok(())
    }
}
