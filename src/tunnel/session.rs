//! Client sessions: a pool of links sharing one outbound queue

use super::link::{Link, LinkContext};
use super::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_CAPACITY};
use crate::protocol::{SessionId, MAX_DATAGRAM_SIZE};
use crate::transport::Connector;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Destination for datagrams coming back through the tunnel
#[async_trait]
pub trait DatagramSink: Send + Sync {
    /// Deliver one datagram
    async fn send(&self, payload: Bytes) -> std::io::Result<()>;
}

/// Pool parameters shared by every session of a listener
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Links per session
    pub pool_size: usize,
    /// Capacity of the shared outbound queue
    pub queue_capacity: usize,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Pause between connect attempts
    pub backoff: Duration,
    /// Largest inbound frame accepted
    pub max_frame_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(4),
            backoff: Duration::from_secs(5),
            max_frame_len: MAX_DATAGRAM_SIZE,
        }
    }
}

/// One logical UDP peer's traffic
pub struct Session {
    id: SessionId,
    queue: flume::Sender<Bytes>,
    links: Vec<Link>,
}

impl Session {
    /// Create a session and start its full pool of links
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        id: SessionId,
        remote: impl Into<String>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn DatagramSink>,
        config: PoolConfig,
    ) -> Self {
        let (queue, rx) = flume::bounded(config.queue_capacity);
        let pool_size = config.pool_size;
        let ctx = Arc::new(LinkContext {
            session_id: id,
            remote: remote.into(),
            connector,
            sink,
            queue: rx,
            requeue: queue.clone(),
            config,
        });

        let links = (0..pool_size)
            .map(|index| Link::spawn(index, Arc::clone(&ctx)))
            .collect();

        debug!("Session {} started with {} links", id, pool_size);

        Self { id, queue, links }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a datagram for the pool
    ///
    /// Never blocks. Returns `false` when the queue is full and the payload
    /// was dropped.
    pub fn enqueue(&self, payload: Bytes) -> bool {
        match self.queue.try_send(payload) {
            Ok(()) => true,
            Err(_) => {
                trace!("Session {}: outbound queue full, dropping datagram", self.id);
                false
            }
        }
    }

    /// Number of datagrams waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Links of this session
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Stop every link concurrently and wait for all of them
    pub async fn stop(&self) {
        futures::future::join_all(self.links.iter().map(Link::stop)).await;
        debug!("Session {} stopped", self.id);
    }
}

/// Builds sessions for new UDP peers
#[derive(Clone)]
pub struct SessionFactory {
    remote: String,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
}

impl SessionFactory {
    /// Create a factory connecting every link to `remote`
    pub fn new(remote: impl Into<String>, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            remote: remote.into(),
            connector,
            config,
        }
    }

    /// Start a new session with a fresh identifier
    pub fn create(&self, sink: Arc<dyn DatagramSink>) -> Session {
        Session::spawn(
            SessionId::generate(),
            self.remote.clone(),
            Arc::clone(&self.connector),
            sink,
            self.config.clone(),
        )
    }
}
