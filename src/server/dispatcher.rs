//! Per-session forwarding endpoints on the remote side
//!
//! Every session id owns one UDP socket connected to the destination and the
//! set of stream connections currently attached for it. Frames from any
//! attached connection go out as datagrams; datagrams from the destination go
//! back on one attached connection, chosen round-robin.

use crate::protocol::{SessionId, MAX_DATAGRAM_SIZE};
use crate::transport::BoxedStream;
use crate::tunnel::{read_frame_limited, write_frame, FramingError, TunnelError};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Real UDP destination, `host:port`
    pub destination: String,
    /// How long an endpoint without connections survives
    pub grace: Duration,
    /// Outbound queue capacity of each attached connection
    pub member_queue_capacity: usize,
    /// Largest inbound frame accepted
    pub max_frame_len: usize,
}

impl DispatcherConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            grace: Duration::from_secs(5),
            member_queue_capacity: 128,
            max_frame_len: MAX_DATAGRAM_SIZE,
        }
    }
}

/// Attached connections of one endpoint
#[derive(Default)]
struct Members {
    next_id: u64,
    conns: Vec<(u64, mpsc::Sender<Bytes>)>,
    cursor: usize,
    /// Bumped every time the set becomes empty
    epoch: u64,
}

impl Members {
    fn attach(&mut self, tx: mpsc::Sender<Bytes>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.conns.push((id, tx));
        id
    }

    /// Remove a member, returning the epoch if the set is now empty
    fn detach(&mut self, id: u64) -> Option<u64> {
        let pos = self.conns.iter().position(|(member, _)| *member == id)?;
        self.conns.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }

        if self.conns.is_empty() {
            self.cursor = 0;
            self.epoch += 1;
            Some(self.epoch)
        } else {
            None
        }
    }

    /// Hand the payload to exactly one member, starting at the cursor
    fn route(&mut self, mut payload: Bytes) -> bool {
        let n = self.conns.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            match self.conns[idx].1.try_send(payload) {
                Ok(()) => {
                    self.cursor = (idx + 1) % n;
                    return true;
                }
                Err(TrySendError::Full(p)) | Err(TrySendError::Closed(p)) => payload = p,
            }
        }
        false
    }
}

/// Bridge between one session id and the destination
struct ForwardingEndpoint {
    session_id: SessionId,
    socket: Arc<UdpSocket>,
    members: Arc<Mutex<Members>>,
    cancel: CancellationToken,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ForwardingEndpoint {
    async fn open(session_id: SessionId, target: SocketAddr) -> std::io::Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        let socket = Arc::new(socket);

        let members = Arc::new(Mutex::new(Members::default()));
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(distribute(
            session_id,
            Arc::clone(&socket),
            Arc::clone(&members),
            cancel.clone(),
        ));

        Ok(Self {
            session_id,
            socket,
            members,
            cancel,
            reader: tokio::sync::Mutex::new(Some(reader)),
        })
    }

    /// Stop the reader and release every member queue
    async fn close(&self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.lock().await.take() {
            let _ = reader.await;
        }
        self.members.lock().conns.clear();
        debug!("Forwarding endpoint for session {} closed", self.session_id);
    }
}

/// Spread datagrams from the destination across the attached connections
async fn distribute(
    session_id: SessionId,
    socket: Arc<UdpSocket>,
    members: Arc<Mutex<Members>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buf) => received,
        };

        match received {
            Ok(n) => {
                let payload = Bytes::copy_from_slice(&buf[..n]);
                if !members.lock().route(payload) {
                    trace!("Session {}: no connection accepted {} bytes, dropping", session_id, n);
                }
            }
            Err(e) => debug!("Session {}: destination receive error: {}", session_id, e),
        }
    }
}

type EndpointMap = Arc<tokio::sync::Mutex<HashMap<SessionId, Arc<ForwardingEndpoint>>>>;

/// Remote-side dispatcher
pub struct Dispatcher {
    config: DispatcherConfig,
    /// Destination address, resolved on first use
    target: OnceCell<SocketAddr>,
    endpoints: EndpointMap,
    shutdown: CancellationToken,
    timers: TaskTracker,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            target: OnceCell::new(),
            endpoints: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            timers: TaskTracker::new(),
        }
    }

    /// Serve one handshaken connection until it closes or `cancel` fires
    ///
    /// Connection loss is logged here and reported as `Ok`. Errors are
    /// returned only when the connection could not be attached.
    pub async fn serve(
        &self,
        session_id: SessionId,
        peer: SocketAddr,
        stream: BoxedStream,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let (endpoint, member, mut outbound) = self.attach(session_id).await?;
        debug!("Connection from {} attached to session {}", peer, session_id);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let ended = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            e = self.forward_out(&endpoint, &mut reader) => Some(e),
            e = forward_in(&mut outbound, &mut writer) => Some(e),
        };

        self.detach(&endpoint, member);

        let mut stream = reader.unsplit(writer);
        let _ = tokio::time::timeout(self.config.grace, stream.shutdown()).await;

        match ended {
            None => debug!("Connection from {} for session {} cancelled", peer, session_id),
            Some(TunnelError::Framing(FramingError::Closed)) => {
                debug!("Connection from {} for session {} closed", peer, session_id)
            }
            Some(e) => warn!("Connection from {} for session {} lost: {}", peer, session_id, e),
        }
        Ok(())
    }

    async fn attach(
        &self,
        session_id: SessionId,
    ) -> Result<(Arc<ForwardingEndpoint>, u64, mpsc::Receiver<Bytes>), TunnelError> {
        {
            let endpoints = self.endpoints.lock().await;
            if self.shutdown.is_cancelled() {
                return Err(TunnelError::Stopped);
            }
            if let Some(endpoint) = endpoints.get(&session_id) {
                return Ok(self.join(Arc::clone(endpoint)));
            }
        }

        // Socket setup happens without holding the map
        let target = self.target().await?;
        let opened = Arc::new(ForwardingEndpoint::open(session_id, target).await?);

        let mut endpoints = self.endpoints.lock().await;
        if self.shutdown.is_cancelled() {
            drop(endpoints);
            opened.close().await;
            return Err(TunnelError::Stopped);
        }
        let (endpoint, surplus) = match endpoints.entry(session_id) {
            Entry::Occupied(current) => (Arc::clone(current.get()), Some(opened)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&opened));
                info!(
                    "Forwarding endpoint for session {} opened towards {}",
                    session_id, target
                );
                (opened, None)
            }
        };
        let joined = self.join(endpoint);
        drop(endpoints);

        // Another connection for the same session opened one first
        if let Some(surplus) = surplus {
            surplus.close().await;
        }
        Ok(joined)
    }

    /// Add a member to `endpoint`; the endpoint map must be locked
    fn join(
        &self,
        endpoint: Arc<ForwardingEndpoint>,
    ) -> (Arc<ForwardingEndpoint>, u64, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(self.config.member_queue_capacity);
        let member = endpoint.members.lock().attach(tx);
        (endpoint, member, rx)
    }

    async fn target(&self) -> std::io::Result<SocketAddr> {
        let destination = &self.config.destination;
        let target = self
            .target
            .get_or_try_init(|| async move {
                tokio::net::lookup_host(destination.as_str())
                    .await?
                    .next()
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::AddrNotAvailable,
                            format!("{} did not resolve", destination),
                        )
                    })
            })
            .await?;
        Ok(*target)
    }

    fn detach(&self, endpoint: &Arc<ForwardingEndpoint>, member: u64) {
        let Some(epoch) = endpoint.members.lock().detach(member) else {
            return;
        };
        if self.shutdown.is_cancelled() {
            return;
        }

        debug!(
            "Session {} has no connections, tearing down in {:?}",
            endpoint.session_id, self.config.grace
        );

        let endpoints = Arc::clone(&self.endpoints);
        let endpoint = Arc::clone(endpoint);
        let shutdown = self.shutdown.clone();
        let grace = self.config.grace;
        self.timers.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }

            let mut map = endpoints.lock().await;
            let still_idle = match map.get(&endpoint.session_id) {
                Some(current) => {
                    let members = endpoint.members.lock();
                    Arc::ptr_eq(current, &endpoint) && members.conns.is_empty() && members.epoch == epoch
                }
                None => false,
            };
            if !still_idle {
                return;
            }
            map.remove(&endpoint.session_id);
            drop(map);

            endpoint.close().await;
            info!("Forwarding endpoint for session {} torn down", endpoint.session_id);
        });
    }

    async fn forward_out(
        &self,
        endpoint: &ForwardingEndpoint,
        reader: &mut ReadHalf<BoxedStream>,
    ) -> TunnelError {
        loop {
            let payload = match read_frame_limited(reader, self.config.max_frame_len).await {
                Ok(payload) => payload,
                Err(e) => return e.into(),
            };
            trace!(
                "Session {}: forwarding {} bytes to destination",
                endpoint.session_id,
                payload.len()
            );

            if let Err(e) = endpoint.socket.send(&payload).await {
                debug!("Session {}: destination send error: {}", endpoint.session_id, e);
            }
        }
    }

    /// Cancel grace timers, tear down every endpoint and wait for all of it
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.timers.close();
        self.timers.wait().await;

        let endpoints: Vec<_> = {
            let mut map = self.endpoints.lock().await;
            map.drain().map(|(_, endpoint)| endpoint).collect()
        };
        if !endpoints.is_empty() {
            debug!("Closing {} forwarding endpoints", endpoints.len());
        }
        join_all(endpoints.iter().map(|endpoint| endpoint.close())).await;
    }

    /// Number of live forwarding endpoints
    pub async fn session_count(&self) -> usize {
        self.endpoints.lock().await.len()
    }

    /// Number of connections attached for `session_id`
    pub async fn member_count(&self, session_id: &SessionId) -> usize {
        match self.endpoints.lock().await.get(session_id) {
            Some(endpoint) => endpoint.members.lock().conns.len(),
            None => 0,
        }
    }
}

/// Write datagrams routed to this connection until the queue closes
async fn forward_in(
    outbound: &mut mpsc::Receiver<Bytes>,
    writer: &mut WriteHalf<BoxedStream>,
) -> TunnelError {
    loop {
        let Some(payload) = outbound.recv().await else {
            return TunnelError::QueueClosed;
        };
        if let Err(e) = write_frame(writer, &payload).await {
            return e.into();
        }
    }
}
