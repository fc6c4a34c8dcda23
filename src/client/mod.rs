//! Local side: UDP endpoint table
//!
//! Binds one UDP socket, maps every peer address to a [`Session`] and expires
//! sessions that stay idle past the configured threshold.

mod peer;

pub use peer::{Activity, PeerHandle};

use crate::protocol::MAX_DATAGRAM_SIZE;
use crate::tunnel::{Session, SessionFactory};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Default idle threshold before a session is expired
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(120);

/// Default interval of the expiration scan
pub const DEFAULT_EXPIRE_TICK: Duration = Duration::from_secs(1);

/// UDP listener configuration
#[derive(Debug, Clone)]
pub struct UdpListenerConfig {
    /// Local bind address
    pub listen: String,
    /// Idle threshold
    pub expire: Duration,
    /// Expiration scan interval
    pub tick: Duration,
}

impl UdpListenerConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            expire: DEFAULT_EXPIRE,
            tick: DEFAULT_EXPIRE_TICK,
        }
    }
}

struct Entry {
    session: Arc<Session>,
    activity: Arc<Activity>,
}

/// Peer address to session map
struct SessionTable {
    factory: SessionFactory,
    entries: Mutex<HashMap<SocketAddr, Entry>>,
}

impl SessionTable {
    fn new(factory: SessionFactory) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up or create the peer's session, refresh its activity, queue the payload
    fn route(&self, socket: &Arc<UdpSocket>, peer: SocketAddr, payload: Bytes) -> Arc<Session> {
        let session = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(peer).or_insert_with(|| {
                let activity = Arc::new(Activity::new());
                let sink = PeerHandle::new(Arc::clone(socket), peer, Arc::clone(&activity));
                let session = Arc::new(self.factory.create(Arc::new(sink)));
                info!("New session {} for peer {}", session.id(), peer);
                Entry { session, activity }
            });
            entry.activity.touch();
            Arc::clone(&entry.session)
        };

        session.enqueue(payload);
        session
    }

    /// Remove every entry idle for strictly longer than `expire`
    fn take_expired(&self, expire: Duration) -> Vec<(SocketAddr, Arc<Session>)> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<SocketAddr> = entries
            .iter()
            .filter(|(_, entry)| entry.activity.idle_for(now) > expire)
            .map(|(addr, _)| *addr)
            .collect();

        expired
            .into_iter()
            .filter_map(|addr| entries.remove(&addr).map(|entry| (addr, entry.session)))
            .collect()
    }

    fn drain(&self) -> Vec<Arc<Session>> {
        self.entries
            .lock()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn get(&self, peer: &SocketAddr) -> Option<Arc<Session>> {
        self.entries.lock().get(peer).map(|entry| Arc::clone(&entry.session))
    }
}

/// Tasks and socket that only exist while the listener runs
struct Running {
    local_addr: SocketAddr,
    recv_cancel: CancellationToken,
    recv_task: JoinHandle<()>,
    expire_cancel: CancellationToken,
    expire_task: JoinHandle<()>,
    /// Stops of expired sessions still in progress
    retiring: TaskTracker,
}

/// UDP endpoint table
pub struct UdpListener {
    config: UdpListenerConfig,
    table: Arc<SessionTable>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl UdpListener {
    /// Create a stopped listener
    pub fn new(config: UdpListenerConfig, factory: SessionFactory) -> Self {
        Self {
            config,
            table: Arc::new(SessionTable::new(factory)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind the socket and start the receive and expiration tasks
    ///
    /// Returns the bound address. Starting a running listener is a no-op.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        let socket = Arc::new(UdpSocket::bind(&self.config.listen).await?);
        let local_addr = socket.local_addr()?;

        let recv_cancel = CancellationToken::new();
        let recv_task = tokio::spawn(recv_loop(
            socket,
            Arc::clone(&self.table),
            recv_cancel.clone(),
        ));

        let expire_cancel = CancellationToken::new();
        let retiring = TaskTracker::new();
        let expire_task = tokio::spawn(expire_loop(
            Arc::clone(&self.table),
            self.config.expire,
            self.config.tick,
            retiring.clone(),
            expire_cancel.clone(),
        ));

        info!("UDP listener ready on {}", local_addr);

        *running = Some(Running {
            local_addr,
            recv_cancel,
            recv_task,
            expire_cancel,
            expire_task,
            retiring,
        });
        Ok(local_addr)
    }

    /// Stop receiving, stop the expiration task, then stop every session
    ///
    /// Returns once every session and link has fully stopped. Stopping a
    /// stopped listener is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return;
        };

        r.recv_cancel.cancel();
        let _ = r.recv_task.await;

        r.expire_cancel.cancel();
        let _ = r.expire_task.await;

        let sessions = self.table.drain();
        debug!(
            "Stopping {} sessions, {} expired sessions still stopping",
            sessions.len(),
            r.retiring.len()
        );
        r.retiring.close();
        join_all(sessions.iter().map(|session| session.stop())).await;
        r.retiring.wait().await;

        info!("UDP listener on {} stopped", r.local_addr);
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Number of tracked peers
    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Session currently serving `peer`
    pub fn session_for(&self, peer: &SocketAddr) -> Option<Arc<Session>> {
        self.table.get(peer)
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, table: Arc<SessionTable>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((n, peer)) => {
                table.route(&socket, peer, Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms
                debug!("UDP receive error: {}", e);
            }
        }
    }
}

async fn expire_loop(
    table: Arc<SessionTable>,
    expire: Duration,
    tick: Duration,
    retiring: TaskTracker,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Stopped off the scan loop; `stop()` waits for the tracker
        for (peer, session) in table.take_expired(expire) {
            info!("Session {} for peer {} expired", session.id(), peer);
            retiring.spawn(async move { session.stop().await });
        }
    }
}
