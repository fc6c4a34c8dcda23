//! Stream acceptor

use super::Dispatcher;
use crate::protocol::{read_handshake, SessionId};
use crate::transport::{Acceptor, BoxedStream};
use crate::tunnel::TunnelError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a new connection may take to finish TLS and send its session id
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Accepts pooled connections and hands them to the dispatcher
pub struct StreamListener {
    listen: String,
    acceptor: Arc<dyn Acceptor>,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl StreamListener {
    pub fn new(listen: impl Into<String>, acceptor: Arc<dyn Acceptor>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            listen: listen.into(),
            acceptor,
            dispatcher,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Override the handshake deadline
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        let listener = TcpListener::bind(&self.listen).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.acceptor),
            Arc::clone(&self.dispatcher),
            self.handshake_timeout,
            cancel.clone(),
        ));

        info!("Stream listener ready on {}", local_addr);
        *running = Some(Running {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Close the listening socket, then cancel and wait for every handler
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return;
        };

        r.cancel.cancel();
        if let Err(e) = r.task.await {
            log_join_error(e);
        }
        info!("Stream listener on {} stopped", r.local_addr);
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<dyn Acceptor>,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    log_join_error(e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    handlers.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&acceptor),
                        Arc::clone(&dispatcher),
                        handshake_timeout,
                        cancel.child_token(),
                    ));
                }
                Err(e) => error!("Accept error: {}", e),
            },
        }
    }

    // Nothing spawns handlers once the loop has exited
    drop(listener);
    debug!("Cancelling {} connection handlers", handlers.len());
    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            log_join_error(e);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Arc<dyn Acceptor>,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::timeout(handshake_timeout, prepare(stream, acceptor.as_ref()));
    let prepared = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        prepared = deadline => prepared,
    };

    let (stream, session_id) = match prepared {
        Ok(Ok(prepared)) => prepared,
        Err(_) => {
            warn!("Handshake from {} timed out after {:?}", peer, handshake_timeout);
            return;
        }
        Ok(Err(e)) => {
            log_prepare_error(peer, e);
            return;
        }
    };

    debug!("Connection from {} carries session {}", peer, session_id);
    if let Err(e) = dispatcher.serve(session_id, peer, stream, &cancel).await {
        error!("Connection from {} for session {} failed: {}", peer, session_id, e);
    }
}

fn log_prepare_error(peer: SocketAddr, e: TunnelError) {
    match e {
        TunnelError::Protocol(e) if e.is_reset() => {
            warn!("Handshake from {} failed: {}", peer, e);
        }
        TunnelError::Transport(e) => {
            warn!("Accepting connection from {} failed: {}", peer, e);
        }
        e => error!("Connection from {} failed before dispatch: {}", peer, e),
    }
}

/// Finish the transport handshake and read the session id
async fn prepare(stream: TcpStream, acceptor: &dyn Acceptor) -> Result<(BoxedStream, SessionId), TunnelError> {
    let mut stream = acceptor.accept(stream).await?;
    let session_id = read_handshake(&mut stream).await?;
    Ok((stream, session_id))
}

fn log_join_error(e: JoinError) {
    if e.is_panic() {
        error!("Connection handler panicked: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::write_handshake;
    use crate::server::DispatcherConfig;
    use crate::transport::TcpAcceptor;
    use crate::tunnel::{read_frame, write_frame};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    async fn setup() -> (UdpSocket, Arc<Dispatcher>, StreamListener, SocketAddr) {
        setup_with(DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    async fn setup_with(handshake_timeout: Duration) -> (UdpSocket, Arc<Dispatcher>, StreamListener, SocketAddr) {
        let dest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::new(
            dest.local_addr().unwrap().to_string(),
        )));
        let listener = StreamListener::new("127.0.0.1:0", Arc::new(TcpAcceptor::new()), Arc::clone(&dispatcher))
            .with_handshake_timeout(handshake_timeout);
        let addr = listener.start().await.unwrap();
        (dest, dispatcher, listener, addr)
    }

    #[tokio::test]
    async fn test_handshake_then_forward() {
        let (dest, dispatcher, listener, addr) = setup().await;
        let id = SessionId::generate();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        write_handshake(&mut conn, &id).await.unwrap();
        write_frame(&mut conn, b"\x01\x02").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = dest.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x01\x02");
        assert_eq!(dispatcher.member_count(&id).await, 1);

        dest.send_to(b"\x03\x04", from).await.unwrap();
        assert_eq!(&read_frame(&mut conn).await.unwrap()[..], b"\x03\x04");

        listener.stop().await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_short_handshake_dropped() {
        let (_dest, dispatcher, listener, addr) = setup().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[1, 2, 3]).await.unwrap();
        conn.shutdown().await.unwrap();

        // Server closes its side without attaching anything
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(dispatcher.session_count().await, 0);

        // Listener keeps serving
        let id = SessionId::generate();
        let mut good = TcpStream::connect(addr).await.unwrap();
        write_handshake(&mut good, &id).await.unwrap();
        while dispatcher.member_count(&id).await != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        listener.stop().await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        let (_dest, dispatcher, listener, addr) = setup_with(Duration::from_millis(200)).await;

        // Connect and send nothing; the server gives up on the handshake
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
            .await
            .expect("idle connection should be closed")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(dispatcher.session_count().await, 0);

        // A partial session id does not extend the deadline
        let mut slow = TcpStream::connect(addr).await.unwrap();
        slow.write_all(&[1, 2, 3, 4]).await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), slow.read_to_end(&mut rest))
            .await
            .expect("stalled handshake should be closed")
            .unwrap();
        assert_eq!(n, 0);

        listener.stop().await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_handlers() {
        let (_dest, dispatcher, listener, addr) = setup().await;
        let id = SessionId::generate();

        let mut conns = Vec::new();
        for _ in 0..3 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            write_handshake(&mut conn, &id).await.unwrap();
            conns.push(conn);
        }
        while dispatcher.member_count(&id).await != 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        listener.stop().await;
        assert_eq!(dispatcher.member_count(&id).await, 0);
        assert!(listener.local_addr().await.is_none());

        // Handlers closed their connections
        for conn in &mut conns {
            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).await.unwrap();
        }
        assert!(TcpStream::connect(addr).await.is_err());

        listener.stop().await;
        dispatcher.stop().await;
    }
}
