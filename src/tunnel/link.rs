//! Pooled reconnecting stream
//!
//! A link owns one connection slot of a session. It keeps reconnecting until
//! stopped:
//!
//! ```text
//! Idle -> Connecting -> Handshaking -> Streaming -> Backoff -> Connecting ...
//!                  \________________________________/
//!                        (connect error / timeout)
//! any state -> Stopping -> Stopped
//! ```
//!
//! While streaming, a send worker drains the session's shared queue into
//! frames and a receive worker hands decoded frames to the session's sink.
//! Whichever worker fails first ends the connection.

use super::frame::{read_frame_limited, write_frame};
use super::session::{DatagramSink, PoolConfig};
use super::TunnelError;
use crate::protocol::{write_handshake, SessionId};
use crate::transport::{BoxedStream, Connector};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, not yet started
    Idle,
    /// Opening the transport connection
    Connecting,
    /// Sending the session id
    Handshaking,
    /// Send/receive workers running
    Streaming,
    /// Waiting before the next connect attempt
    Backoff,
    /// Cancellation observed, releasing resources
    Stopping,
    /// Fully quiescent
    Stopped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything the links of one session share
pub(crate) struct LinkContext {
    pub(crate) session_id: SessionId,
    pub(crate) remote: String,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) sink: Arc<dyn DatagramSink>,
    pub(crate) queue: flume::Receiver<Bytes>,
    /// Used to offer back a payload whose write failed
    pub(crate) requeue: flume::Sender<Bytes>,
    pub(crate) config: PoolConfig,
}

/// One reconnecting connection slot
pub struct Link {
    index: usize,
    session_id: SessionId,
    cancel: CancellationToken,
    state_rx: watch::Receiver<LinkState>,
    attempts: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Spawn the link's connection loop on the current runtime
    pub(crate) fn spawn(index: usize, ctx: Arc<LinkContext>) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU64::new(0));
        let session_id = ctx.session_id;

        debug!("Link {} for session {} started", index, session_id);

        let runner = LinkRunner {
            index,
            ctx,
            cancel: cancel.clone(),
            state_tx,
            attempts: Arc::clone(&attempts),
        };
        let task = tokio::spawn(runner.run());

        Self {
            index,
            session_id,
            cancel,
            state_rx,
            attempts,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Number of connect attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Stop the link and wait until it is fully quiescent
    ///
    /// Safe to call repeatedly and concurrently; every caller returns only
    /// after the connection loop has exited.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(
                        "Link {} for session {} panicked: {}",
                        self.index, self.session_id, e
                    );
                }
            }
            debug!("Link {} for session {} stopped", self.index, self.session_id);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a streaming attempt ended
enum Outcome {
    Cancelled,
    Failed(TunnelError),
}

struct LinkRunner {
    index: usize,
    ctx: Arc<LinkContext>,
    cancel: CancellationToken,
    state_tx: watch::Sender<LinkState>,
    attempts: Arc<AtomicU64>,
}

impl LinkRunner {
    async fn run(self) {
        loop {
            self.set_state(LinkState::Connecting);
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let connect = tokio::time::timeout(
                self.ctx.config.connect_timeout,
                self.ctx.connector.connect(&self.ctx.remote),
            );
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = connect => result,
            };

            match result {
                Ok(Ok(stream)) => {
                    debug!(
                        "Link {} for session {} connected to {}",
                        self.index, self.ctx.session_id, self.ctx.remote
                    );
                    match self.serve(stream).await {
                        Outcome::Cancelled => break,
                        Outcome::Failed(e) => self.log_failure(&e),
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        "Link {} for session {}: connect to {} failed: {}",
                        self.index, self.ctx.session_id, self.ctx.remote, e
                    );
                }
                Err(_) => {
                    warn!(
                        "Link {} for session {}: connect to {} timed out after {:?}",
                        self.index, self.ctx.session_id, self.ctx.remote, self.ctx.config.connect_timeout
                    );
                }
            }

            self.set_state(LinkState::Backoff);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.backoff) => {}
            }
        }

        self.set_state(LinkState::Stopping);
        self.set_state(LinkState::Stopped);
    }

    /// Handshake, then stream until a worker fails or the link is cancelled
    async fn serve(&self, mut stream: BoxedStream) -> Outcome {
        self.set_state(LinkState::Handshaking);
        let handshake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = write_handshake(&mut stream, &self.ctx.session_id) => Some(result),
        };
        match handshake {
            None => {
                self.set_state(LinkState::Stopping);
                self.close(stream).await;
                return Outcome::Cancelled;
            }
            Some(Err(e)) => {
                self.close(stream).await;
                return Outcome::Failed(e.into());
            }
            Some(Ok(())) => {}
        }

        self.set_state(LinkState::Streaming);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut in_flight = None;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Outcome::Cancelled,
            e = self.send_worker(&mut writer, &mut in_flight) => Outcome::Failed(e),
            e = self.recv_worker(&mut reader) => Outcome::Failed(e),
        };

        // A payload whose write never completed goes back for another link
        if let Some(payload) = in_flight.take() {
            if self.ctx.requeue.try_send(payload).is_err() {
                trace!(
                    "Link {} for session {}: dropped payload after interrupted write",
                    self.index, self.ctx.session_id
                );
            }
        }

        if matches!(outcome, Outcome::Cancelled) {
            self.set_state(LinkState::Stopping);
        }
        self.close(reader.unsplit(writer)).await;
        outcome
    }

    /// Drain the shared queue into frames until a write fails
    ///
    /// The payload being written sits in `in_flight` until its frame is
    /// fully written, so the caller can requeue it whether the write failed
    /// or this future was dropped mid-write.
    async fn send_worker(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        in_flight: &mut Option<Bytes>,
    ) -> TunnelError {
        loop {
            let payload = match self.ctx.queue.recv_async().await {
                Ok(payload) => payload,
                Err(_) => return TunnelError::QueueClosed,
            };
            let len = payload.len();
            let payload = in_flight.insert(payload);

            if let Err(e) = write_frame(writer, payload).await {
                return e.into();
            }
            in_flight.take();

            trace!(
                "Link {} for session {}: sent frame of {} bytes",
                self.index, self.ctx.session_id, len
            );
        }
    }

    /// Hand decoded frames to the session's sink until a read fails
    async fn recv_worker(&self, reader: &mut ReadHalf<BoxedStream>) -> TunnelError {
        loop {
            let payload = match read_frame_limited(reader, self.ctx.config.max_frame_len).await {
                Ok(payload) => payload,
                Err(e) => return e.into(),
            };
            trace!(
                "Link {} for session {}: received frame of {} bytes",
                self.index,
                self.ctx.session_id,
                payload.len()
            );

            if let Err(e) = self.ctx.sink.send(payload).await {
                debug!(
                    "Link {} for session {}: delivering datagram failed: {}",
                    self.index, self.ctx.session_id, e
                );
            }
        }
    }

    async fn close(&self, mut stream: BoxedStream) {
        // Shutdown may block on an unresponsive peer
        let _ = tokio::time::timeout(self.ctx.config.connect_timeout, stream.shutdown()).await;
    }

    fn log_failure(&self, e: &TunnelError) {
        match e {
            TunnelError::Framing(f) if f.is_clean_close() => {
                debug!(
                    "Link {} for session {}: connection closed by peer",
                    self.index, self.ctx.session_id
                );
            }
            _ => {
                warn!(
                    "Link {} for session {}: connection lost: {}",
                    self.index, self.ctx.session_id, e
                );
            }
        }
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                "Link {} for session {}: {} -> {}",
                self.index, self.ctx.session_id, previous, state
            );
        }
    }
}
