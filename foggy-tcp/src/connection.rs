//! Application-facing connection handle.
//!
//! # Architecture
//!
//! ```text
//!  Application                         background tasks
//!      │ send / recv / close                ┌───────────────────────┐
//!      ▼                                    │ writer: drain outbox, │
//!  Connection ── Arc<Shared> ─────────────▶ │   hand to transport   │
//!                  ├── Mutex<Tcb>           ├───────────────────────┤
//!                  ├── io  (Notify)         │ reader: decode, feed  │
//!                  └── app (Notify)         │   Tcb::on_segment     │
//!                                           └───────────────────────┘
//! ```
//!
//! Every mutation of a connection (application call, inbound segment, timer
//! expiry) takes the per-connection lock, runs the synchronous [`Tcb`] logic
//! to completion and releases the lock before any I/O.  Afterwards it wakes
//! the writer (`io`) and anyone blocked in `recv` / `close` / `flush` (`app`).
//! Distinct connections share nothing, so they proceed in parallel.
//!
//! Active opens spawn their own reader.  Connections accepted by a
//! [`crate::listener::Listener`] are fed by the listener's demultiplexer.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::Config;
use crate::congestion::CongestionSnapshot;
use crate::error::{ConnError, Result};
use crate::segment::Segment;
use crate::state::ConnectionState;
use crate::tcb::{CloseProgress, ConnectionStats, Tcb, TimerEvent, TimerSink};
use crate::transport::Transport;

/// How [`Connection::recv_with`] waits for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait until at least one byte, end of stream or an error.
    Block,
    /// Return immediately, possibly with nothing.
    NoWait,
    /// Wait at most this long; an expiry yields an empty read.
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    tcb: Mutex<Tcb>,
    /// Wakes the writer task: the outbox may be non-empty.
    io: Notify,
    /// Wakes application waiters: state, buffers or windows changed.
    app: Notify,
}

impl Shared {
    pub(crate) fn new(config: Config, local: SocketAddr, remote: SocketAddr) -> Arc<Self> {
        let runtime = Handle::current();
        Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let sink: TimerSink = Arc::new(move |event: TimerEvent| {
                if let Some(shared) = weak.upgrade() {
                    shared.with(|tcb, now| tcb.on_timer(event, now));
                }
            });
            Shared {
                tcb: Mutex::new(Tcb::new(config, local, remote, runtime, sink)),
                io: Notify::new(),
                app: Notify::new(),
            }
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock, then wake the writer and every waiter.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Tcb, Instant) -> R) -> R {
        let result = {
            let mut tcb = self.lock();
            f(&mut tcb, Instant::now())
        };
        self.io.notify_one();
        self.app.notify_waiters();
        result
    }

    /// Feed one datagram from the peer.
    pub(crate) fn deliver(&self, bytes: &[u8]) {
        match Segment::decode(bytes) {
            Ok(seg) => self.with(|tcb, now| tcb.on_segment(seg, now)),
            Err(e) => {
                log::debug!("[conn] dropping undecodable datagram: {e}");
                self.lock().note_invalid();
            }
        }
    }

    /// Wait until `check` yields a value.  `check` runs under the lock and is
    /// re-evaluated after every state change.
    async fn wait_for<R>(&self, mut check: impl FnMut(&mut Tcb) -> Option<R>) -> R {
        loop {
            let notified = self.app.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut tcb = self.lock();
                check(&mut tcb)
            };
            if let Some(result) = ready {
                // `check` may have queued a window update.
                self.io.notify_one();
                return result;
            }
            notified.await;
        }
    }

    pub(crate) async fn closed(&self) {
        self.wait_for(|tcb| tcb.state().is_closed().then_some(()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Drain the outbox onto the transport until the connection closes.
pub(crate) async fn run_writer<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    remote: SocketAddr,
    config: Config,
) {
    loop {
        let (segments, closed) = {
            let mut tcb = shared.lock();
            (tcb.take_outbox(), tcb.state().is_closed())
        };
        for seg in segments {
            if let Err(e) = send_segment(&*transport, remote, &seg, &config).await {
                log::warn!("[conn] giving up on {remote}: {e}");
                shared.with(|tcb, _| tcb.transport_failed());
                break;
            }
        }
        if closed {
            log::trace!("[conn] writer for {remote} done");
            return;
        }
        shared.io.notified().await;
    }
}

/// Hand one segment to the transport, retrying transient failures.
pub(crate) async fn send_segment<T: Transport>(
    transport: &T,
    remote: SocketAddr,
    seg: &Segment,
    config: &Config,
) -> Result<()> {
    let bytes = match seg.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("[conn] cannot encode {seg}: {e}");
            return Ok(());
        }
    };
    let mut attempt = 0;
    loop {
        match transport.send_datagram(remote, &bytes).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 >= config.transport_retries => return Err(e.into()),
            Err(e) => {
                attempt += 1;
                log::debug!("[conn] send to {remote} failed ({e}); retry {attempt}");
                tokio::time::sleep(config.transport_retry_delay).await;
            }
        }
    }
}

/// Receive loop for an actively-opened connection.
async fn run_reader<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    remote: SocketAddr,
    config: Config,
) {
    let mut failures = 0;
    loop {
        tokio::select! {
            result = transport.recv_datagram() => match result {
                Ok((from, bytes)) if from == remote => {
                    failures = 0;
                    shared.deliver(&bytes);
                }
                Ok((from, _)) => log::trace!("[conn] ignoring datagram from stranger {from}"),
                Err(e) => {
                    failures += 1;
                    log::warn!("[conn] receive failed ({e}); attempt {failures}");
                    if failures >= config.transport_retries {
                        shared.with(|tcb, _| tcb.transport_failed());
                        return;
                    }
                    tokio::time::sleep(config.transport_retry_delay).await;
                }
            },
            _ = shared.closed() => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One reliable, ordered, bidirectional byte stream.
///
/// The handle is cheap to clone; clones refer to the same connection, so one
/// task may send while another receives.  Dropping the last clone of a
/// still-open connection starts an orderly close, as [`Connection::close`]
/// would; the background tasks exit once it reaches CLOSED.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
    local: SocketAddr,
    remote: SocketAddr,
}

/// Shared by every clone of one [`Connection`].
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.with(|tcb, now| {
            if !tcb.state().is_closed() {
                log::debug!("[conn] last handle dropped in {}; closing", tcb.state());
                tcb.close(now);
            }
        });
    }
}

impl Connection {
    /// Active open: handshake with `remote` over `transport`.
    ///
    /// Resolves once the connection is established.  Fails with
    /// [`ConnError::Timeout`] when the SYN retry budget runs out and with
    /// [`ConnError::Reset`] when the peer refuses.
    pub async fn open<T: Transport>(transport: T, remote: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(transport);
        let local = transport.local_addr();
        let shared = Shared::new(config.clone(), local, remote);

        tokio::spawn(run_writer(
            Arc::clone(&shared),
            Arc::clone(&transport),
            remote,
            config.clone(),
        ));
        tokio::spawn(run_reader(Arc::clone(&shared), transport, remote, config));

        shared.with(|tcb, now| tcb.open(now))?;
        let conn = Self::from_shared(shared, local, remote);
        conn.established().await?;
        Ok(conn)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>, local: SocketAddr, remote: SocketAddr) -> Self {
        let owner = Arc::new(Owner {
            shared: Arc::clone(&shared),
        });
        Self {
            shared,
            _owner: owner,
            local,
            remote,
        }
    }

    /// Wait for the handshake to finish.
    pub(crate) async fn established(&self) -> Result<()> {
        self.shared
            .wait_for(|tcb| match tcb.state() {
                ConnectionState::Closed { cause } => Some(Err(ConnError::from_cause(cause))),
                ConnectionState::Listen
                | ConnectionState::SynSent { .. }
                | ConnectionState::SynReceived { .. } => None,
                _ => Some(Ok(())),
            })
            .await
    }

    /// Enqueue as much of `bytes` as fits in the send buffer; never blocks.
    ///
    /// Returns the number of bytes accepted, possibly zero.
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        self.shared.with(|tcb, now| tcb.send(bytes, now))
    }

    /// Enqueue all of `bytes`, waiting for buffer space as needed.
    pub async fn send_all(&self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let n = self.send(bytes)?;
            bytes = &bytes[n..];
            if n == 0 {
                self.shared.wait_for(|tcb| tcb.writable().then_some(())).await;
            }
        }
        Ok(())
    }

    /// Wait until every enqueued byte has been acknowledged.
    pub async fn flush(&self) -> Result<()> {
        self.shared.wait_for(|tcb| tcb.flushed()).await
    }

    /// Blocking read of up to `max` bytes.  An empty result means the peer
    /// closed its direction and every byte has been read.
    pub async fn recv(&self, max: usize) -> Result<Vec<u8>> {
        self.recv_with(max, ReadMode::Block).await
    }

    /// Read up to `max` bytes, waiting as `mode` says.
    pub async fn recv_with(&self, max: usize, mode: ReadMode) -> Result<Vec<u8>> {
        match mode {
            ReadMode::NoWait => {
                let read = self.shared.with(|tcb, _| tcb.read(max))?;
                Ok(read.unwrap_or_default())
            }
            ReadMode::Block => self.shared.wait_for(|tcb| tcb.read(max).transpose()).await,
            ReadMode::Timeout(limit) => {
                let block = self.shared.wait_for(|tcb| tcb.read(max).transpose());
                tokio::time::timeout(limit, block)
                    .await
                    .unwrap_or_else(|_| Ok(Vec::new()))
            }
        }
    }

    /// Orderly shutdown of our direction.
    ///
    /// Buffered data is delivered first; resolves once our FIN is
    /// acknowledged.  Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let already_closed = self.shared.with(|tcb, now| {
            let closed = tcb.state().is_closed();
            tcb.close(now);
            closed
        });
        if already_closed {
            return Ok(());
        }
        self.shared
            .wait_for(|tcb| match tcb.close_progress() {
                CloseProgress::Pending => None,
                CloseProgress::Done => Some(Ok(())),
                CloseProgress::Failed(cause) => Some(Err(ConnError::from_cause(cause))),
            })
            .await
    }

    /// Drop the connection immediately and send an RST to the peer.
    pub fn abort(&self) {
        self.shared.with(|tcb, _| tcb.abort());
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.lock().stats()
    }

    pub fn congestion(&self) -> CongestionSnapshot {
        self.shared.lock().congestion()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.shared.lock().rto()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Wait until the connection reaches CLOSED for any reason.
    pub async fn closed(&self) {
        self.shared.closed().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
