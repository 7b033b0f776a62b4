//! Passive open: accept connections on one transport.
//!
//! ```text
//!                 ┌───────────────── dispatcher task ─────────────────┐
//!  transport ───▶ │ decode source addr ──▶ known peer?  ──yes──▶ Tcb  │
//!                 │                          │ no                     │
//!                 │                          ▼                        │
//!                 │            SYN? ──yes──▶ new Tcb (LISTEN)         │
//!                 │             │ no                                  │
//!                 │             ▼                                     │
//!                 │        reply RST                                  │
//!                 └───────────────────────────────────────────────────┘
//!                   established connections ──▶ accept queue ──▶ accept()
//! ```
//!
//! Connections share the listener's transport, so the [`Listener`] must
//! outlive the connections it accepted.  A connection leaves the
//! demultiplexing table as soon as it reaches CLOSED.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{run_writer, send_segment, Connection, Shared};
use crate::error::{ConnError, Result};
use crate::segment::{flags, Segment};
use crate::tcb::reset_for;
use crate::transport::Transport;

/// Established connections waiting for `accept`.
const ACCEPT_BACKLOG: usize = 64;

pub struct Listener {
    local: SocketAddr,
    accepted: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    tracked: Arc<AtomicUsize>,
    dispatcher: JoinHandle<()>,
}

impl Listener {
    /// Start accepting on `transport`.  Must be called inside a tokio runtime.
    pub fn bind<T: Transport>(transport: T, config: Config) -> Result<Self> {
        config.validate()?;
        let local = transport.local_addr();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let tracked = Arc::new(AtomicUsize::new(0));
        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::new(transport),
            config,
            tx,
            Arc::clone(&tracked),
        ));
        log::info!("[listener] listening on {local}");
        Ok(Self {
            local,
            accepted: tokio::sync::Mutex::new(rx),
            tracked,
            dispatcher,
        })
    }

    /// Wait for the next connection to complete its handshake.
    pub async fn accept(&self) -> Result<Connection> {
        self.accepted
            .lock()
            .await
            .recv()
            .await
            .ok_or(ConnError::Closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Connections not yet CLOSED, whether accepted, queued or still
    /// handshaking.
    pub fn connections(&self) -> usize {
        self.tracked.load(Ordering::Relaxed)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn run_dispatcher<T: Transport>(
    transport: Arc<T>,
    config: Config,
    accepted: mpsc::Sender<Connection>,
    tracked: Arc<AtomicUsize>,
) {
    let local = transport.local_addr();
    let mut peers: HashMap<SocketAddr, Arc<Shared>> = HashMap::new();
    let (finished_tx, mut finished) = mpsc::unbounded_channel::<Arc<Shared>>();
    let mut failures = 0;

    loop {
        let received = tokio::select! {
            Some(done) = finished.recv() => {
                peers.retain(|_, shared| !Arc::ptr_eq(shared, &done));
                tracked.store(peers.len(), Ordering::Relaxed);
                continue;
            }
            received = transport.recv_datagram() => received,
        };
        let (from, bytes) = match received {
            Ok(datagram) => {
                failures = 0;
                datagram
            }
            Err(e) => {
                failures += 1;
                log::warn!("[listener] receive failed ({e}); attempt {failures}");
                if failures >= config.transport_retries {
                    log::error!("[listener] {local} shutting down");
                    return;
                }
                tokio::time::sleep(config.transport_retry_delay).await;
                continue;
            }
        };

        let stale = peers
            .get(&from)
            .is_some_and(|shared| shared.lock().state().is_closed());
        if stale {
            peers.remove(&from);
            tracked.store(peers.len(), Ordering::Relaxed);
        }
        if let Some(shared) = peers.get(&from) {
            shared.deliver(&bytes);
            continue;
        }

        let seg = match Segment::decode(&bytes) {
            Ok(seg) => seg,
            Err(e) => {
                log::debug!("[listener] dropping undecodable datagram from {from}: {e}");
                continue;
            }
        };

        if seg.has(flags::SYN) && !seg.has(flags::ACK) {
            log::info!("[listener] {local} ← SYN from {from}");
            let shared = Shared::new(config.clone(), local, from);
            shared.with(|tcb, now| {
                tcb.listen();
                tcb.on_segment(seg, now);
            });
            tokio::spawn(run_writer(
                Arc::clone(&shared),
                Arc::clone(&transport),
                from,
                config.clone(),
            ));

            let conn = Connection::from_shared(Arc::clone(&shared), local, from);
            let accepted = accepted.clone();
            tokio::spawn(async move {
                if conn.established().await.is_ok() && accepted.send(conn).await.is_err() {
                    log::debug!("[listener] accept queue gone; dropping {from}");
                }
            });
            let finished_tx = finished_tx.clone();
            let watched = Arc::clone(&shared);
            tokio::spawn(async move {
                watched.closed().await;
                let _ = finished_tx.send(watched);
            });
            peers.insert(from, shared);
            tracked.store(peers.len(), Ordering::Relaxed);
        } else if let Some(rst) = reset_for(&seg) {
            log::debug!("[listener] {seg} from unknown {from}; RST");
            if let Err(e) = send_segment(&*transport, from, &rst, &config).await {
                log::debug!("[listener] RST to {from} failed: {e}");
            }
        }
    }
}
