//! In-memory network simulator for deterministic testing.
//!
//! Real networks drop, reorder, delay and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] hands out [`SimSocket`] transports that exchange datagrams
//! through tokio channels and apply a configurable fault model:
//!
//! | Fault            | Description                                        |
//! |------------------|----------------------------------------------------|
//! | Propagation      | Every datagram arrives `delay` after it departs.   |
//! | Bandwidth cap    | Datagrams serialise at `bw_limit` bytes/sec.       |
//! | Packet loss      | Drop a datagram with probability `loss_rate`.      |
//! | Reordering       | Hold a datagram back by `reorder_delay`, letting   |
//! |                  | later ones overtake it.                            |
//! | Duplication      | Deliver a datagram twice.                          |
//! | Drop filter      | Drop datagrams a test-supplied predicate selects.  |
//!
//! Faults are drawn from a seeded RNG so runs are reproducible.  Timing uses
//! `tokio::time`, so tests may run on paused virtual time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::segment::Segment;
use crate::transport::{Transport, TransportError};

type Datagram = (SocketAddr, Vec<u8>);

/// Predicate over `(source, destination, segment)`; `true` drops the datagram.
pub type DropFilter = Arc<dyn Fn(SocketAddr, SocketAddr, &Segment) -> bool + Send + Sync>;

/// Fault model.  All probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// One-way propagation delay.
    pub delay: Duration,
    /// Per-sender bandwidth cap in bytes per second (`None` = unlimited).
    pub bw_limit: Option<u64>,
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    /// Extra delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent, instantaneous pass-through.
        Self {
            delay: Duration::ZERO,
            bw_limit: None,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            seed: 0x5eed,
        }
    }
}

/// Counters for everything the network did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub filtered: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

struct Network {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    endpoints: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    filter: Mutex<Option<DropFilter>>,
    stats: Mutex<SimStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simulated network; cheap to clone.
#[derive(Clone)]
pub struct Simulator {
    network: Arc<Network>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            network: Arc::new(Network {
                config,
                rng: Mutex::new(rng),
                endpoints: Mutex::new(HashMap::new()),
                filter: Mutex::new(None),
                stats: Mutex::new(SimStats::default()),
            }),
        }
    }

    /// Attach an endpoint at `addr`.  Must be called inside a tokio runtime.
    pub fn bind(&self, addr: SocketAddr) -> Result<SimSocket, TransportError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        {
            let mut endpoints = lock(&self.network.endpoints);
            if endpoints.contains_key(&addr) {
                return Err(std::io::Error::from(std::io::ErrorKind::AddrInUse).into());
            }
            endpoints.insert(addr, inbox_tx);
        }

        // One in-order delivery queue per sender models a FIFO link.
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(Arc::clone(&self.network), link_rx));

        Ok(SimSocket {
            addr,
            network: Arc::clone(&self.network),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            link: link_tx,
            link_free_at: Mutex::new(Instant::now()),
        })
    }

    /// Install a drop filter, replacing any previous one.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(SocketAddr, SocketAddr, &Segment) -> bool + Send + Sync + 'static,
    {
        *lock(&self.network.filter) = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        *lock(&self.network.filter) = None;
    }

    pub fn stats(&self) -> SimStats {
        *lock(&self.network.stats)
    }
}

/// A datagram scheduled for delivery.
struct InFlight {
    arrival: Instant,
    from: SocketAddr,
    to: SocketAddr,
    bytes: Vec<u8>,
}

async fn run_link(network: Arc<Network>, mut queue: mpsc::UnboundedReceiver<InFlight>) {
    while let Some(datagram) = queue.recv().await {
        tokio::time::sleep_until(datagram.arrival).await;
        deliver(&network, datagram);
    }
}

fn deliver(network: &Network, datagram: InFlight) {
    let inbox = lock(&network.endpoints).get(&datagram.to).cloned();
    match inbox {
        Some(inbox) if inbox.send((datagram.from, datagram.bytes)).is_ok() => {
            lock(&network.stats).delivered += 1;
        }
        _ => log::trace!("[sim] {} vanished; datagram dropped", datagram.to),
    }
}

/// One endpoint on a [`Simulator`] network.
pub struct SimSocket {
    addr: SocketAddr,
    network: Arc<Network>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    link: mpsc::UnboundedSender<InFlight>,
    /// When the outgoing link finishes serialising what is already queued.
    link_free_at: Mutex<Instant>,
}

impl SimSocket {
    fn schedule(&self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        let network = &self.network;
        let config = &network.config;
        lock(&network.stats).sent += 1;

        let filter = lock(&network.filter).clone();
        if let Some(filter) = filter {
            if let Ok(segment) = Segment::decode(bytes) {
                if filter(self.addr, dest, &segment) {
                    log::debug!("[sim] filtered {} -> {dest}: {segment}", self.addr);
                    lock(&network.stats).filtered += 1;
                    return Ok(());
                }
            }
        }

        let (lost, duplicated, reordered) = {
            let mut rng = lock(&network.rng);
            (
                rng.gen_bool(config.loss_rate.clamp(0.0, 1.0)),
                rng.gen_bool(config.duplicate_rate.clamp(0.0, 1.0)),
                rng.gen_bool(config.reorder_rate.clamp(0.0, 1.0)),
            )
        };
        if lost {
            lock(&network.stats).lost += 1;
            return Ok(());
        }

        let departure = {
            let mut free_at = lock(&self.link_free_at);
            let start = (*free_at).max(Instant::now());
            let serialisation = match config.bw_limit {
                Some(bps) if bps > 0 => {
                    Duration::from_secs_f64(bytes.len() as f64 / bps as f64)
                }
                _ => Duration::ZERO,
            };
            *free_at = start + serialisation;
            *free_at
        };
        let arrival = departure + config.delay;

        let datagram = |arrival| InFlight {
            arrival,
            from: self.addr,
            to: dest,
            bytes: bytes.to_vec(),
        };

        if reordered {
            lock(&network.stats).reordered += 1;
            let late = datagram(arrival + config.reorder_delay);
            let network = Arc::clone(network);
            tokio::spawn(async move {
                tokio::time::sleep_until(late.arrival).await;
                deliver(&network, late);
            });
        } else {
            self.link
                .send(datagram(arrival))
                .map_err(|_| TransportError::Closed)?;
        }
        if duplicated {
            lock(&network.stats).duplicated += 1;
            self.link
                .send(datagram(arrival))
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }
}

impl Transport for SimSocket {
    async fn send_datagram(&self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        if !lock(&self.network.endpoints).contains_key(&dest) {
            return Err(TransportError::Unreachable(dest));
        }
        self.schedule(dest, bytes)
    }

    async fn recv_datagram(&self) -> Result<(SocketAddr, Vec<u8>), TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        lock(&self.network.endpoints).remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::flags;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn datagram(seq: u32) -> Vec<u8> {
        Segment::control(seq, 0, flags::ACK, 0).encode().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order_after_delay() {
        let sim = Simulator::new(SimulatorConfig {
            delay: Duration::from_millis(10),
            ..SimulatorConfig::default()
        });
        let a = sim.bind(addr(1)).unwrap();
        let b = sim.bind(addr(2)).unwrap();

        let start = Instant::now();
        for seq in 0..5 {
            a.send_datagram(addr(2), &datagram(seq)).await.unwrap();
        }
        for seq in 0..5 {
            let (from, bytes) = b.recv_datagram().await.unwrap();
            assert_eq!(from, addr(1));
            assert_eq!(Segment::decode(&bytes).unwrap().header.seq, seq);
        }
        assert_eq!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_cap_serialises_datagrams() {
        let sim = Simulator::new(SimulatorConfig {
            bw_limit: Some(1_000),
            ..SimulatorConfig::default()
        });
        let a = sim.bind(addr(1)).unwrap();
        let b = sim.bind(addr(2)).unwrap();

        let start = Instant::now();
        a.send_datagram(addr(2), &[0u8; 100]).await.unwrap();
        a.send_datagram(addr(2), &[0u8; 100]).await.unwrap();
        b.recv_datagram().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        b.recv_datagram().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn filter_drops_selected_segments() {
        let sim = Simulator::new(SimulatorConfig::default());
        let a = sim.bind(addr(1)).unwrap();
        let b = sim.bind(addr(2)).unwrap();
        sim.set_filter(|_, _, seg| seg.header.seq == 1);

        for seq in 0..3 {
            a.send_datagram(addr(2), &datagram(seq)).await.unwrap();
        }
        let (_, first) = b.recv_datagram().await.unwrap();
        let (_, second) = b.recv_datagram().await.unwrap();
        assert_eq!(Segment::decode(&first).unwrap().header.seq, 0);
        assert_eq!(Segment::decode(&second).unwrap().header.seq, 2);
        assert_eq!(sim.stats().filtered, 1);

        sim.clear_filter();
        a.send_datagram(addr(2), &datagram(1)).await.unwrap();
        let (_, third) = b.recv_datagram().await.unwrap();
        assert_eq!(Segment::decode(&third).unwrap().header.seq, 1);
        assert_eq!(sim.stats().filtered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn total_loss_delivers_nothing() {
        let sim = Simulator::new(SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        });
        let a = sim.bind(addr(1)).unwrap();
        let _b = sim.bind(addr(2)).unwrap();
        for seq in 0..10 {
            a.send_datagram(addr(2), &datagram(seq)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = sim.stats();
        assert_eq!(stats.lost, 10);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbound_destination_is_unreachable() {
        let sim = Simulator::new(SimulatorConfig::default());
        let a = sim.bind(addr(1)).unwrap();
        assert!(matches!(
            a.send_datagram(addr(9), b"x").await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(sim.bind(addr(1)).is_err());
    }
}
