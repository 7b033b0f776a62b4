//! `foggy-tcp`: a reliable, ordered, connection-oriented byte stream over
//! an unreliable datagram transport (UDP or an in-memory simulator).
//!
//! # Architecture
//!
//! ```text
//!  Application ── Connection / Listener ─────────────── async handles
//!                      │
//!                 Mutex<Tcb>  ── state machine, one per connection
//!                 ├── SendWindow ── retransmit queue, dup ACKs ── CongestionController
//!                 ├── ReceiveWindow ── reassembly, advertised window
//!                 ├── RttEstimator ── SRTT / RTTVAR / RTO
//!                 └── Timer × 2 ── retransmit, TIME_WAIT linger
//!                      │ outbox
//!                 writer / reader tasks
//!                      │ raw datagrams (Segment codec)
//!                 Transport ── UdpTransport | SimSocket
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]      : wire format (encode / decode, checksum)
//! - [`seq`]          : wrap-around sequence-number arithmetic
//! - [`config`]       : tunable protocol parameters
//! - [`error`]        : application-visible errors
//! - [`timer`]        : cancellable single-shot timers
//! - [`rtt`]          : RTT estimation and retransmission timeout
//! - [`congestion`]   : slow start, congestion avoidance, loss reaction
//! - [`send_window`]  : outgoing buffer and retransmission queue
//! - [`recv_window`]  : reassembly and flow control
//! - [`state`]        : finite-state-machine types
//! - [`tcb`]          : per-connection protocol logic
//! - [`connection`]   : async connection handle and I/O tasks
//! - [`listener`]     : passive open and demultiplexing
//! - [`transport`]    : datagram transport abstraction
//! - [`socket`]       : UDP transport
//! - [`simulator`]    : lossy / reordering in-memory network for testing

pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod listener;
pub mod recv_window;
pub mod rtt;
pub mod segment;
pub mod send_window;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod tcb;
pub mod timer;
pub mod transport;

pub use config::Config;
pub use congestion::{CongestionSnapshot, Phase};
pub use connection::{Connection, ReadMode};
pub use error::{ConnError, Result};
pub use listener::Listener;
pub use simulator::{SimSocket, SimStats, Simulator, SimulatorConfig};
pub use socket::UdpTransport;
pub use state::{CloseCause, ConnectionState};
pub use tcb::ConnectionStats;
pub use transport::{Transport, TransportError};
