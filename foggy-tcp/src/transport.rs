//! The unreliable datagram transport the protocol runs over.
//!
//! Implementations deliver opaque byte payloads to and from addresses with no
//! guarantees: datagrams may be lost, duplicated, delayed or reordered.
//! [`crate::socket::UdpTransport`] is the production implementation and
//! [`crate::simulator::SimSocket`] the in-memory one used by tests.

use std::future::Future;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// No endpoint is reachable at this address (simulated networks only).
    #[error("no endpoint at {0}")]
    Unreachable(SocketAddr),
    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync + 'static {
    /// Hand one datagram to the network.
    fn send_datagram(
        &self,
        dest: SocketAddr,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next datagram, returning its source and payload.
    fn recv_datagram(
        &self,
    ) -> impl Future<Output = Result<(SocketAddr, Vec<u8>), TransportError>> + Send;

    fn local_addr(&self) -> SocketAddr;
}
