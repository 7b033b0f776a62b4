//! UDP transport.
//!
//! [`UdpTransport`] is a thin wrapper around `tokio::net::UdpSocket`.  It
//! moves raw datagrams only; framing lives in [`crate::segment`] and all
//! protocol logic elsewhere.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::transport::{Transport, TransportError};

/// Largest datagram accepted on receive.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug)]
pub struct UdpTransport {
    /// Address this socket is bound to (with the OS-assigned port filled in).
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl UdpTransport {
    /// Bind to `local_addr`; `0.0.0.0:0` lets the OS pick an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, TransportError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }
}

impl Transport for UdpTransport {
    async fn send_datagram(&self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    async fn recv_datagram(&self) -> Result<(SocketAddr, Vec<u8>), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((addr, buf))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
