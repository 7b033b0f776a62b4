//! Application-visible errors.
//!
//! Segment-level anomalies (duplicates, reordering, bad checksums) are
//! absorbed inside the protocol and never appear here; only connection
//! lifecycle failures do.

use thiserror::Error;

use crate::config::ConfigError;
use crate::state::CloseCause;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ConnError {
    /// Handshake or data retransmission exhausted its retry budget, or the
    /// transport kept failing.
    #[error("connection timed out")]
    Timeout,
    /// Peer sent RST.
    #[error("connection reset by peer")]
    Reset,
    /// Connection was aborted locally.
    #[error("connection aborted")]
    Aborted,
    /// Writing after close, or reading/writing a connection that never opened.
    #[error("connection closed")]
    Closed,
    /// The operation is not meaningful in the connection's current state.
    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),
    /// Binding or polling the underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ConnError {
    /// The error a caller observes on a connection that closed for `cause`.
    pub(crate) fn from_cause(cause: CloseCause) -> Self {
        match cause {
            CloseCause::Reset => Self::Reset,
            CloseCause::TimedOut => Self::Timeout,
            CloseCause::Aborted => Self::Aborted,
            CloseCause::Graceful | CloseCause::NotOpened => Self::Closed,
        }
    }
}

pub type Result<T, E = ConnError> = std::result::Result<T, E>;
