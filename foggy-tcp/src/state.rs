//! Connection finite-state machine (FSM) types.
//!
//! Transitions live in [`crate::tcb`]; this module only defines the states,
//! each carrying the data that is meaningful in that state alone.
//!
//! ```text
//!  CLOSED ──open──▶ SYN_SENT ──SYN-ACK──────────────▶ ESTABLISHED
//!  LISTEN ──SYN───▶ SYN_RECEIVED ──ACK──────────────▶ ESTABLISHED
//!
//!  ESTABLISHED ──close──▶ FIN_WAIT_1 ──ACK──▶ FIN_WAIT_2 ──FIN──▶ TIME_WAIT
//!                             │ FIN                                  │ 2×MSL
//!                             ▼                                      ▼
//!                          CLOSING ──────────ACK──────────▶ TIME_WAIT ─▶ CLOSED
//!
//!  ESTABLISHED ──FIN──▶ CLOSE_WAIT ──close──▶ LAST_ACK ──ACK──▶ CLOSED
//!
//!  any ──RST / retry budget exhausted / abort──▶ CLOSED
//! ```

use std::fmt;

/// Why a connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Never opened.
    NotOpened,
    /// Orderly FIN exchange finished.
    Graceful,
    /// Peer sent RST.
    Reset,
    /// Retransmission budget exhausted or the transport kept failing.
    TimedOut,
    /// Local abort.
    Aborted,
}

/// All states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed { cause: CloseCause },
    /// Passive side waiting for a SYN.
    Listen,
    /// SYN sent; waiting for SYN-ACK.
    SynSent { isn: u32, retries: u32 },
    /// SYN received and SYN-ACK sent; waiting for the final ACK.
    SynReceived { isn: u32, retries: u32 },
    Established,
    /// Our FIN is in flight.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Both FINs crossed; waiting for the ACK of ours.
    Closing,
    /// Final ACK sent; absorbing late duplicates for 2×MSL.
    TimeWait,
    /// Peer's FIN consumed; local close pending.
    CloseWait,
    /// Our FIN sent after the peer's; waiting for its ACK.
    LastAck,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Closed {
            cause: CloseCause::NotOpened,
        }
    }
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent { .. } => "SYN_SENT",
            Self::SynReceived { .. } => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::Closing => "CLOSING",
            Self::TimeWait => "TIME_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// The three-way handshake has completed (and the connection is not yet closed).
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            Self::Closed { .. } | Self::Listen | Self::SynSent { .. } | Self::SynReceived { .. }
        )
    }

    /// In-sequence payload is accepted from the peer.
    pub fn accepts_data(&self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::FinWait2 | Self::CloseWait
        )
    }

    /// The application may still enqueue outgoing bytes.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// Our FIN has been queued or sent.
    pub fn fin_sent(&self) -> bool {
        matches!(
            self,
            Self::FinWait1 | Self::FinWait2 | Self::Closing | Self::TimeWait | Self::LastAck
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_closed_not_opened() {
        assert_eq!(
            ConnectionState::default(),
            ConnectionState::Closed {
                cause: CloseCause::NotOpened
            }
        );
    }

    #[test]
    fn handshake_states_are_not_synchronized() {
        assert!(!ConnectionState::Listen.is_synchronized());
        assert!(!ConnectionState::SynSent { isn: 1, retries: 0 }.is_synchronized());
        assert!(ConnectionState::Established.is_synchronized());
        assert!(ConnectionState::TimeWait.is_synchronized());
    }

    #[test]
    fn data_accepted_only_while_peer_stream_is_open() {
        assert!(ConnectionState::Established.accepts_data());
        assert!(ConnectionState::FinWait2.accepts_data());
        assert!(!ConnectionState::TimeWait.accepts_data());
        assert!(!ConnectionState::LastAck.accepts_data());
    }

    #[test]
    fn display_uses_rfc_names() {
        assert_eq!(ConnectionState::FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(
            ConnectionState::SynReceived { isn: 0, retries: 0 }.to_string(),
            "SYN_RECEIVED"
        );
    }
}
