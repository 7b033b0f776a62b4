//! Tunable protocol parameters.
//!
//! A [`Config`] is handed to [`crate::connection::Connection::open`] or
//! [`crate::listener::Listener::bind`] and copied into every connection.
//! Nothing here is read from files or the environment; the caller decides.

use std::time::Duration;

use thiserror::Error;

use crate::segment::MAX_PAYLOAD;

/// Adjustable protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes carried by one segment.
    pub mss: usize,
    /// Capacity of the outgoing byte buffer; `send` accepts at most this many
    /// unacknowledged bytes.
    pub send_buffer: usize,
    /// Capacity of the incoming reassembly buffer; bounds the advertised
    /// window, so it must fit in 16 bits.
    pub recv_buffer: usize,
    /// RTO used before the first RTT sample.
    pub initial_rto: Duration,
    /// Floor applied to every computed RTO.
    pub min_rto: Duration,
    /// Cap applied to the RTO after repeated back-off.
    pub max_rto: Duration,
    /// SYN / SYN-ACK retransmissions before the open fails.
    pub max_syn_retries: u32,
    /// Timeout retransmissions of one data segment before the connection fails.
    pub max_data_retries: u32,
    /// Identical ACKs that trigger a fast retransmit.
    pub dup_ack_threshold: u32,
    /// Initial congestion window, in segments.
    pub initial_cwnd_segments: u32,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this.
    pub msl: Duration,
    /// Attempts at handing one datagram to the transport before giving up.
    pub transport_retries: u32,
    /// Pause between transport send attempts.
    pub transport_retry_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1460,
            send_buffer: 1 << 20,
            recv_buffer: u16::MAX as usize,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(120),
            max_syn_retries: 6,
            max_data_retries: 8,
            dup_ack_threshold: 3,
            initial_cwnd_segments: 3,
            msl: Duration::from_secs(2),
            transport_retries: 3,
            transport_retry_delay: Duration::from_millis(10),
        }
    }
}

/// A [`Config`] field holds a value the protocol cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("mss must be between 1 and {max} bytes, got {got}")]
    Mss { got: usize, max: usize },
    #[error("recv_buffer must be between mss and 65535 bytes, got {0}")]
    RecvBuffer(usize),
    #[error("send_buffer must hold at least one segment, got {0}")]
    SendBuffer(usize),
    #[error("min_rto ({min:?}) must not exceed max_rto ({max:?})")]
    RtoBounds { min: Duration, max: Duration },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

impl Config {
    /// Reject parameter combinations that would break the protocol invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 || self.mss > MAX_PAYLOAD {
            return Err(ConfigError::Mss {
                got: self.mss,
                max: MAX_PAYLOAD,
            });
        }
        if self.recv_buffer < self.mss || self.recv_buffer > u16::MAX as usize {
            return Err(ConfigError::RecvBuffer(self.recv_buffer));
        }
        if self.send_buffer < self.mss {
            return Err(ConfigError::SendBuffer(self.send_buffer));
        }
        if self.min_rto > self.max_rto || self.min_rto.is_zero() {
            return Err(ConfigError::RtoBounds {
                min: self.min_rto,
                max: self.max_rto,
            });
        }
        if self.dup_ack_threshold == 0 {
            return Err(ConfigError::Zero("dup_ack_threshold"));
        }
        if self.initial_cwnd_segments == 0 {
            return Err(ConfigError::Zero("initial_cwnd_segments"));
        }
        if self.transport_retries == 0 {
            return Err(ConfigError::Zero("transport_retries"));
        }
        Ok(())
    }

    /// Duration of the TIME_WAIT state.
    pub fn time_wait(&self) -> Duration {
        self.msl * 2
    }
}
