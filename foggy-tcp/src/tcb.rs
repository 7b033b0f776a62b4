//! Transmission control block: the per-connection protocol state machine.
//!
//! A [`Tcb`] is pure protocol logic.  It never touches a socket and never
//! awaits; every entry point takes the current time and runs to completion
//! under the connection lock:
//!
//! ```text
//!   inbound segment ──▶ on_segment ─┐
//!   timer expiry    ──▶ on_timer   ─┼──▶ state transitions ──▶ outbox ──▶ writer task
//!   application     ──▶ send/read/ ─┘         │
//!                       close/abort           └──▶ timers (re)armed
//! ```
//!
//! Segments to transmit accumulate in an outbox that the connection's writer
//! task drains.  Timer callbacks are routed back through a [`TimerSink`] so
//! that expiry handling also runs under the lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::Config;
use crate::congestion::{CongestionController, CongestionSnapshot};
use crate::error::{ConnError, Result};
use crate::recv_window::{ReceiveWindow, SegmentOutcome};
use crate::rtt::RttEstimator;
use crate::segment::{flags, Header, Segment};
use crate::send_window::{AckOutcome, SendWindow, TimeoutAction, Transmit};
use crate::seq;
use crate::state::{CloseCause, ConnectionState};
use crate::timer::{Timer, TimerToken};

/// Which timer fired, plus what it was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Handshake or data retransmission.  `target` is the oldest unacked
    /// sequence number when the timer was armed (`None` for handshake and
    /// zero-window probes).
    Retransmit {
        token: TimerToken,
        target: Option<u32>,
    },
    /// TIME_WAIT expiry.
    Linger { token: TimerToken },
}

/// Where timer expiries are delivered.
pub type TimerSink = Arc<dyn Fn(TimerEvent) + Send + Sync>;

/// Running counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub segments_sent: u64,
    pub segments_received: u64,
    /// Payload bytes sent for the first time.
    pub bytes_sent: u64,
    /// Payload bytes delivered in order to the receive buffer.
    pub bytes_received: u64,
    /// Every resend, whatever triggered it.
    pub retransmits: u64,
    pub fast_retransmits: u64,
    /// Retransmission-timer expiries that resent data.
    pub timeout_losses: u64,
    pub dup_acks_received: u64,
    pub window_probes: u64,
    /// Datagrams that failed to decode.
    pub invalid_segments: u64,
    /// Smallest congestion window observed.
    pub min_cwnd: u32,
}

/// How far a local close has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseProgress {
    /// Our FIN is still unsent or unacknowledged.
    Pending,
    /// Our FIN is acknowledged (or the connection already finished).
    Done,
    /// The connection failed before the FIN was acknowledged.
    Failed(CloseCause),
}

/// The RST answering `seg`, or `None` if `seg` is itself an RST.
pub(crate) fn reset_for(seg: &Segment) -> Option<Segment> {
    if seg.has(flags::RST) {
        return None;
    }
    Some(if seg.has(flags::ACK) {
        Segment::control(seg.header.ack, 0, flags::RST, 0)
    } else {
        let ack = seg.header.seq.wrapping_add(seg.seq_len());
        Segment::control(0, ack, flags::RST | flags::ACK, 0)
    })
}

pub(crate) struct Tcb {
    config: Config,
    local: SocketAddr,
    remote: SocketAddr,
    state: ConnectionState,
    send: SendWindow,
    recv: ReceiveWindow,
    rtt: RttEstimator,
    cc: CongestionController,
    retransmit: Timer,
    linger: Timer,
    sink: TimerSink,
    /// When the current SYN / SYN-ACK was first sent.
    handshake_sent_at: Option<Instant>,
    outbox: Vec<Segment>,
    stats: ConnectionStats,
}

impl Tcb {
    pub(crate) fn new(
        config: Config,
        local: SocketAddr,
        remote: SocketAddr,
        runtime: Handle,
        sink: TimerSink,
    ) -> Self {
        let cc = CongestionController::new(config.mss as u32, config.initial_cwnd_segments);
        let stats = ConnectionStats {
            min_cwnd: cc.min_window(),
            ..ConnectionStats::default()
        };
        Self {
            send: SendWindow::new(
                0,
                config.send_buffer,
                config.dup_ack_threshold,
                config.max_data_retries,
            ),
            recv: ReceiveWindow::new(0, config.recv_buffer),
            rtt: RttEstimator::new(&config),
            cc,
            retransmit: Timer::new(runtime.clone()),
            linger: Timer::new(runtime),
            sink,
            handshake_sent_at: None,
            outbox: Vec::new(),
            stats,
            state: ConnectionState::default(),
            config,
            local,
            remote,
        }
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Active open: send a SYN with a random ISN.
    pub(crate) fn open(&mut self, now: Instant) -> Result<()> {
        if self.state != ConnectionState::default() {
            return Err(ConnError::InvalidState(self.state.name()));
        }
        let isn: u32 = rand::random();
        self.send = self.new_send_window(isn);
        self.state = ConnectionState::SynSent { isn, retries: 0 };
        log::info!("[tcb] {} → {} SYN_SENT isn={isn}", self.local, self.remote);
        self.send_syn(isn, now);
        Ok(())
    }

    /// Passive open: wait for the peer's SYN.
    pub(crate) fn listen(&mut self) {
        self.state = ConnectionState::Listen;
    }

    fn new_send_window(&self, isn: u32) -> SendWindow {
        SendWindow::new(
            isn.wrapping_add(1),
            self.config.send_buffer,
            self.config.dup_ack_threshold,
            self.config.max_data_retries,
        )
    }

    fn send_syn(&mut self, isn: u32, now: Instant) {
        let seg = Segment::control(isn, 0, flags::SYN, self.recv.window());
        self.push(seg);
        self.handshake_sent_at = Some(now);
        self.arm_retransmit(None);
    }

    fn send_syn_ack(&mut self, isn: u32, now: Instant) {
        let seg = Segment::control(
            isn,
            self.recv.ack_number(),
            flags::SYN | flags::ACK,
            self.recv.window(),
        );
        self.push(seg);
        self.handshake_sent_at = Some(now);
        self.arm_retransmit(None);
    }

    /// Handshake done: sample RTT unless the SYN was resent, then go live.
    fn establish(&mut self, retries: u32, window: u16, now: Instant) {
        if retries == 0 {
            if let Some(sent_at) = self.handshake_sent_at {
                self.rtt.sample(now.saturating_duration_since(sent_at));
            }
        }
        self.handshake_sent_at = None;
        self.retransmit.cancel();
        self.send.set_peer_window(window);
        self.state = ConnectionState::Established;
        log::info!(
            "[tcb] {} ↔ {} ESTABLISHED rto={:?}",
            self.local,
            self.remote,
            self.rtt.rto()
        );
    }

    // -----------------------------------------------------------------------
    // Inbound segments
    // -----------------------------------------------------------------------

    pub(crate) fn on_segment(&mut self, seg: Segment, now: Instant) {
        self.stats.segments_received += 1;
        log::trace!("[tcb] {} ← {seg} ({})", self.local, self.state);
        match self.state {
            ConnectionState::Closed { .. } => {
                if let Some(rst) = reset_for(&seg) {
                    self.outbox.push(rst);
                }
            }
            ConnectionState::Listen => self.on_segment_listen(seg, now),
            ConnectionState::SynSent { isn, retries } => {
                self.on_segment_syn_sent(seg, isn, retries, now)
            }
            ConnectionState::SynReceived { isn, retries } => {
                self.on_segment_syn_received(seg, isn, retries, now)
            }
            _ => self.on_segment_synchronized(seg, now),
        }
        self.pump(now);
    }

    fn on_segment_listen(&mut self, seg: Segment, now: Instant) {
        if seg.has(flags::RST) {
            return;
        }
        if seg.has(flags::ACK) {
            self.outbox.extend(reset_for(&seg));
            return;
        }
        if !seg.has(flags::SYN) {
            return;
        }
        self.recv = ReceiveWindow::new(seg.header.seq.wrapping_add(1), self.config.recv_buffer);
        let isn: u32 = rand::random();
        self.send = self.new_send_window(isn);
        self.send.set_peer_window(seg.header.window);
        self.state = ConnectionState::SynReceived { isn, retries: 0 };
        log::info!(
            "[tcb] {} ← {} SYN_RECEIVED peer_isn={} isn={isn}",
            self.local,
            self.remote,
            seg.header.seq
        );
        self.send_syn_ack(isn, now);
    }

    fn on_segment_syn_sent(&mut self, seg: Segment, isn: u32, retries: u32, now: Instant) {
        let ack_ok = seg.has(flags::ACK) && seg.header.ack == isn.wrapping_add(1);
        if seg.has(flags::ACK) && !ack_ok {
            self.outbox.extend(reset_for(&seg));
            return;
        }
        if seg.has(flags::RST) {
            if ack_ok {
                log::warn!("[tcb] {} refused by {}", self.local, self.remote);
                self.fail(CloseCause::Reset);
            }
            return;
        }
        if !seg.has(flags::SYN) {
            return;
        }
        self.recv = ReceiveWindow::new(seg.header.seq.wrapping_add(1), self.config.recv_buffer);
        if ack_ok {
            self.establish(retries, seg.header.window, now);
            self.send_ack();
        } else {
            // Simultaneous open: both SYNs crossed.
            log::info!("[tcb] {} simultaneous open with {}", self.local, self.remote);
            self.send.set_peer_window(seg.header.window);
            self.state = ConnectionState::SynReceived { isn, retries: 0 };
            self.send_syn_ack(isn, now);
        }
    }

    fn on_segment_syn_received(&mut self, seg: Segment, isn: u32, retries: u32, now: Instant) {
        if seg.has(flags::RST) {
            self.fail(CloseCause::Reset);
            return;
        }
        if seg.has(flags::SYN) && !seg.has(flags::ACK) {
            // Our SYN-ACK was lost and the peer resent its SYN.
            if seg.header.seq.wrapping_add(1) == self.recv.ack_number() {
                self.send_syn_ack(isn, now);
                // Either SYN-ACK may be the one acknowledged: no RTT sample.
                self.handshake_sent_at = None;
            }
            return;
        }
        if !seg.has(flags::ACK) {
            return;
        }
        if seg.header.ack != isn.wrapping_add(1) {
            self.outbox.extend(reset_for(&seg));
            return;
        }
        self.establish(retries, seg.header.window, now);
        if seg.has(flags::SYN) {
            // SYN-ACK in a simultaneous open.
            self.send_ack();
            return;
        }
        // The handshake ACK may already carry data or a FIN.
        self.on_segment_synchronized(seg, now);
    }

    fn on_segment_synchronized(&mut self, seg: Segment, now: Instant) {
        let rcv_nxt = self.recv.ack_number();

        if seg.has(flags::RST) {
            let window = u32::from(self.recv.window()).max(1);
            let in_window = seq::le(rcv_nxt, seg.header.seq)
                && seq::lt(seg.header.seq, rcv_nxt.wrapping_add(window));
            if in_window {
                log::warn!("[tcb] {} reset by {}", self.local, self.remote);
                self.fail(CloseCause::Reset);
            }
            return;
        }
        if seg.has(flags::SYN) {
            if seg.header.seq.wrapping_add(1) == rcv_nxt {
                // Our handshake ACK was lost; the peer resent SYN or SYN-ACK.
                self.send_ack();
            } else {
                log::debug!("[tcb] {} unexpected SYN from {}; RST", self.local, self.remote);
                self.outbox.extend(reset_for(&seg));
            }
            return;
        }
        if !seg.has(flags::ACK) {
            return;
        }

        if !self.process_ack(&seg, now) {
            return;
        }
        if self.state.is_closed() {
            return;
        }

        let fin_before = self.recv.fin_consumed();
        let mut need_ack = false;
        if !seg.payload.is_empty() {
            need_ack = true;
            if self.state.accepts_data() {
                let outcome = self.recv.on_segment(seg.header.seq, &seg.payload);
                if let SegmentOutcome::InOrder { delivered } = outcome {
                    self.stats.bytes_received += delivered as u64;
                }
                log::trace!("[tcb] {} data seq={} → {outcome:?}", self.local, seg.header.seq);
            }
        }

        if seg.has(flags::FIN) {
            need_ack = true;
            let fin_seq = seg.header.seq.wrapping_add(seg.payload.len() as u32);
            match self.state {
                ConnectionState::Established
                | ConnectionState::FinWait1
                | ConnectionState::FinWait2 => {
                    self.recv.on_fin(fin_seq);
                }
                // Retransmitted FIN: our last ACK was lost.
                ConnectionState::TimeWait => self.enter_time_wait(),
                _ => {}
            }
        }
        // Also covers a FIN that arrived early and is consumed once the gap
        // before it fills.
        if !fin_before && self.recv.fin_consumed() {
            self.on_peer_fin();
        }

        if need_ack {
            self.send_ack();
        }
    }

    fn on_peer_fin(&mut self) {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::CloseWait,
            ConnectionState::FinWait1 => ConnectionState::Closing,
            ConnectionState::FinWait2 => {
                self.enter_time_wait();
                return;
            }
            other => other,
        };
        log::debug!("[tcb] {} peer FIN: {} → {next}", self.local, self.state);
        self.state = next;
    }

    /// Feed the ACK field to the send window.  Returns `false` when the rest
    /// of the segment must be ignored.
    fn process_ack(&mut self, seg: &Segment, now: Instant) -> bool {
        let window_was_closed = self.send.peer_window() == 0;
        match self.send.on_ack(seg, now, &mut self.rtt, &mut self.cc) {
            AckOutcome::Advanced {
                fin_acked, partial, ..
            } => {
                if partial {
                    if let Some(t) = self.send.retransmit_oldest(now) {
                        log::debug!("[tcb] {} partial ACK; resend seq={}", self.local, t.seq);
                        self.stats.retransmits += 1;
                        self.push_transmit(t);
                    }
                }
                if fin_acked {
                    self.on_fin_acked();
                }
                if self.state.is_synchronized() {
                    if self.send.has_unacked() {
                        self.arm_retransmit(self.send.oldest().map(|e| e.seq));
                    } else {
                        self.retransmit.cancel();
                    }
                }
            }
            AckOutcome::FastRetransmit => {
                self.stats.dup_acks_received += 1;
                self.stats.fast_retransmits += 1;
                if let Some(t) = self.send.retransmit_oldest(now) {
                    log::debug!(
                        "[tcb] {} fast retransmit seq={} cwnd={}",
                        self.local,
                        t.seq,
                        self.cc.window()
                    );
                    self.stats.retransmits += 1;
                    self.push_transmit(t);
                    self.arm_retransmit(self.send.oldest().map(|e| e.seq));
                }
            }
            AckOutcome::Duplicate { count } => {
                if count > 0 {
                    self.stats.dup_acks_received += 1;
                }
            }
            AckOutcome::WindowUpdate => {
                // Whatever was sent into the closed window was rejected.
                if window_was_closed && self.send.peer_window() > 0 {
                    if let Some(t) = self.send.retransmit_oldest(now) {
                        log::debug!("[tcb] {} window reopened; resend seq={}", self.local, t.seq);
                        self.stats.retransmits += 1;
                        self.push_transmit(t);
                        self.arm_retransmit(self.send.oldest().map(|e| e.seq));
                    }
                }
            }
            AckOutcome::Stale => {}
            AckOutcome::Unsent => {
                self.send_ack();
                return false;
            }
        }
        self.stats.min_cwnd = self.cc.min_window();
        true
    }

    fn on_fin_acked(&mut self) {
        match self.state {
            ConnectionState::FinWait1 => self.state = ConnectionState::FinWait2,
            ConnectionState::Closing => self.enter_time_wait(),
            ConnectionState::LastAck => self.finish(),
            _ => {}
        }
        log::debug!("[tcb] {} FIN acknowledged; now {}", self.local, self.state);
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    pub(crate) fn on_timer(&mut self, event: TimerEvent, now: Instant) {
        match event {
            TimerEvent::Retransmit { token, target } => {
                if !self.retransmit.fire(token) {
                    log::trace!("[tcb] {} stale retransmit timer", self.local);
                    return;
                }
                self.on_retransmit_timeout(target, now);
            }
            TimerEvent::Linger { token } => {
                if self.linger.fire(token) && self.state == ConnectionState::TimeWait {
                    self.finish();
                }
            }
        }
        self.pump(now);
    }

    fn on_retransmit_timeout(&mut self, target: Option<u32>, now: Instant) {
        match self.state {
            ConnectionState::SynSent { isn, retries }
            | ConnectionState::SynReceived { isn, retries } => {
                if retries >= self.config.max_syn_retries {
                    log::warn!(
                        "[tcb] {} handshake with {} timed out after {retries} retries",
                        self.local,
                        self.remote
                    );
                    self.fail(CloseCause::TimedOut);
                    return;
                }
                self.rtt.back_off();
                self.stats.retransmits += 1;
                log::debug!("[tcb] {} handshake timeout; retry {}", self.local, retries + 1);
                if matches!(self.state, ConnectionState::SynSent { .. }) {
                    self.state = ConnectionState::SynSent { isn, retries: retries + 1 };
                    self.send_syn(isn, now);
                } else {
                    self.state = ConnectionState::SynReceived { isn, retries: retries + 1 };
                    self.send_syn_ack(isn, now);
                }
            }
            state if state.is_synchronized() => {
                let oldest = self.send.oldest().map(|e| e.seq);
                if target.is_some() && target != oldest {
                    return;
                }
                match self.send.on_timeout(now, &mut self.rtt, &mut self.cc) {
                    TimeoutAction::Idle => {}
                    TimeoutAction::Resend(t) => {
                        log::debug!(
                            "[tcb] {} timeout; resend seq={} rto={:?}",
                            self.local,
                            t.seq,
                            self.rtt.rto()
                        );
                        self.stats.timeout_losses += 1;
                        self.stats.retransmits += 1;
                        self.stats.min_cwnd = self.cc.min_window();
                        self.push_transmit(t);
                        self.arm_retransmit(self.send.oldest().map(|e| e.seq));
                    }
                    TimeoutAction::Probe(t) => {
                        log::debug!("[tcb] {} zero-window probe seq={}", self.local, t.seq);
                        self.stats.window_probes += 1;
                        self.push_transmit(t);
                        self.arm_retransmit(self.send.oldest().map(|e| e.seq));
                    }
                    TimeoutAction::Exhausted => {
                        log::warn!(
                            "[tcb] {} gave up on {} after {} retries",
                            self.local,
                            self.remote,
                            self.config.max_data_retries
                        );
                        self.fail(CloseCause::TimedOut);
                    }
                }
            }
            _ => {}
        }
    }

    fn arm_retransmit(&mut self, target: Option<u32>) {
        let sink = Arc::clone(&self.sink);
        self.retransmit.arm(self.rtt.rto(), move |token| {
            sink(TimerEvent::Retransmit { token, target })
        });
    }

    fn enter_time_wait(&mut self) {
        self.state = ConnectionState::TimeWait;
        self.retransmit.cancel();
        let sink = Arc::clone(&self.sink);
        self.linger
            .arm(self.config.time_wait(), move |token| sink(TimerEvent::Linger { token }));
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Send whatever the windows allow, the FIN once the stream drains, and
    /// an unprompted window update if reading reopened the window.
    pub(crate) fn pump(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Established | ConnectionState::CloseWait
        ) {
            return;
        }
        let mss = self.config.mss;
        while let Some(t) = self.send.next_segment(self.cc.window(), mss, now) {
            self.stats.bytes_sent += t.payload.len() as u64;
            self.push_transmit(t);
        }
        if let Some(fin) = self.send.next_fin(now) {
            self.state = match self.state {
                ConnectionState::CloseWait => ConnectionState::LastAck,
                _ => ConnectionState::FinWait1,
            };
            log::debug!("[tcb] {} → FIN seq={}; now {}", self.local, fin.seq, self.state);
            self.push_transmit(fin);
        }
        if !self.retransmit.is_armed() {
            if self.send.has_unacked() {
                self.arm_retransmit(self.send.oldest().map(|e| e.seq));
            } else if self.send.has_unsent() && self.send.peer_window() == 0 {
                self.arm_retransmit(None);
            }
        }
        if self.recv.should_update_window(mss) {
            self.send_ack();
        }
    }

    fn push_transmit(&mut self, t: Transmit) {
        let mut flags = flags::ACK;
        if t.fin {
            flags |= flags::FIN;
        }
        let seg = Segment {
            header: Header {
                seq: t.seq,
                ack: self.recv.ack_number(),
                flags,
                window: self.recv.window(),
            },
            payload: t.payload,
        };
        self.push(seg);
    }

    fn send_ack(&mut self) {
        let seg = Segment::control(
            self.send.snd_nxt(),
            self.recv.ack_number(),
            flags::ACK,
            self.recv.window(),
        );
        self.push(seg);
    }

    fn push(&mut self, seg: Segment) {
        if seg.has(flags::ACK) {
            self.recv.mark_advertised();
        }
        log::trace!("[tcb] {} → {seg}", self.local);
        self.stats.segments_sent += 1;
        self.outbox.push(seg);
    }

    /// Hand every pending segment to the caller.
    pub(crate) fn take_outbox(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.outbox)
    }

    // -----------------------------------------------------------------------
    // Application operations
    // -----------------------------------------------------------------------

    /// Enqueue bytes for transmission; returns how many were accepted.
    pub(crate) fn send(&mut self, bytes: &[u8], now: Instant) -> Result<usize> {
        match self.state {
            ConnectionState::Closed { cause } => Err(ConnError::from_cause(cause)),
            state if state.accepts_writes() && !self.send.fin_requested() => {
                let n = self.send.enqueue(bytes);
                self.pump(now);
                Ok(n)
            }
            state if state.fin_sent() || self.send.fin_requested() => Err(ConnError::Closed),
            state => Err(ConnError::InvalidState(state.name())),
        }
    }

    /// Take up to `max` bytes.  `Some(empty)` is end of stream or a
    /// zero-byte read; `None` means nothing is readable yet.
    pub(crate) fn read(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if let ConnectionState::Closed { cause } = self.state {
            if cause != CloseCause::Graceful {
                return Err(ConnError::from_cause(cause));
            }
        }
        if max == 0 {
            return Ok(Some(Vec::new()));
        }
        if self.recv.readable() > 0 {
            let bytes = self.recv.read(max);
            if self.state.is_synchronized() && self.recv.should_update_window(self.config.mss) {
                log::trace!("[tcb] {} window update wnd={}", self.local, self.recv.window());
                self.send_ack();
            }
            return Ok(Some(bytes));
        }
        if self.recv.at_eof() || self.state.is_closed() {
            return Ok(Some(Vec::new()));
        }
        Ok(None)
    }

    /// Begin an orderly close.  The FIN follows once every enqueued byte is
    /// acknowledged.  Repeated calls are no-ops.
    pub(crate) fn close(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Established | ConnectionState::CloseWait => {
                self.send.request_fin();
                self.pump(now);
            }
            ConnectionState::Listen
            | ConnectionState::SynSent { .. }
            | ConnectionState::SynReceived { .. } => {
                log::debug!("[tcb] {} closed during handshake", self.local);
                self.fail(CloseCause::Aborted);
            }
            _ => {}
        }
    }

    /// Tear down immediately, telling the peer with an RST.
    pub(crate) fn abort(&mut self) {
        if self.state.is_closed() {
            return;
        }
        if self.state.is_synchronized() || matches!(self.state, ConnectionState::SynReceived { .. }) {
            let rst = Segment::control(self.send.snd_nxt(), 0, flags::RST, 0);
            self.push(rst);
        }
        log::info!("[tcb] {} aborted", self.local);
        self.fail(CloseCause::Aborted);
    }

    /// The transport could not carry our segments.
    pub(crate) fn transport_failed(&mut self) {
        if !self.state.is_closed() {
            log::warn!("[tcb] {} transport to {} failed", self.local, self.remote);
            self.fail(CloseCause::TimedOut);
        }
    }

    pub(crate) fn note_invalid(&mut self) {
        self.stats.invalid_segments += 1;
    }

    fn fail(&mut self, cause: CloseCause) {
        self.retransmit.cancel();
        self.linger.cancel();
        self.send.discard();
        self.recv.discard();
        self.handshake_sent_at = None;
        self.state = ConnectionState::Closed { cause };
    }

    fn finish(&mut self) {
        self.retransmit.cancel();
        self.linger.cancel();
        self.state = ConnectionState::Closed {
            cause: CloseCause::Graceful,
        };
        log::info!("[tcb] {} ↔ {} CLOSED", self.local, self.remote);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub(crate) fn congestion(&self) -> CongestionSnapshot {
        self.cc.snapshot()
    }

    pub(crate) fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    /// `send` would accept at least one byte (or fail immediately).
    pub(crate) fn writable(&self) -> bool {
        !self.state.accepts_writes() || self.send.fin_requested() || self.send.free_space() > 0
    }

    /// Every enqueued byte is acknowledged.  Errors if the connection failed.
    pub(crate) fn flushed(&self) -> Option<Result<()>> {
        match self.state {
            ConnectionState::Closed { cause } if cause != CloseCause::Graceful => {
                Some(Err(ConnError::from_cause(cause)))
            }
            _ if self.send.is_drained() => Some(Ok(())),
            _ => None,
        }
    }

    pub(crate) fn close_progress(&self) -> CloseProgress {
        match self.state {
            ConnectionState::Closed {
                cause: CloseCause::Graceful,
            }
            | ConnectionState::FinWait2
            | ConnectionState::TimeWait => CloseProgress::Done,
            ConnectionState::Closed { cause } => CloseProgress::Failed(cause),
            _ => CloseProgress::Pending,
        }
    }
}
