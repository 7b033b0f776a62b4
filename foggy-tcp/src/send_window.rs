//! Send-side window management.
//!
//! [`SendWindow`] owns the outgoing byte stream for one connection: bytes the
//! application enqueued but that were never sent, and the retransmission
//! queue of sent-but-unacknowledged segments.
//!
//! # Sequence-number layout
//!
//! ```text
//!  snd_una              snd_nxt
//!     │                    │
//!  ───┼────────────────────┼──────────────────────────▶ seq space
//!     │ <── retransmit ──▶ │ <── unsent (buffered) ──▶
//!     │       queue        │
//!     │ <──── min(cwnd, peer window) ────▶│
//! ```
//!
//! ACKs are cumulative.  The window decides *what* may be sent; the caller
//! frames segments and owns all I/O.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::congestion::CongestionController;
use crate::rtt::RttEstimator;
use crate::segment::{flags, Segment};
use crate::seq;

/// A sent-but-unacknowledged range of the stream.
#[derive(Debug, Clone)]
pub struct RetxEntry {
    /// Sequence number of the first payload byte (or of the FIN).
    pub seq: u32,
    /// Snapshot of the bytes as first sent; resends are identical.
    pub payload: Vec<u8>,
    /// This entry carries our FIN.
    pub fin: bool,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
    /// Total transmissions (1 = never retransmitted).
    pub tx_count: u32,
    /// Retransmissions caused by the retransmission timer.
    pub timeouts: u32,
}

impl RetxEntry {
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.fin)
    }

    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

/// What to put on the wire for a (re)transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub fin: bool,
}

impl Transmit {
    fn of(entry: &RetxEntry) -> Self {
        Self {
            seq: entry.seq,
            payload: entry.payload.clone(),
            fin: entry.fin,
        }
    }
}

/// Result of feeding one ACK to [`SendWindow::on_ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// New data acknowledged.
    Advanced {
        /// Sequence space newly acknowledged.
        acked: u32,
        /// Our FIN is now acknowledged.
        fin_acked: bool,
        /// Still below the loss-recovery point: the next hole should be
        /// retransmitted right away.
        partial: bool,
    },
    /// The duplicate-ACK threshold was just crossed; the oldest segment
    /// should be retransmitted now.
    FastRetransmit,
    /// Same ACK number again, no new data acknowledged.
    Duplicate { count: u32 },
    /// Same ACK number carrying a different window.
    WindowUpdate,
    /// Acknowledges data older than `snd_una`; ignored.
    Stale,
    /// Acknowledges data that was never sent; ignored.
    Unsent,
}

/// What the retransmission timer should do when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Nothing outstanding: a stale firing.
    Idle,
    /// Resend the oldest entry.
    Resend(Transmit),
    /// Peer window is closed: resend or emit a window probe, outside the
    /// retry budget and without signalling congestion.
    Probe(Transmit),
    /// The oldest entry exhausted its retry budget.
    Exhausted,
}

#[derive(Debug)]
pub struct SendWindow {
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Next sequence number to assign.
    snd_nxt: u32,
    /// Enqueued bytes never sent.
    unsent: VecDeque<u8>,
    /// Sent-but-unacknowledged entries ordered by sequence number.
    queue: VecDeque<RetxEntry>,
    /// Bound on `unsent` plus unacknowledged payload.
    capacity: usize,
    /// Window last advertised by the peer.
    peer_window: u32,
    dup_acks: u32,
    dup_ack_threshold: u32,
    max_retries: u32,
    /// `snd_nxt` when the current loss episode began.
    recover: Option<u32>,
    fin_requested: bool,
    fin_sent: bool,
}

impl SendWindow {
    /// `start` is the first data sequence number (ISN + 1).
    pub fn new(start: u32, capacity: usize, dup_ack_threshold: u32, max_retries: u32) -> Self {
        Self {
            snd_una: start,
            snd_nxt: start,
            unsent: VecDeque::new(),
            queue: VecDeque::new(),
            capacity,
            peer_window: 0,
            dup_acks: 0,
            dup_ack_threshold,
            max_retries,
            recover: None,
            fin_requested: false,
            fin_sent: false,
        }
    }

    /// Append application bytes; returns how many were accepted.
    ///
    /// Never blocks.  A short count means the buffer is full.
    pub fn enqueue(&mut self, bytes: &[u8]) -> usize {
        if self.fin_requested {
            return 0;
        }
        let n = bytes.len().min(self.free_space());
        self.unsent.extend(&bytes[..n]);
        n
    }

    /// Unsent bytes eligible for transmission right now:
    /// `min(cwnd, peer window) − bytes in flight`, bounded by what is buffered.
    pub fn servicable_bytes(&self, cwnd: u32) -> usize {
        let limit = cwnd.min(self.peer_window);
        let room = limit.saturating_sub(self.in_flight()) as usize;
        room.min(self.unsent.len())
    }

    /// Cut the next new segment of at most `mss` bytes, if the windows allow.
    ///
    /// A short segment is held back while data is in flight unless it drains
    /// the buffer, to avoid dribbling tiny segments into a nearly-full window.
    pub fn next_segment(&mut self, cwnd: u32, mss: usize, now: Instant) -> Option<Transmit> {
        let n = self.servicable_bytes(cwnd).min(mss);
        if n == 0 {
            return None;
        }
        if n < mss && n < self.unsent.len() && self.in_flight() > 0 {
            return None;
        }
        let payload: Vec<u8> = self.unsent.drain(..n).collect();
        Some(self.push_entry(payload, false, now))
    }

    /// Ask for a FIN once everything enqueued so far is delivered.
    pub fn request_fin(&mut self) {
        self.fin_requested = true;
    }

    /// Emit the FIN once every buffered byte has been acknowledged.
    pub fn next_fin(&mut self, now: Instant) -> Option<Transmit> {
        if !self.fin_requested || self.fin_sent || !self.is_drained() {
            return None;
        }
        self.fin_sent = true;
        Some(self.push_entry(Vec::new(), true, now))
    }

    /// Process the acknowledgment carried by `segment`.
    ///
    /// New acknowledgments retire entries, feed the RTT estimator (only from
    /// never-retransmitted entries) and grow the congestion window.  The
    /// duplicate that crosses the threshold is reported to the congestion
    /// controller as a fast-retransmit trigger.
    pub fn on_ack(
        &mut self,
        segment: &Segment,
        now: Instant,
        rtt: &mut RttEstimator,
        cc: &mut CongestionController,
    ) -> AckOutcome {
        let ack = segment.header.ack;
        let window = u32::from(segment.header.window);

        if seq::gt(ack, self.snd_nxt) {
            return AckOutcome::Unsent;
        }
        if seq::lt(ack, self.snd_una) {
            return AckOutcome::Stale;
        }

        if ack == self.snd_una {
            let window_changed = window != self.peer_window;
            self.peer_window = window;
            let pure = segment.payload.is_empty()
                && !segment.has(flags::SYN)
                && !segment.has(flags::FIN);
            if !pure || self.queue.is_empty() {
                return if window_changed {
                    AckOutcome::WindowUpdate
                } else {
                    AckOutcome::Duplicate { count: 0 }
                };
            }
            if window_changed {
                return AckOutcome::WindowUpdate;
            }
            if window == 0 {
                // Replies to window probes, not a sign of loss.
                return AckOutcome::Duplicate { count: 0 };
            }
            self.dup_acks += 1;
            if self.dup_acks == self.dup_ack_threshold
                && cc.on_fast_retransmit(self.snd_nxt)
            {
                self.recover = Some(self.snd_nxt);
                return AckOutcome::FastRetransmit;
            }
            return AckOutcome::Duplicate {
                count: self.dup_acks,
            };
        }

        let acked = ack.wrapping_sub(self.snd_una);
        let mut fin_acked = false;
        let mut sample = None;
        while let Some(front) = self.queue.front_mut() {
            if seq::le(front.end(), ack) {
                if front.tx_count == 1 {
                    sample = Some(now.saturating_duration_since(front.sent_at));
                }
                fin_acked |= front.fin;
                self.queue.pop_front();
            } else {
                // Partially acknowledged entry: keep only the unacked tail.
                if seq::lt(front.seq, ack) {
                    let cut = ack.wrapping_sub(front.seq) as usize;
                    front.payload.drain(..cut);
                    front.seq = ack;
                }
                break;
            }
        }
        if let Some(measured) = sample {
            rtt.sample(measured);
        }

        self.snd_una = ack;
        self.peer_window = window;
        self.dup_acks = 0;

        let partial = match self.recover {
            Some(recover) if seq::lt(ack, recover) => true,
            _ => {
                self.recover = None;
                false
            }
        };
        cc.on_ack(acked, ack);

        AckOutcome::Advanced {
            acked,
            fin_acked,
            partial,
        }
    }

    /// Resend the oldest entry immediately (fast retransmit or partial ACK).
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<Transmit> {
        let entry = self.queue.front_mut()?;
        entry.tx_count += 1;
        entry.sent_at = now;
        Some(Transmit::of(entry))
    }

    /// The retransmission timer expired for the oldest entry.
    ///
    /// Resends it unmodified, backs off the RTO and signals a timeout loss to
    /// the congestion controller.  With a closed peer window this probes
    /// instead.
    pub fn on_timeout(
        &mut self,
        now: Instant,
        rtt: &mut RttEstimator,
        cc: &mut CongestionController,
    ) -> TimeoutAction {
        if self.peer_window == 0 {
            return match self.probe(now) {
                Some(probe) => {
                    rtt.back_off();
                    TimeoutAction::Probe(probe)
                }
                None => TimeoutAction::Idle,
            };
        }

        let snd_nxt = self.snd_nxt;
        let max_retries = self.max_retries;
        let Some(entry) = self.queue.front_mut() else {
            return TimeoutAction::Idle;
        };
        if entry.timeouts >= max_retries {
            return TimeoutAction::Exhausted;
        }
        entry.timeouts += 1;
        entry.tx_count += 1;
        entry.sent_at = now;
        let repeated = entry.timeouts > 1;
        let resend = Transmit::of(entry);

        self.recover = Some(snd_nxt);
        self.dup_acks = 0;
        rtt.back_off();
        cc.on_timeout(repeated);
        TimeoutAction::Resend(resend)
    }

    /// Resend the oldest entry, or carve a one-byte probe from unsent data.
    fn probe(&mut self, now: Instant) -> Option<Transmit> {
        if !self.queue.is_empty() {
            return self.retransmit_oldest(now);
        }
        let byte = self.unsent.pop_front()?;
        Some(self.push_entry(vec![byte], false, now))
    }

    fn push_entry(&mut self, payload: Vec<u8>, fin: bool, now: Instant) -> Transmit {
        let entry = RetxEntry {
            seq: self.snd_nxt,
            payload,
            fin,
            sent_at: now,
            tx_count: 1,
            timeouts: 0,
        };
        self.snd_nxt = entry.end();
        let transmit = Transmit::of(&entry);
        self.queue.push_back(entry);
        transmit
    }

    /// Record the peer's window from the handshake.
    pub fn set_peer_window(&mut self, window: u16) {
        self.peer_window = u32::from(window);
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Sequence space sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Bytes the application may still enqueue.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.buffered())
    }

    /// Unsent plus unacknowledged payload bytes.
    pub fn buffered(&self) -> usize {
        self.unsent.len() + self.queue.iter().map(|e| e.payload.len()).sum::<usize>()
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    pub fn has_unacked(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Every enqueued byte has been sent and acknowledged.
    pub fn is_drained(&self) -> bool {
        self.unsent.is_empty() && self.queue.is_empty()
    }

    pub fn oldest(&self) -> Option<&RetxEntry> {
        self.queue.front()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RetxEntry> {
        self.queue.iter()
    }

    pub fn fin_requested(&self) -> bool {
        self.fin_requested
    }

    /// Drop every buffered byte (abort / reset).
    pub fn discard(&mut self) {
        self.unsent.clear();
        self.queue.clear();
    }
}
