//! Receive-side reassembly and flow control.
//!
//! [`ReceiveWindow`] accepts inbound payloads, buffers out-of-order ranges
//! until the gap before them fills, and hands in-order bytes to the
//! application.  It also computes the ACK number and the advertised window.
//!
//! Positions are kept as 64-bit stream offsets internally so that ordering
//! in the out-of-order map survives 32-bit sequence wrap-around.
//!
//! Flow-control invariant: the advertised window equals capacity minus the
//! in-order bytes the application has not read yet, and out-of-order data is
//! only stored inside that window, so total occupancy never exceeds capacity.

use std::collections::{BTreeMap, VecDeque};

use crate::seq;

/// How an inbound payload was handled.  Every outcome warrants an ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Started at the expected position; `delivered` bytes became readable
    /// (including any out-of-order data it connected).
    InOrder { delivered: usize },
    /// Started past a gap; stored for later reassembly.
    Buffered,
    /// Entirely below the expected position.
    Duplicate,
    /// Outside the advertised window (or past the peer's FIN).
    OutOfWindow,
}

#[derive(Debug)]
pub struct ReceiveWindow {
    /// Next expected sequence number (`RCV.NXT`).
    rcv_nxt: u32,
    /// `rcv_nxt` as an absolute stream offset.
    nxt_offset: u64,
    /// In-order bytes not yet read by the application.
    app_buffer: VecDeque<u8>,
    /// Out-of-order ranges keyed by stream offset; never overlapping.
    out_of_order: BTreeMap<u64, Vec<u8>>,
    capacity: usize,
    /// Stream offset of the peer's FIN, once seen.
    fin_offset: Option<u64>,
    fin_consumed: bool,
    /// Window carried by the last ACK we built.
    last_advertised: usize,
}

impl ReceiveWindow {
    /// `rcv_nxt` is the first data sequence number expected (peer ISN + 1).
    pub fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            nxt_offset: 0,
            app_buffer: VecDeque::new(),
            out_of_order: BTreeMap::new(),
            capacity,
            fin_offset: None,
            fin_consumed: false,
            last_advertised: capacity,
        }
    }

    /// Accept the payload of an inbound segment starting at `seq`.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> SegmentOutcome {
        if payload.is_empty() {
            return SegmentOutcome::Duplicate;
        }
        let start = self.offset_of(seq);
        let end = start + payload.len() as i64;
        let nxt = self.nxt_offset as i64;

        if end <= nxt {
            return SegmentOutcome::Duplicate;
        }
        let window_end = nxt + self.window_len() as i64;
        let limit = match self.fin_offset {
            Some(fin) => window_end.min(fin as i64),
            None => window_end,
        };
        if start >= limit {
            return SegmentOutcome::OutOfWindow;
        }

        // Clip to [rcv_nxt, limit).
        let lo = start.max(nxt);
        let hi = end.min(limit);
        let bytes = &payload[(lo - start) as usize..(hi - start) as usize];

        if lo == nxt {
            let before = self.app_buffer.len();
            self.app_buffer.extend(bytes);
            self.advance(bytes.len() as u64);
            self.drain_out_of_order();
            self.consume_fin_if_reached();
            SegmentOutcome::InOrder {
                delivered: self.app_buffer.len() - before,
            }
        } else {
            self.store_out_of_order(lo as u64, bytes);
            SegmentOutcome::Buffered
        }
    }

    /// Note the peer's FIN at `fin_seq`; it is consumed once every byte
    /// before it has arrived.  Returns `true` when the FIN is consumed.
    pub fn on_fin(&mut self, fin_seq: u32) -> bool {
        if self.fin_consumed {
            return false;
        }
        let at = self.offset_of(fin_seq);
        if at < self.nxt_offset as i64 {
            return false;
        }
        self.fin_offset.get_or_insert(at as u64);
        self.consume_fin_if_reached();
        self.fin_consumed
    }

    /// Drain up to `max` in-order bytes for the application.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.app_buffer.len());
        self.app_buffer.drain(..n).collect()
    }

    /// Cumulative ACK number (`RCV.NXT`).
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Advertised window: capacity minus unread in-order bytes.
    pub fn window(&self) -> u16 {
        self.window_len().min(u16::MAX as usize) as u16
    }

    /// Record the window carried by an outgoing ACK.
    pub fn mark_advertised(&mut self) {
        self.last_advertised = self.window_len();
    }

    /// Reading reopened the window far enough to tell the peer unprompted.
    pub fn should_update_window(&self, mss: usize) -> bool {
        let threshold = mss.min(self.capacity / 2).max(1);
        self.window_len() >= self.last_advertised + threshold
    }

    /// Bytes held: unread in-order plus buffered out-of-order.
    pub fn occupancy(&self) -> usize {
        self.app_buffer.len() + self.out_of_order.values().map(Vec::len).sum::<usize>()
    }

    pub fn readable(&self) -> usize {
        self.app_buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The peer's FIN has been consumed: no more data will arrive.
    pub fn fin_consumed(&self) -> bool {
        self.fin_consumed
    }

    /// End of stream reached and every byte read.
    pub fn at_eof(&self) -> bool {
        self.fin_consumed && self.app_buffer.is_empty()
    }

    pub fn discard(&mut self) {
        self.app_buffer.clear();
        self.out_of_order.clear();
    }

    fn window_len(&self) -> usize {
        self.capacity.saturating_sub(self.app_buffer.len())
    }

    fn offset_of(&self, seq: u32) -> i64 {
        self.nxt_offset as i64 + seq::diff(seq, self.rcv_nxt)
    }

    fn advance(&mut self, n: u64) {
        self.nxt_offset += n;
        self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
    }

    /// Store only the parts of `[lo, lo + bytes.len())` not already held.
    fn store_out_of_order(&mut self, lo: u64, bytes: &[u8]) {
        let hi = lo + bytes.len() as u64;
        let mut gaps = Vec::new();
        let mut cursor = lo;
        for (&start, data) in self.out_of_order.range(..hi) {
            let end = start + data.len() as u64;
            if end <= cursor {
                continue;
            }
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(end);
            if cursor >= hi {
                break;
            }
        }
        if cursor < hi {
            gaps.push((cursor, hi));
        }
        for (from, to) in gaps {
            let piece = bytes[(from - lo) as usize..(to - lo) as usize].to_vec();
            self.out_of_order.insert(from, piece);
        }
    }

    /// Move out-of-order ranges that now touch `rcv_nxt` into the app buffer.
    fn drain_out_of_order(&mut self) {
        while let Some(entry) = self.out_of_order.first_entry() {
            let start = *entry.key();
            if start > self.nxt_offset {
                break;
            }
            let data = entry.remove();
            let end = start + data.len() as u64;
            if end > self.nxt_offset {
                let skip = (self.nxt_offset - start) as usize;
                self.app_buffer.extend(&data[skip..]);
                self.advance(end - self.nxt_offset);
            }
        }
    }

    fn consume_fin_if_reached(&mut self) {
        if self.fin_offset == Some(self.nxt_offset) && !self.fin_consumed {
            self.fin_consumed = true;
            // The FIN occupies one sequence number.
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.nxt_offset += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_segment_accepted() {
        let mut r = ReceiveWindow::new(100, 1000);
        assert_eq!(
            r.on_segment(100, b"hello"),
            SegmentOutcome::InOrder { delivered: 5 }
        );
        assert_eq!(r.ack_number(), 105);
        assert_eq!(r.read(100), b"hello");
    }

    #[test]
    fn gap_is_buffered_then_reassembled() {
        let mut r = ReceiveWindow::new(0, 1000);
        assert_eq!(r.on_segment(5, b"world"), SegmentOutcome::Buffered);
        assert_eq!(r.ack_number(), 0);
        assert_eq!(r.readable(), 0);

        assert_eq!(
            r.on_segment(0, b"hello"),
            SegmentOutcome::InOrder { delivered: 10 }
        );
        assert_eq!(r.ack_number(), 10);
        assert_eq!(r.read(100), b"helloworld");
    }

    #[test]
    fn duplicate_segment_dropped() {
        let mut r = ReceiveWindow::new(0, 1000);
        r.on_segment(0, b"abc");
        assert_eq!(r.on_segment(0, b"abc"), SegmentOutcome::Duplicate);
        assert_eq!(r.read(10), b"abc");
    }

    #[test]
    fn overlapping_segment_delivers_only_new_bytes() {
        let mut r = ReceiveWindow::new(0, 1000);
        r.on_segment(0, b"abcd");
        assert_eq!(
            r.on_segment(2, b"cdef"),
            SegmentOutcome::InOrder { delivered: 2 }
        );
        assert_eq!(r.read(10), b"abcdef");
    }

    #[test]
    fn overlapping_out_of_order_ranges_stored_once() {
        let mut r = ReceiveWindow::new(0, 1000);
        r.on_segment(10, b"klmno");
        r.on_segment(8, b"ijklmnopq");
        r.on_segment(12, b"mn");
        assert_eq!(r.occupancy(), 9);
        r.on_segment(0, b"abcdefgh");
        assert_eq!(r.read(100), b"abcdefghijklmnopq");
        assert_eq!(r.occupancy(), 0);
    }

    #[test]
    fn segment_beyond_window_rejected() {
        let mut r = ReceiveWindow::new(0, 10);
        assert_eq!(r.on_segment(10, b"x"), SegmentOutcome::OutOfWindow);
        // Partially inside the window: only the fitting part is kept.
        assert_eq!(
            r.on_segment(0, b"0123456789abc"),
            SegmentOutcome::InOrder { delivered: 10 }
        );
        assert_eq!(r.window(), 0);
        assert_eq!(r.on_segment(10, b"a"), SegmentOutcome::OutOfWindow);
    }

    #[test]
    fn window_tracks_unread_bytes() {
        let mut r = ReceiveWindow::new(0, 100);
        assert_eq!(r.window(), 100);
        r.on_segment(0, &[0u8; 60]);
        assert_eq!(r.window(), 40);
        assert_eq!(r.occupancy() + r.window() as usize, r.capacity());
        r.read(30);
        assert_eq!(r.window(), 70);
    }

    #[test]
    fn window_update_after_reading() {
        let mut r = ReceiveWindow::new(0, 100);
        r.on_segment(0, &[0u8; 100]);
        r.mark_advertised();
        assert!(!r.should_update_window(20));
        r.read(10);
        assert!(!r.should_update_window(20));
        r.read(10);
        assert!(r.should_update_window(20));
    }

    #[test]
    fn fin_consumed_in_order() {
        let mut r = ReceiveWindow::new(50, 100);
        r.on_segment(50, b"abc");
        assert!(r.on_fin(53));
        assert_eq!(r.ack_number(), 54);
        assert!(!r.at_eof());
        r.read(10);
        assert!(r.at_eof());
    }

    #[test]
    fn early_fin_waits_for_gap() {
        let mut r = ReceiveWindow::new(0, 100);
        r.on_segment(3, b"def");
        assert!(!r.on_fin(6));
        assert_eq!(r.ack_number(), 0);
        r.on_segment(0, b"abc");
        assert!(r.fin_consumed());
        assert_eq!(r.ack_number(), 7);
        assert_eq!(r.read(10), b"abcdef");
    }

    #[test]
    fn data_past_fin_rejected() {
        let mut r = ReceiveWindow::new(0, 100);
        r.on_segment(0, b"ab");
        assert!(r.on_fin(2));
        assert_eq!(r.on_segment(0, b"ab"), SegmentOutcome::Duplicate);
        assert_eq!(r.on_segment(3, b"zz"), SegmentOutcome::OutOfWindow);
        assert!(!r.on_fin(2), "a retransmitted FIN is not consumed twice");
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 2;
        let mut r = ReceiveWindow::new(start, 100);
        r.on_segment(start.wrapping_add(5), b"fgh");
        r.on_segment(start, b"abcde");
        assert_eq!(r.ack_number(), start.wrapping_add(8));
        assert_eq!(r.read(10), b"abcdefgh");
    }
}
