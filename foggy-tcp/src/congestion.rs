//! Loss-based congestion control.
//!
//! - **Slow start**: cwnd grows by up to one MSS per new ACK (exponential
//!   growth per round trip) until it reaches ssthresh.
//! - **Congestion avoidance**: cwnd grows by one MSS per window's worth of
//!   acknowledged bytes (linear growth per round trip).
//! - **Fast retransmit**: cwnd and ssthresh drop to half the window and the
//!   controller enters loss recovery; the first ACK at or past the recovery
//!   point resumes congestion avoidance.
//! - **Timeout**: ssthresh drops to half the window, cwnd collapses to one
//!   MSS, and slow start begins again.
//!
//! The window never falls below one MSS.

use crate::seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
    /// Fast retransmit in progress until `recover` is acknowledged.
    LossRecovery { recover: u32 },
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionSnapshot {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub phase: Phase,
}

#[derive(Debug, Clone)]
pub struct CongestionController {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    phase: Phase,
    /// Bytes acknowledged since the last linear increase.
    avoidance_credit: u32,
    /// Smallest window since the connection was created.
    min_cwnd: u32,
}

impl CongestionController {
    pub fn new(mss: u32, initial_segments: u32) -> Self {
        let cwnd = mss * initial_segments.max(1);
        Self {
            mss,
            cwnd,
            ssthresh: u32::MAX,
            phase: Phase::SlowStart,
            avoidance_credit: 0,
            min_cwnd: cwnd,
        }
    }

    /// New data was acknowledged; `ack` is the new left edge of the window.
    pub fn on_ack(&mut self, acked: u32, ack: u32) {
        match self.phase {
            Phase::LossRecovery { recover } => {
                if seq::le(recover, ack) {
                    log::debug!("[cc] recovery complete at ack={ack}, cwnd={}", self.cwnd);
                    self.phase = Phase::CongestionAvoidance;
                    self.avoidance_credit = 0;
                }
            }
            Phase::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(acked.min(self.mss));
                if self.cwnd >= self.ssthresh {
                    self.phase = Phase::CongestionAvoidance;
                    self.avoidance_credit = 0;
                }
            }
            Phase::CongestionAvoidance => {
                self.avoidance_credit = self.avoidance_credit.saturating_add(acked);
                if self.avoidance_credit >= self.cwnd {
                    self.avoidance_credit -= self.cwnd;
                    self.cwnd = self.cwnd.saturating_add(self.mss);
                }
            }
        }
    }

    /// Duplicate ACKs crossed the threshold; `snd_nxt` becomes the recovery point.
    ///
    /// Returns `false` (and leaves the window alone) when a recovery is
    /// already in progress, so one loss episode halves the window only once.
    pub fn on_fast_retransmit(&mut self, snd_nxt: u32) -> bool {
        if matches!(self.phase, Phase::LossRecovery { .. }) {
            return false;
        }
        let halved = self.halved();
        log::debug!("[cc] fast retransmit: cwnd {} -> {halved}", self.cwnd);
        self.ssthresh = halved;
        self.set_cwnd(halved);
        self.phase = Phase::LossRecovery { recover: snd_nxt };
        self.avoidance_credit = 0;
        true
    }

    /// The retransmission timer expired.
    ///
    /// `repeated` marks a further timeout of a segment that already timed
    /// out; ssthresh is then kept rather than halved again.
    pub fn on_timeout(&mut self, repeated: bool) {
        if !repeated {
            self.ssthresh = self.halved();
        }
        log::debug!(
            "[cc] timeout: cwnd {} -> {}, ssthresh={}",
            self.cwnd,
            self.mss,
            self.ssthresh
        );
        self.set_cwnd(self.mss);
        self.phase = Phase::SlowStart;
        self.avoidance_credit = 0;
    }

    pub fn window(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn min_window(&self) -> u32 {
        self.min_cwnd
    }

    pub fn snapshot(&self) -> CongestionSnapshot {
        CongestionSnapshot {
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            phase: self.phase,
        }
    }

    fn halved(&self) -> u32 {
        (self.cwnd / 2).max(2 * self.mss)
    }

    fn set_cwnd(&mut self, cwnd: u32) {
        self.cwnd = cwnd.max(self.mss);
        self.min_cwnd = self.min_cwnd.min(self.cwnd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1000;

    #[test]
    fn starts_in_slow_start_with_initial_window() {
        let cc = CongestionController::new(MSS, 3);
        assert_eq!(cc.window(), 3 * MSS);
        assert_eq!(cc.phase(), Phase::SlowStart);
        assert_eq!(cc.ssthresh(), u32::MAX);
    }

    #[test]
    fn slow_start_strictly_increases_per_ack() {
        let mut cc = CongestionController::new(MSS, 1);
        let mut ack = 0u32;
        let mut previous = cc.window();
        for _ in 0..10 {
            ack += MSS;
            cc.on_ack(MSS, ack);
            assert!(cc.window() > previous);
            assert_eq!(cc.window(), previous + MSS);
            previous = cc.window();
        }
    }

    #[test]
    fn slow_start_growth_capped_at_one_mss_per_ack() {
        let mut cc = CongestionController::new(MSS, 1);
        cc.on_ack(5 * MSS, 5 * MSS);
        assert_eq!(cc.window(), 2 * MSS);
    }

    #[test]
    fn congestion_avoidance_grows_one_mss_per_window() {
        let mut cc = CongestionController::new(MSS, 8);
        cc.on_timeout(false); // ssthresh = 4 MSS, cwnd = 1 MSS
        let mut ack = 0u32;
        while cc.phase() == Phase::SlowStart {
            ack += MSS;
            cc.on_ack(MSS, ack);
        }
        assert_eq!(cc.window(), 4 * MSS);

        // Three ACKs of one MSS are not yet a full window.
        for _ in 0..3 {
            ack += MSS;
            cc.on_ack(MSS, ack);
        }
        assert_eq!(cc.window(), 4 * MSS);
        ack += MSS;
        cc.on_ack(MSS, ack);
        assert_eq!(cc.window(), 5 * MSS);
    }

    #[test]
    fn fast_retransmit_halves_without_collapsing() {
        let mut cc = CongestionController::new(MSS, 16);
        assert!(cc.on_fast_retransmit(50_000));
        assert_eq!(cc.window(), 8 * MSS);
        assert_eq!(cc.ssthresh(), 8 * MSS);
        assert_eq!(cc.phase(), Phase::LossRecovery { recover: 50_000 });

        // A second trigger inside the same episode is ignored.
        assert!(!cc.on_fast_retransmit(60_000));
        assert_eq!(cc.window(), 8 * MSS);
    }

    #[test]
    fn recovery_ends_when_recovery_point_acknowledged() {
        let mut cc = CongestionController::new(MSS, 16);
        cc.on_fast_retransmit(50_000);
        cc.on_ack(MSS, 20_000);
        assert!(matches!(cc.phase(), Phase::LossRecovery { .. }));
        assert_eq!(cc.window(), 8 * MSS, "no growth while recovering");
        cc.on_ack(MSS, 50_000);
        assert_eq!(cc.phase(), Phase::CongestionAvoidance);
    }

    #[test]
    fn timeout_collapses_to_one_mss() {
        let mut cc = CongestionController::new(MSS, 10);
        cc.on_timeout(false);
        assert_eq!(cc.window(), MSS);
        assert_eq!(cc.ssthresh(), 5 * MSS);
        assert_eq!(cc.phase(), Phase::SlowStart);
        assert_eq!(cc.min_window(), MSS);
    }

    #[test]
    fn repeated_timeout_keeps_ssthresh() {
        let mut cc = CongestionController::new(MSS, 10);
        cc.on_timeout(false);
        cc.on_timeout(true);
        assert_eq!(cc.ssthresh(), 5 * MSS);
        assert_eq!(cc.window(), MSS);
    }

    #[test]
    fn halving_never_goes_below_two_segments() {
        let mut cc = CongestionController::new(MSS, 2);
        cc.on_fast_retransmit(10);
        assert_eq!(cc.window(), 2 * MSS);
    }
}
