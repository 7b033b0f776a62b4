//! Round-trip-time estimation and retransmission timeout (RFC 6298).
//!
//! `RTO = SRTT + 4 × RTTVAR`, floored at `min_rto`, doubled on every
//! consecutive timeout of the same segment up to `max_rto`.  A fresh sample
//! from a segment that was never retransmitted restores the estimator-derived
//! value.

use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    min_rto: Duration,
    max_rto: Duration,
    /// Smoothed RTT (SRTT), `None` until the first sample.
    srtt: Option<Duration>,
    /// RTT variance (RTTVAR).
    rttvar: Duration,
    /// Current RTO including any back-off.
    rto: Duration,
    /// Consecutive back-offs since the last fresh sample.
    backoffs: u32,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: config.initial_rto.clamp(config.min_rto, config.max_rto),
            backoffs: 0,
        }
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO.
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn sample(&mut self, measured: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(measured);
                self.rttvar = measured / 2;
            }
            Some(srtt) => {
                let deviation = measured.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + deviation / 4;
                self.srtt = Some(srtt * 7 / 8 + measured / 8);
            }
        }
        self.backoffs = 0;
        self.rto = self.derived();
    }

    /// Double the RTO after a retransmission timeout.
    pub fn back_off(&mut self) {
        self.backoffs += 1;
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    fn derived(&self) -> Duration {
        let srtt = self.srtt.unwrap_or_default();
        (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RttEstimator {
        RttEstimator::new(&Config::default())
    }

    #[test]
    fn initial_rto_before_samples() {
        let est = estimator();
        assert_eq!(est.rto(), Duration::from_secs(1));
        assert_eq!(est.srtt(), None);
    }

    #[test]
    fn first_sample_sets_srtt_and_half_variance() {
        let mut est = estimator();
        est.sample(Duration::from_millis(100));
        assert_eq!(est.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(est.rttvar(), Duration::from_millis(50));
        // 100 + 4 * 50 = 300ms
        assert_eq!(est.rto(), Duration::from_millis(300));
    }

    #[test]
    fn subsequent_samples_are_smoothed() {
        let mut est = estimator();
        est.sample(Duration::from_millis(100));
        est.sample(Duration::from_millis(180));
        // rttvar = 3/4*50 + 1/4*80 = 57.5ms, srtt = 7/8*100 + 1/8*180 = 110ms
        assert_eq!(est.srtt(), Some(Duration::from_millis(110)));
        assert_eq!(est.rttvar(), Duration::from_micros(57_500));
        assert_eq!(est.rto(), Duration::from_millis(340));
    }

    #[test]
    fn rto_is_floored_on_fast_links() {
        let mut est = estimator();
        est.sample(Duration::from_millis(1));
        assert_eq!(est.rto(), Duration::from_millis(200));
    }

    #[test]
    fn each_back_off_doubles_until_cap() {
        let mut est = estimator();
        est.sample(Duration::from_millis(100));
        let mut previous = est.rto();
        for _ in 0..6 {
            est.back_off();
            assert_eq!(est.rto(), previous * 2);
            previous = est.rto();
        }
        for _ in 0..10 {
            est.back_off();
        }
        assert_eq!(est.rto(), Duration::from_secs(120));
    }

    #[test]
    fn fresh_sample_resets_backoff() {
        let mut est = estimator();
        est.sample(Duration::from_millis(100));
        est.back_off();
        est.back_off();
        assert_eq!(est.backoffs(), 2);
        est.sample(Duration::from_millis(100));
        assert_eq!(est.backoffs(), 0);
        assert!(est.rto() < Duration::from_millis(1200));
    }
}
