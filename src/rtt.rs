use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// The millisecond clock that is put on the wire. Timestamps are wall clock milliseconds truncated
///  to 32 bits, and they advance with the monotonic `Instant` after the clock is created. All
///  comparisons between timestamps use wrapping arithmetic.
///
/// A peer tells a resent stream start from a new one by its timestamp, so timestamps must not
///  start over when an end point is restarted.
#[derive(Copy, Clone, Debug)]
pub struct Clock {
    epoch: Instant,
    /// the timestamp at `epoch`
    base: u32,
}

impl Clock {
    pub fn new(epoch: Instant, base: u32) -> Clock {
        Clock { epoch, base }
    }

    /// a clock that starts at the current wall clock time
    pub fn system(now: Instant) -> Clock {
        let unix_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or_default();
        Clock::new(now, unix_millis)
    }

    pub fn timestamp(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.epoch).as_millis() as u32;
        self.base.wrapping_add(elapsed)
    }

    /// time between a timestamp echoed back by a peer and `now`
    pub fn elapsed_since(&self, timestamp: u32, now: Instant) -> Duration {
        Duration::from_millis(self.timestamp(now).wrapping_sub(timestamp) as u64)
    }
}

/// Smoothed round trip time, as an exponential moving average with weight 1/11 for new samples
#[derive(Clone, Debug, Default)]
pub struct RttEstimator {
    last: Duration,
    smoothed: Duration,
}

impl RttEstimator {
    pub fn on_sample(&mut self, sample: Duration) {
        self.last = sample;
        self.smoothed = if self.smoothed.is_zero() {
            sample
        }
        else {
            (self.smoothed * 10 + sample) / 11
        };
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn last(&self) -> Duration {
        self.last
    }

    /// The time to wait for an ACK before resending: the smoothed RTT clamped to `max_rtt`, plus
    ///  a fixed margin. Before the first sample, this is just the margin.
    pub fn retransmit_timeout(&self, max_rtt: Duration, margin: Duration) -> Duration {
        self.smoothed.min(max_rtt) + margin
    }
}
