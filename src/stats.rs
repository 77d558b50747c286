use std::time::Duration;
use tokio::time::Instant;

use crate::channel::ChannelKey;

/// A snapshot of one channel's counters, taken inside the kernel
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub acks_received: u64,
    /// duplicate or out-of-window DATA packets
    pub dropped: u64,
    /// resent DATA packets
    pub repeated: u64,
    pub last_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub send_queue_len: usize,
    pub receive_queue_len: usize,
    pub write_queue_len: usize,
    pub max_queue_size: usize,
    /// DATA packets sent during the last full second
    pub send_rate: u64,
    /// DATA packets resent during the last full second
    pub repeat_rate: u64,
    pub connected: bool,
}

#[derive(Clone, Debug, Default)]
pub struct EndPointStats {
    pub channels: Vec<(ChannelKey, ChannelStats)>,
    /// datagrams that failed validation
    pub malformed_packets: u64,
    pub send_errors: u64,
}

impl EndPointStats {
    pub fn packets_sent(&self) -> u64 {
        self.channels.iter().map(|(_, s)| s.packets_sent).sum()
    }

    pub fn packets_received(&self) -> u64 {
        self.channels.iter().map(|(_, s)| s.packets_received).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.channels.iter().map(|(_, s)| s.dropped).sum()
    }

    pub fn repeated(&self) -> u64 {
        self.channels.iter().map(|(_, s)| s.repeated).sum()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Rates {
    pub sent_per_second: u64,
    pub repeated_per_second: u64,
}

/// Counts sent and repeated DATA packets in one-second windows
#[derive(Debug)]
pub struct RateMeter {
    window_start: Instant,
    sent: u64,
    repeated: u64,
    last: Rates,
}

impl RateMeter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> RateMeter {
        RateMeter {
            window_start: now,
            sent: 0,
            repeated: 0,
            last: Rates::default(),
        }
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn record_repeated(&mut self) {
        self.repeated += 1;
    }

    /// Closes the current window if it is complete, returning the rates measured in it. Windows
    ///  are closed lazily, so the counts are normalized to the actual window length.
    pub fn roll(&mut self, now: Instant) -> Option<Rates> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Self::WINDOW {
            return None;
        }

        let millis = elapsed.as_millis().max(1) as u64;
        self.last = Rates {
            sent_per_second: self.sent * 1000 / millis,
            repeated_per_second: self.repeated * 1000 / millis,
        };
        self.window_start = now;
        self.sent = 0;
        self.repeated = 0;
        Some(self.last)
    }

    pub fn last(&self) -> Rates {
        self.last
    }
}
