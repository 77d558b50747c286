use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::packet::PacketHeader;

/// How to react when the configured local port is in use
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PortPolicy {
    /// try the following ports, up to `max_port_attempts` in total
    Increment,
    /// fail if the configured port is not available
    Fixed,
}

#[derive(Clone, Debug)]
pub struct TrudpConfig {
    /// Local address to bind the single UDP socket to. Port 0 lets the OS pick a free port, in
    ///  which case the port policy never comes into play.
    pub bind_addr: SocketAddr,
    pub port_policy: PortPolicy,
    pub max_port_attempts: u16,

    /// Initial limit for the number of unacknowledged packets per channel
    pub default_queue_size: usize,
    /// Upper bound for the send queue limit when it is tuned based on traffic
    pub max_queue_size: usize,
    pub auto_tune_queue_size: bool,
    /// Number of writes that are parked per channel while its send queue is full. Writes beyond
    ///  this fail with [`TrudpError::QueueFull`](crate::TrudpError::QueueFull).
    pub max_write_queue: usize,
    /// Packets further ahead of the next expected id than this are dropped without ACK so the
    ///  peer resends them later
    pub receive_window: u32,

    pub keep_alive_interval: Duration,
    pub disconnect_timeout: Duration,

    pub base_retransmit_margin: Duration,
    pub max_rtt: Duration,
    pub max_resend_attempts: u32,
    pub tick_interval: Duration,

    /// This is the size of the receive buffer, and it limits the size of packets this side sends.
    ///  Payloads are limited to this minus the packet header.
    pub max_datagram_size: usize,
    pub inbound_queue_size: usize,
    pub ack_ping_events: bool,
}

impl Default for TrudpConfig {
    fn default() -> Self {
        TrudpConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            port_policy: PortPolicy::Increment,
            max_port_attempts: 100,
            default_queue_size: 16,
            max_queue_size: 1024,
            auto_tune_queue_size: true,
            max_write_queue: 1024,
            receive_window: 1024,
            keep_alive_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(3),
            base_retransmit_margin: Duration::from_millis(30),
            max_rtt: Duration::from_millis(500),
            max_resend_attempts: 50,
            tick_interval: Duration::from_millis(10),
            max_datagram_size: 2048,
            inbound_queue_size: 1024,
            ack_ping_events: false,
        }
    }
}

impl TrudpConfig {
    pub fn new(bind_addr: SocketAddr) -> TrudpConfig {
        TrudpConfig {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn max_payload_len(&self) -> usize {
        (self.max_datagram_size - PacketHeader::SERIALIZED_LEN)
            .min(u16::MAX as usize)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= PacketHeader::SERIALIZED_LEN {
            bail!("max datagram size {} does not leave room for a payload", self.max_datagram_size);
        }
        if self.default_queue_size == 0 {
            bail!("default queue size must be positive");
        }
        if self.max_queue_size < self.default_queue_size {
            bail!("max queue size {} is smaller than the default queue size {}", self.max_queue_size, self.default_queue_size);
        }
        if self.receive_window == 0 || self.receive_window > u32::MAX / 4 {
            bail!("receive window {} is out of range", self.receive_window);
        }
        if self.max_port_attempts == 0 {
            bail!("max port attempts must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.inbound_queue_size == 0 {
            bail!("inbound queue size must be positive");
        }
        if self.disconnect_timeout <= self.keep_alive_interval {
            bail!("disconnect timeout {:?} must be longer than the keep-alive interval {:?}", self.disconnect_timeout, self.keep_alive_interval);
        }

        Ok(())
    }
}
