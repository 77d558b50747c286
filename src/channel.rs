use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::TrudpConfig;
use crate::dispatcher::DispatchContext;
use crate::error::TrudpError;
use crate::events::{DisconnectReason, TrudpEvent};
use crate::packet::{Packet, PacketType};
use crate::packet_id::PacketId;
use crate::receive_queue::ReceiveQueue;
use crate::rtt::RttEstimator;
use crate::send_queue::{SendQueue, SendQueueEntry};
use crate::stats::{ChannelStats, RateMeter, Rates};

/// Identifies a channel: the peer's socket address plus the logical channel number
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub addr: SocketAddr,
    pub channel: u8,
}

impl ChannelKey {
    pub fn new(addr: SocketAddr, channel: u8) -> ChannelKey {
        ChannelKey { addr, channel }
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.channel)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// created, but packets were not exchanged in both directions yet
    Fresh,
    Connected,
    Closed,
}

pub type WriteReply = oneshot::Sender<Result<usize, TrudpError>>;

/// A write that waits for room in the send queue
#[derive(Debug)]
pub struct PendingWrite {
    pub payload: Bytes,
    pub reply: WriteReply,
}

#[derive(Debug)]
struct PendingReset {
    packet: Bytes,
    deadline: Instant,
    attempts: u32,
}

/// The state of one logical connection. A channel is owned by the
///  [`ChannelTable`](crate::dispatcher::ChannelTable) and only ever touched from inside the kernel
///  task, with everything it sends or reports going through the [`DispatchContext`].
///
/// DATA packets carry consecutive ids per direction. The first DATA packet of a stream has id 0,
///  and the sender does not send further DATA packets before that first one is acknowledged, so
///  the receiver always sees the stream start first. A receiver that has not seen a stream start
///  (`expected` is 0) answers other DATA packets with a RESET, asking the peer to restart its
///  stream.
#[derive(Debug)]
pub struct Channel {
    key: ChannelKey,
    generation: u64,
    state: ChannelState,

    next_send_id: PacketId,
    send_queue: SendQueue,
    write_queue: VecDeque<PendingWrite>,

    expected: PacketId,
    /// the peer's timestamp on the stream start that was accepted, for telling resends of it
    ///  from a restarted stream
    stream_start_timestamp: Option<u32>,
    receive_queue: ReceiveQueue,
    pending_reset: Option<PendingReset>,

    rtt: RttEstimator,
    has_sent: bool,
    has_received: bool,
    last_sent: Instant,
    last_received: Instant,
    rate_meter: RateMeter,

    packets_sent: u64,
    bytes_sent: u64,
    packets_received: u64,
    bytes_received: u64,
    acks_received: u64,
    dropped: u64,
    repeated: u64,
}

impl Channel {
    pub fn new(key: ChannelKey, generation: u64, config: &TrudpConfig, now: Instant) -> Channel {
        Channel {
            key,
            generation,
            state: ChannelState::Fresh,
            next_send_id: PacketId::STREAM_START,
            send_queue: SendQueue::new(config.default_queue_size),
            write_queue: VecDeque::new(),
            expected: PacketId::STREAM_START,
            stream_start_timestamp: None,
            receive_queue: ReceiveQueue::default(),
            pending_reset: None,
            rtt: RttEstimator::default(),
            has_sent: false,
            has_received: false,
            last_sent: now,
            last_received: now,
            rate_meter: RateMeter::new(now),
            packets_sent: 0,
            bytes_sent: 0,
            packets_received: 0,
            bytes_received: 0,
            acks_received: 0,
            dropped: 0,
            repeated: 0,
        }
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn on_packet(&mut self, ctx: &mut DispatchContext, packet: &Packet) {
        trace!("{}: received {:?} #{}", self.key, packet.header().packet_type, packet.header().id);

        self.has_received = true;
        self.last_received = ctx.now;

        match packet.header().packet_type {
            PacketType::Data => self.on_data(ctx, packet),
            PacketType::Ack => self.on_ack(ctx, packet),
            PacketType::Reset => self.on_reset(ctx, packet),
            PacketType::AckReset => self.on_ack_reset(ctx),
            PacketType::Ping => self.transmit(ctx, packet.ack_ping()),
            PacketType::AckPing => self.on_ack_ping(ctx, packet),
        }

        self.check_connected(ctx);
    }

    fn on_data(&mut self, ctx: &mut DispatchContext, packet: &Packet) {
        let header = packet.header();

        if header.id.is_stream_start() {
            if !self.expected.is_stream_start() {
                if self.stream_start_timestamp == Some(header.timestamp) {
                    trace!("{}: duplicate stream start", self.key);
                    self.dropped += 1;
                    self.transmit(ctx, packet.ack());
                    return;
                }
                debug!("{}: peer restarted its stream - resetting", self.key);
                self.reset_local(ctx);
            }

            self.pending_reset = None;
            self.stream_start_timestamp = Some(header.timestamp);
            self.accept(ctx, packet);
            return;
        }

        if self.expected.is_stream_start() {
            if self.pending_reset.is_none() {
                debug!("{}: received #{} before the stream start - sending RESET", self.key, header.id);
                let reset = Packet::reset(self.key.channel, ctx.timestamp());
                let timeout = self.retransmit_timeout(ctx);
                self.pending_reset = Some(PendingReset {
                    packet: reset.clone(),
                    deadline: ctx.now + timeout,
                    attempts: 0,
                });
                self.transmit(ctx, reset);
                ctx.emit(TrudpEvent::ResetSent(self.key));
            }
            return;
        }

        if let Some(stream_start) = self.stream_start_timestamp {
            if (stream_start.wrapping_sub(header.timestamp) as i32) > 0 {
                trace!("{}: #{} belongs to a previous stream - dropping", self.key, header.id);
                self.dropped += 1;
                return;
            }
        }

        let distance = self.expected.distance_to(header.id);
        if distance == 0 {
            self.accept(ctx, packet);
        }
        else if distance < 0 {
            trace!("{}: #{} was delivered already", self.key, header.id);
            self.dropped += 1;
            self.transmit(ctx, packet.ack());
        }
        else if distance > ctx.config.receive_window as i64 {
            trace!("{}: #{} is beyond the receive window - dropping", self.key, header.id);
            self.dropped += 1;
        }
        else {
            if !self.receive_queue.insert(header.id, packet.payload()) {
                trace!("{}: #{} is buffered already", self.key, header.id);
                self.dropped += 1;
            }
            self.transmit(ctx, packet.ack());
        }
    }

    /// ACK and deliver the expected packet, followed by all buffered packets that are contiguous to it
    fn accept(&mut self, ctx: &mut DispatchContext, packet: &Packet) {
        self.transmit(ctx, packet.ack());
        // Connected precedes the first Data event
        self.check_connected(ctx);

        self.expected = packet.header().id.next();
        self.deliver(ctx, packet.payload());

        while let Some(payload) = self.receive_queue.pop_in_order(&mut self.expected) {
            self.deliver(ctx, payload);
        }
    }

    fn deliver(&mut self, ctx: &mut DispatchContext, payload: Bytes) {
        self.packets_received += 1;
        self.bytes_received += payload.len() as u64;
        ctx.emit(TrudpEvent::Data { key: self.key, payload });
    }

    fn on_ack(&mut self, ctx: &mut DispatchContext, packet: &Packet) {
        self.acks_received += 1;

        match self.send_queue.remove(packet.header().id) {
            Some(entry) => {
                // a resent packet's ACK can not be attributed to one of its transmissions
                if entry.attempts == 0 {
                    self.rtt.on_sample(ctx.clock.elapsed_since(packet.header().timestamp, ctx.now));
                }
                self.flush_write_queue(ctx);
            }
            None => {
                trace!("{}: ACK for #{} which is not pending - ignoring", self.key, packet.header().id);
            }
        }
    }

    fn on_ack_ping(&mut self, ctx: &mut DispatchContext, packet: &Packet) {
        let rtt = ctx.clock.elapsed_since(packet.header().timestamp, ctx.now);
        self.rtt.on_sample(rtt);
        if ctx.config.ack_ping_events {
            ctx.emit(TrudpEvent::GotAckPing { key: self.key, rtt });
        }
    }

    /// The peer does not know where our stream is: start over sending
    fn on_reset(&mut self, ctx: &mut DispatchContext, packet: &Packet) {
        debug!("{}: received RESET", self.key);
        self.transmit(ctx, packet.ack_reset());

        self.send_queue.clear();
        self.next_send_id = PacketId::STREAM_START;
        ctx.emit(TrudpEvent::ResetLocal(self.key));

        self.flush_write_queue(ctx);
    }

    /// The peer restarts its stream as we asked it to. The receive direction is only reset if a RESET
    ///  of ours is pending, any other ACK_RESET is ignored.
    fn on_ack_reset(&mut self, ctx: &mut DispatchContext) {
        if self.pending_reset.take().is_none() {
            trace!("{}: ACK_RESET without pending RESET - ignoring", self.key);
            return;
        }

        debug!("{}: RESET was acknowledged", self.key);
        self.receive_queue.clear();
        self.expected = PacketId::STREAM_START;
        self.stream_start_timestamp = None;
        ctx.emit(TrudpEvent::ResetLocal(self.key));
    }

    /// Start over in both directions
    fn reset_local(&mut self, ctx: &mut DispatchContext) {
        self.send_queue.clear();
        self.next_send_id = PacketId::STREAM_START;

        self.receive_queue.clear();
        self.expected = PacketId::STREAM_START;
        self.stream_start_timestamp = None;
        self.pending_reset = None;

        ctx.emit(TrudpEvent::ResetLocal(self.key));
        self.flush_write_queue(ctx);
    }

    /// Sends the payload right away if the send queue has room, parks it otherwise. The reply is
    ///  sent once the payload is in the send queue.
    pub fn write(&mut self, ctx: &mut DispatchContext, payload: Bytes, reply: WriteReply) {
        if self.state == ChannelState::Closed {
            let _ = reply.send(Err(TrudpError::ConnectionClosed(self.key)));
            return;
        }

        if self.write_queue.is_empty() && self.can_send_data() {
            let len = self.send_data(ctx, payload);
            let _ = reply.send(Ok(len));
        }
        else if self.write_queue.len() < ctx.config.max_write_queue {
            trace!("{}: send queue is full - parking write", self.key);
            self.write_queue.push_back(PendingWrite { payload, reply });
        }
        else {
            debug!("{}: send queue and write queue are full", self.key);
            let _ = reply.send(Err(TrudpError::QueueFull(self.key)));
        }

        self.check_connected(ctx);
    }

    /// Further DATA packets wait until the peer acknowledged the stream start
    fn can_send_data(&self) -> bool {
        !self.send_queue.is_full() && !self.send_queue.contains(PacketId::STREAM_START)
    }

    fn flush_write_queue(&mut self, ctx: &mut DispatchContext) {
        while self.can_send_data() {
            let Some(write) = self.write_queue.pop_front() else {
                break;
            };
            let len = self.send_data(ctx, write.payload);
            let _ = write.reply.send(Ok(len));
        }
    }

    fn send_data(&mut self, ctx: &mut DispatchContext, payload: Bytes) -> usize {
        let id = self.next_send_id;
        self.next_send_id = id.next();

        let packet = Packet::data(self.key.channel, id, ctx.timestamp(), &payload);
        let deadline = ctx.now + self.retransmit_timeout(ctx);
        self.send_queue.push(SendQueueEntry {
            id,
            packet: packet.clone(),
            deadline,
            attempts: 0,
        });

        self.packets_sent += 1;
        self.bytes_sent += payload.len() as u64;
        self.rate_meter.record_sent();

        trace!("{}: sending #{}", self.key, id);
        self.transmit(ctx, packet);
        payload.len()
    }

    pub fn ping(&mut self, ctx: &mut DispatchContext) {
        let ping = Packet::ping(self.key.channel, ctx.timestamp(), b"ping");
        self.transmit(ctx, ping);
        self.check_connected(ctx);
    }

    fn transmit(&mut self, ctx: &mut DispatchContext, packet: Bytes) {
        self.has_sent = true;
        self.last_sent = ctx.now;
        ctx.send(self.key.addr, packet);
    }

    fn retransmit_timeout(&self, ctx: &DispatchContext) -> std::time::Duration {
        self.rtt.retransmit_timeout(ctx.config.max_rtt, ctx.config.base_retransmit_margin)
    }

    fn check_connected(&mut self, ctx: &mut DispatchContext) {
        if self.state == ChannelState::Fresh && self.has_sent && self.has_received {
            debug!("{}: connected", self.key);
            self.state = ChannelState::Connected;
            ctx.emit(TrudpEvent::Connected(self.key));
        }
    }

    /// Periodic housekeeping: resends, keep-alive, timeout and queue tuning. Returns the reason if
    ///  the channel should be destroyed.
    pub fn on_tick(&mut self, ctx: &mut DispatchContext) -> Option<DisconnectReason> {
        let now = ctx.now;

        if now.saturating_duration_since(self.last_received) >= ctx.config.disconnect_timeout {
            debug!("{}: nothing received for {:?}", self.key, ctx.config.disconnect_timeout);
            return Some(DisconnectReason::Timeout);
        }

        let deadline = now + self.retransmit_timeout(ctx);
        let mut num_resent = 0;
        for entry in self.send_queue.expired_mut(now) {
            if entry.attempts >= ctx.config.max_resend_attempts {
                debug!("{}: #{} was not acknowledged after {} resends", self.key, entry.id, entry.attempts);
                return Some(DisconnectReason::ResendExhausted);
            }
            trace!("{}: resending #{}", self.key, entry.id);
            entry.resend(deadline);
            ctx.send(self.key.addr, entry.packet.clone());
            num_resent += 1;
        }
        if num_resent > 0 {
            self.repeated += num_resent;
            for _ in 0..num_resent {
                self.rate_meter.record_repeated();
            }
            self.last_sent = now;
        }

        if let Some(reset) = &mut self.pending_reset {
            if reset.deadline <= now {
                if reset.attempts >= ctx.config.max_resend_attempts {
                    debug!("{}: RESET was not acknowledged after {} resends", self.key, reset.attempts);
                    return Some(DisconnectReason::ResetExhausted);
                }
                reset.attempts += 1;
                reset.deadline = deadline;
                let packet = reset.packet.clone();
                self.transmit(ctx, packet);
            }
        }

        if now.saturating_duration_since(self.last_sent) >= ctx.config.keep_alive_interval {
            trace!("{}: idle - sending PING", self.key);
            self.ping(ctx);
        }

        if let Some(rates) = self.rate_meter.roll(now) {
            if ctx.config.auto_tune_queue_size {
                self.tune_queue_size(ctx.config, rates);
                self.flush_write_queue(ctx);
            }
        }

        None
    }

    /// Grows the send queue limit for fast senders on a clean link and shrinks it when many packets
    ///  need resending
    fn tune_queue_size(&mut self, config: &TrudpConfig, rates: Rates) {
        if rates.sent_per_second <= 30 {
            return;
        }

        let limit = self.send_queue.max_size();
        let is_full = self.send_queue.is_full();

        if limit < config.max_queue_size && rates.repeated_per_second == 0 && is_full {
            let new_limit = (limit + 8).min(config.max_queue_size);
            debug!("{}: growing send queue limit to {}", self.key, new_limit);
            self.send_queue.set_max_size(new_limit);
        }
        else if limit > config.default_queue_size
            && (rates.repeated_per_second > 20 || (rates.repeated_per_second > 10 && is_full))
        {
            let new_limit = limit.saturating_sub(8).max(config.default_queue_size);
            debug!("{}: shrinking send queue limit to {}", self.key, new_limit);
            self.send_queue.set_max_size(new_limit);
        }
    }

    /// Releases all state. Parked writes fail, and a disconnect is reported if the channel was
    ///  connected.
    pub fn destroy(&mut self, ctx: &mut DispatchContext, reason: DisconnectReason) {
        let was_connected = self.state == ChannelState::Connected;
        self.state = ChannelState::Closed;

        for write in self.write_queue.drain(..) {
            let _ = write.reply.send(Err(TrudpError::ConnectionClosed(self.key)));
        }
        self.send_queue.clear();
        self.receive_queue.clear();
        self.pending_reset = None;

        debug!("{}: destroyed ({})", self.key, reason);
        if was_connected {
            ctx.emit(TrudpEvent::Disconnected { key: self.key, reason });
        }
    }

    pub fn stats(&self) -> ChannelStats {
        let rates = self.rate_meter.last();
        ChannelStats {
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            packets_received: self.packets_received,
            bytes_received: self.bytes_received,
            acks_received: self.acks_received,
            dropped: self.dropped,
            repeated: self.repeated,
            last_rtt: self.rtt.last(),
            smoothed_rtt: self.rtt.smoothed(),
            send_queue_len: self.send_queue.len(),
            receive_queue_len: self.receive_queue.len(),
            write_queue_len: self.write_queue.len(),
            max_queue_size: self.send_queue.max_size(),
            send_rate: rates.sent_per_second,
            repeat_rate: rates.repeated_per_second,
            connected: self.state == ChannelState::Connected,
        }
    }
}
