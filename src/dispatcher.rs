use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelKey, WriteReply};
use crate::config::TrudpConfig;
use crate::error::TrudpError;
use crate::events::{DisconnectReason, TrudpEvent};
use crate::packet::Packet;
use crate::rtt::Clock;
use crate::stats::{ChannelStats, EndPointStats};

/// Datagrams and events produced while processing one input. The kernel flushes them to the
///  socket and the event stream afterwards, so all state transitions are synchronous.
#[derive(Debug, Default)]
pub struct Outbox {
    pub datagrams: Vec<(SocketAddr, Bytes)>,
    pub events: Vec<TrudpEvent>,
}

/// Everything a channel needs from its environment while it handles one input
pub struct DispatchContext<'a> {
    pub now: Instant,
    pub config: &'a TrudpConfig,
    pub clock: Clock,
    pub out: &'a mut Outbox,
}

impl DispatchContext<'_> {
    pub fn timestamp(&self) -> u32 {
        self.clock.timestamp(self.now)
    }

    pub fn send(&mut self, to: SocketAddr, packet: Bytes) {
        self.out.datagrams.push((to, packet));
    }

    pub fn emit(&mut self, event: TrudpEvent) {
        self.out.events.push(event);
    }
}

/// The table of all channels of an end point. It is owned by the kernel task, and channels are
///  only reachable through it: by key for incoming packets, and by key plus generation for API
///  calls, so a handle never reaches a newer channel that happens to have the same key.
pub struct ChannelTable {
    config: Arc<TrudpConfig>,
    clock: Clock,
    channels: FxHashMap<ChannelKey, Channel>,
    next_generation: u64,
    malformed_packets: u64,
    send_errors: u64,
}

impl ChannelTable {
    pub fn new(config: Arc<TrudpConfig>, clock: Clock) -> ChannelTable {
        ChannelTable {
            config,
            clock,
            channels: FxHashMap::default(),
            next_generation: 1,
            malformed_packets: 0,
            send_errors: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    fn create_channel(&mut self, key: ChannelKey, now: Instant) -> &mut Channel {
        let generation = self.next_generation;
        self.next_generation += 1;
        debug!("creating channel {} (generation {})", key, generation);
        self.channels.entry(key)
            .or_insert_with(|| Channel::new(key, generation, &self.config, now))
    }

    pub fn on_datagram(&mut self, now: Instant, from: SocketAddr, buf: Bytes, out: &mut Outbox) {
        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed packet from {}: {}", from, e);
                self.malformed_packets += 1;
                return;
            }
        };

        let key = ChannelKey::new(from, packet.header().channel);
        if !self.channels.contains_key(&key) {
            if !packet.header().packet_type.may_open_channel() {
                trace!("dropping {:?} for unknown channel {}", packet.header().packet_type, key);
                return;
            }
            self.create_channel(key, now);
        }

        let mut ctx = DispatchContext {
            now,
            config: &self.config,
            clock: self.clock,
            out,
        };
        if let Some(channel) = self.channels.get_mut(&key) {
            channel.on_packet(&mut ctx, &packet);
        }
    }

    /// Returns the generation of the channel for `key`, creating it and sending a PING if it does
    ///  not exist yet
    pub fn connect(&mut self, now: Instant, key: ChannelKey, out: &mut Outbox) -> u64 {
        if let Some(channel) = self.channels.get(&key) {
            return channel.generation();
        }

        self.create_channel(key, now);
        let mut ctx = DispatchContext {
            now,
            config: &self.config,
            clock: self.clock,
            out,
        };
        match self.channels.get_mut(&key) {
            Some(channel) => {
                channel.ping(&mut ctx);
                channel.generation()
            }
            None => 0,
        }
    }

    pub fn write(&mut self, now: Instant, key: ChannelKey, generation: u64, payload: Bytes, reply: WriteReply, out: &mut Outbox) {
        let max = self.config.max_payload_len();
        if payload.len() > max {
            let _ = reply.send(Err(TrudpError::PayloadTooLarge { len: payload.len(), max }));
            return;
        }

        let mut ctx = DispatchContext {
            now,
            config: &self.config,
            clock: self.clock,
            out,
        };
        match self.channels.get_mut(&key) {
            Some(channel) if channel.generation() == generation => {
                channel.write(&mut ctx, payload, reply);
            }
            _ => {
                trace!("write to closed channel {}", key);
                let _ = reply.send(Err(TrudpError::ConnectionClosed(key)));
            }
        }
    }

    /// returns `false` if there was no such channel
    pub fn close(&mut self, now: Instant, key: ChannelKey, generation: u64, out: &mut Outbox) -> bool {
        match self.channels.get(&key) {
            Some(channel) if channel.generation() == generation => {}
            _ => return false,
        }
        self.destroy(now, key, DisconnectReason::Closed, out);
        true
    }

    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        let mut ctx = DispatchContext {
            now,
            config: &self.config,
            clock: self.clock,
            out: &mut *out,
        };

        let mut dead = Vec::new();
        for (key, channel) in self.channels.iter_mut() {
            if let Some(reason) = channel.on_tick(&mut ctx) {
                dead.push((*key, reason));
            }
        }

        for (key, reason) in dead {
            self.destroy(now, key, reason, out);
        }
    }

    /// Destroys all channels
    pub fn shutdown(&mut self, now: Instant, reason: DisconnectReason, out: &mut Outbox) {
        let mut keys = self.channels.keys().copied().collect::<Vec<_>>();
        keys.sort();
        for key in keys {
            self.destroy(now, key, reason, out);
        }
    }

    fn destroy(&mut self, now: Instant, key: ChannelKey, reason: DisconnectReason, out: &mut Outbox) {
        if let Some(mut channel) = self.channels.remove(&key) {
            let mut ctx = DispatchContext {
                now,
                config: &self.config,
                clock: self.clock,
                out,
            };
            channel.destroy(&mut ctx, reason);
        }
    }

    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    pub fn stats(&self) -> EndPointStats {
        let mut channels = self.channels.iter()
            .map(|(key, channel)| (*key, channel.stats()))
            .collect::<Vec<_>>();
        channels.sort_by_key(|(key, _)| *key);

        EndPointStats {
            channels,
            malformed_packets: self.malformed_packets,
            send_errors: self.send_errors,
        }
    }

    pub fn channel_stats(&self, key: ChannelKey, generation: u64) -> Option<ChannelStats> {
        self.channels.get(&key)
            .filter(|c| c.generation() == generation)
            .map(|c| c.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;
    use tokio::sync::oneshot;
    use crate::packet::PacketType;
    use crate::packet_id::PacketId;

    fn peer() -> SocketAddr {
        "10.0.0.1:7000".parse().unwrap()
    }

    fn table_with(config: TrudpConfig) -> (ChannelTable, Instant) {
        let now = Instant::now();
        (ChannelTable::new(Arc::new(config), Clock::new(now, 0)), now)
    }

    fn table() -> (ChannelTable, Instant) {
        table_with(TrudpConfig::default())
    }

    fn payloads(out: &mut Outbox) -> Vec<Bytes> {
        out.events.drain(..)
            .filter_map(|e| match e {
                TrudpEvent::Data { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[rstest]
    #[case::ack(Packet::parse(Packet::data(0, PacketId::from_raw(1), 0, b"")).unwrap().ack())]
    #[case::reset(Packet::reset(0, 0))]
    #[case::ack_reset(Packet::parse(Packet::reset(0, 0)).unwrap().ack_reset())]
    #[case::ack_ping(Packet::parse(Packet::ping(0, 0, b"ping")).unwrap().ack_ping())]
    fn test_packets_for_unknown_channel_are_dropped(#[case] buf: Bytes) {
        let (mut table, now) = table();
        let mut out = Outbox::default();

        table.on_datagram(now, peer(), buf, &mut out);

        assert!(table.is_empty());
        assert!(out.datagrams.is_empty());
        assert!(out.events.is_empty());
    }

    #[rstest]
    #[case::data(Packet::data(2, PacketId::STREAM_START, 0, b"x"), PacketType::Ack)]
    #[case::ping(Packet::ping(2, 0, b"ping"), PacketType::AckPing)]
    fn test_data_and_ping_create_channel(#[case] buf: Bytes, #[case] reply_type: PacketType) {
        let (mut table, now) = table();
        let mut out = Outbox::default();

        table.on_datagram(now, peer(), buf, &mut out);

        assert!(table.contains(&ChannelKey::new(peer(), 2)));
        assert_eq!(out.datagrams.len(), 1);
        let (to, reply) = out.datagrams.remove(0);
        assert_eq!(to, peer());
        assert_eq!(Packet::parse(reply).unwrap().header().packet_type, reply_type);
    }

    #[test]
    fn test_malformed_is_counted() {
        let (mut table, now) = table();
        let mut out = Outbox::default();

        table.on_datagram(now, peer(), Bytes::from_static(&[0x10, 1, 2]), &mut out);
        table.on_datagram(now, peer(), Bytes::from_static(&[0x10, 1,0,0,0, 9, 0,0,0,0, 0,0]), &mut out);

        assert!(table.is_empty());
        assert_eq!(table.stats().malformed_packets, 2);
    }

    #[test]
    fn test_channels_are_separated_by_address_and_number() {
        let (mut table, now) = table();
        let mut out = Outbox::default();
        let other_peer: SocketAddr = "10.0.0.2:7000".parse().unwrap();

        table.on_datagram(now, peer(), Packet::data(0, PacketId::STREAM_START, 0, b"a"), &mut out);
        table.on_datagram(now, peer(), Packet::data(1, PacketId::STREAM_START, 0, b"b"), &mut out);
        table.on_datagram(now, other_peer, Packet::data(0, PacketId::STREAM_START, 0, b"c"), &mut out);

        assert_eq!(table.len(), 3);
        let keys = out.events.iter()
            .filter(|e| matches!(e, TrudpEvent::Data { .. }))
            .filter_map(|e| e.key())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![
            ChannelKey::new(peer(), 0),
            ChannelKey::new(peer(), 1),
            ChannelKey::new(other_peer, 0),
        ]);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (mut table, now) = table();
        let mut out = Outbox::default();
        let key = ChannelKey::new(peer(), 0);

        let generation = table.connect(now, key, &mut out);
        assert_eq!(out.datagrams.len(), 1);
        assert_eq!(Packet::parse(out.datagrams[0].1.clone()).unwrap().header().packet_type, PacketType::Ping);

        assert_eq!(table.connect(now, key, &mut out), generation);
        assert_eq!(out.datagrams.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let (mut table, now) = table();
        let mut out = Outbox::default();
        let key = ChannelKey::new(peer(), 0);

        let old_generation = table.connect(now, key, &mut out);
        assert!(table.close(now, key, old_generation, &mut out));
        assert!(!table.close(now, key, old_generation, &mut out));

        let new_generation = table.connect(now, key, &mut out);
        assert_ne!(old_generation, new_generation);

        let (reply, mut result) = oneshot::channel();
        table.write(now, key, old_generation, Bytes::from_static(b"x"), reply, &mut out);
        assert_eq!(result.try_recv().unwrap(), Err(TrudpError::ConnectionClosed(key)));
        assert!(table.channel_stats(key, old_generation).is_none());
        assert!(table.channel_stats(key, new_generation).is_some());

        let (reply, mut result) = oneshot::channel();
        table.write(now, key, new_generation, Bytes::from_static(b"x"), reply, &mut out);
        assert_eq!(result.try_recv().unwrap(), Ok(1));
    }

    #[test]
    fn test_payload_too_large() {
        let (mut table, now) = table_with(TrudpConfig { max_datagram_size: 112, ..Default::default() });
        let mut out = Outbox::default();
        let key = ChannelKey::new(peer(), 0);
        let generation = table.connect(now, key, &mut out);

        let (reply, mut result) = oneshot::channel();
        table.write(now, key, generation, Bytes::from(vec![0u8; 101]), reply, &mut out);
        assert_eq!(result.try_recv().unwrap(), Err(TrudpError::PayloadTooLarge { len: 101, max: 100 }));

        let (reply, mut result) = oneshot::channel();
        table.write(now, key, generation, Bytes::from(vec![0u8; 100]), reply, &mut out);
        assert_eq!(result.try_recv().unwrap(), Ok(100));
    }

    #[test]
    fn test_close_emits_disconnect_for_connected_channel() {
        let (mut table, now) = table();
        let mut out = Outbox::default();
        let key = ChannelKey::new(peer(), 0);

        let generation = table.connect(now, key, &mut out);
        table.on_datagram(now, peer(), Packet::ping(0, 0, b"ping"), &mut out);
        assert_eq!(out.events, vec![TrudpEvent::Connected(key)]);
        out.events.clear();

        table.close(now, key, generation, &mut out);
        assert_eq!(out.events, vec![TrudpEvent::Disconnected { key, reason: DisconnectReason::Closed }]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_tick_destroys_timed_out_channels_only() {
        let (mut table, now) = table();
        let mut out = Outbox::default();
        let quiet = ChannelKey::new(peer(), 0);
        let busy = ChannelKey::new(peer(), 1);

        table.on_datagram(now, peer(), Packet::ping(0, 0, b"ping"), &mut out);
        table.on_datagram(now, peer(), Packet::ping(1, 0, b"ping"), &mut out);
        out.events.clear();

        let later = now + Duration::from_millis(2000);
        table.on_datagram(later, peer(), Packet::ping(1, 2000, b"ping"), &mut out);
        table.on_tick(later + Duration::from_millis(1000), &mut out);

        assert!(!table.contains(&quiet));
        assert!(table.contains(&busy));
        assert_eq!(out.events, vec![TrudpEvent::Disconnected { key: quiet, reason: DisconnectReason::Timeout }]);
    }

    #[test]
    fn test_shutdown_destroys_all_channels() {
        let (mut table, now) = table();
        let mut out = Outbox::default();

        table.on_datagram(now, peer(), Packet::ping(0, 0, b"ping"), &mut out);
        table.on_datagram(now, peer(), Packet::ping(1, 0, b"ping"), &mut out);
        out.events.clear();

        table.shutdown(now, DisconnectReason::EndPointShutdown, &mut out);

        assert!(table.is_empty());
        assert_eq!(out.events, vec![
            TrudpEvent::Disconnected { key: ChannelKey::new(peer(), 0), reason: DisconnectReason::EndPointShutdown },
            TrudpEvent::Disconnected { key: ChannelKey::new(peer(), 1), reason: DisconnectReason::EndPointShutdown },
        ]);
    }

    /// Any arrival order of a stream, with duplicates, is delivered exactly once and in order
    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(42)]
    #[case(4711)]
    fn test_shuffled_arrival_is_delivered_in_order(#[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut table, now) = table();
        let mut out = Outbox::default();

        let num_packets = 200u32;
        let mut arrival = (1..num_packets).collect::<Vec<_>>();
        for _ in 0..50 {
            arrival.push(rng.random_range(1..num_packets));
        }
        arrival.shuffle(&mut rng);

        table.on_datagram(now, peer(), Packet::data(0, PacketId::STREAM_START, 0, &0u32.to_le_bytes()), &mut out);
        for id in arrival {
            table.on_datagram(now, peer(), Packet::data(0, PacketId::from_raw(id), 0, &id.to_le_bytes()), &mut out);
        }

        let delivered = payloads(&mut out).into_iter()
            .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
            .collect::<Vec<_>>();
        assert_eq!(delivered, (0..num_packets).collect::<Vec<_>>());

        let stats = table.stats();
        assert_eq!(stats.channels[0].1.dropped, 50);
        assert_eq!(stats.channels[0].1.receive_queue_len, 0);
    }

    #[test]
    fn test_two_tables_exchange_data() {
        let a_addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let (mut a, now) = table();
        let (mut b, _) = table();
        let mut a_out = Outbox::default();
        let mut b_out = Outbox::default();

        let generation = a.connect(now, ChannelKey::new(b_addr, 5), &mut a_out);
        let mut results = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            let (reply, result) = oneshot::channel();
            a.write(now, ChannelKey::new(b_addr, 5), generation, Bytes::from_static(payload), reply, &mut a_out);
            results.push(result);
        }

        let mut delivered = Vec::new();
        for _ in 0..10 {
            for (_, buf) in a_out.datagrams.drain(..) {
                b.on_datagram(now, a_addr, buf, &mut b_out);
            }
            delivered.extend(payloads(&mut b_out));
            for (_, buf) in b_out.datagrams.drain(..) {
                a.on_datagram(now, b_addr, buf, &mut a_out);
            }
        }

        assert_eq!(delivered, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"three")]);
        for mut result in results {
            assert!(result.try_recv().unwrap().is_ok());
        }
        let a_stats = a.stats();
        assert_eq!(a_stats.channels[0].1.send_queue_len, 0);
        assert!(a_stats.channels[0].1.connected);
        assert!(b.stats().channels[0].1.connected);
    }

    /// passes datagrams back and forth until both sides are quiet, returning the events `to` emitted
    fn exchange(now: Instant, from: (&mut ChannelTable, SocketAddr, &mut Outbox), to: (&mut ChannelTable, SocketAddr, &mut Outbox)) -> Vec<TrudpEvent> {
        let (from, from_addr, from_out) = from;
        let (to, to_addr, to_out) = to;

        let mut events = Vec::new();
        for _ in 0..10 {
            for (_, buf) in from_out.datagrams.drain(..) {
                to.on_datagram(now, from_addr, buf, to_out);
            }
            events.extend(to_out.events.drain(..));
            for (_, buf) in to_out.datagrams.drain(..) {
                from.on_datagram(now, to_addr, buf, from_out);
            }
        }
        events
    }

    fn write_all(table: &mut ChannelTable, now: Instant, key: ChannelKey, payloads: &[&'static [u8]], out: &mut Outbox) {
        let generation = table.connect(now, key, out);
        for payload in payloads {
            let (reply, _) = oneshot::channel();
            table.write(now, key, generation, Bytes::from_static(payload), reply, out);
        }
    }

    #[test]
    fn test_restarted_peer_starts_a_new_stream() {
        let a_addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let t0 = Instant::now();
        let wall_millis = 1_700_000_000u32;

        let mut a = ChannelTable::new(Arc::new(TrudpConfig::default()), Clock::new(t0, wall_millis));
        let mut a_out = Outbox::default();

        let mut b = ChannelTable::new(Arc::new(TrudpConfig::default()), Clock::new(t0, wall_millis));
        let mut b_out = Outbox::default();
        let now = t0 + Duration::from_millis(5);
        write_all(&mut b, now, ChannelKey::new(a_addr, 1), &[b"old0", b"old1", b"old2"], &mut b_out);
        let events = exchange(now, (&mut b, b_addr, &mut b_out), (&mut a, a_addr, &mut a_out));
        assert_eq!(data_payloads(events), vec![Bytes::from_static(b"old0"), Bytes::from_static(b"old1"), Bytes::from_static(b"old2")]);

        // the peer process restarts on the same address a second later, its clock picking up wall time
        let restart = t0 + Duration::from_secs(1);
        let mut b2 = ChannelTable::new(Arc::new(TrudpConfig::default()), Clock::new(restart, wall_millis + 1000));
        let mut b2_out = Outbox::default();
        let now = restart + Duration::from_millis(5);
        write_all(&mut b2, now, ChannelKey::new(a_addr, 1), &[b"new0", b"new1"], &mut b2_out);
        let events = exchange(now, (&mut b2, b_addr, &mut b2_out), (&mut a, a_addr, &mut a_out));

        assert_eq!(events[0], TrudpEvent::ResetLocal(ChannelKey::new(b_addr, 1)));
        assert_eq!(data_payloads(events), vec![Bytes::from_static(b"new0"), Bytes::from_static(b"new1")]);
        assert_eq!(b2.stats().channels[0].1.send_queue_len, 0);
    }

    fn data_payloads(events: Vec<TrudpEvent>) -> Vec<Bytes> {
        events.into_iter()
            .filter_map(|e| match e {
                TrudpEvent::Data { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }
}
