use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::packet_id::PacketId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    Reset = 2,
    AckReset = 3,
    Ping = 4,
    AckPing = 5,
}

impl PacketType {
    /// ACK and ACK_RESET are pure header packets, all other kinds may carry a payload
    pub fn carries_payload(self) -> bool {
        !matches!(self, PacketType::Ack | PacketType::AckReset)
    }

    /// only these packet kinds may create a channel on the receiving side
    pub fn may_open_channel(self) -> bool {
        matches!(self, PacketType::Data | PacketType::Ping)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub channel: u8,
    pub id: PacketId,
    pub packet_type: PacketType,
    /// sender's millisecond clock, echoed in ACK, ACK_RESET and ACK_PING
    pub timestamp: u32,
    pub payload_len: u16,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION: u8 = 1;
    pub const SERIALIZED_LEN: usize = 12;
    pub const MAX_CHANNEL: u8 = 0x0f;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8((Self::PROTOCOL_VERSION << 4) | (self.channel & Self::MAX_CHANNEL));
        buf.put_u32_le(self.id.to_raw());
        buf.put_u8(self.packet_type.into());
        buf.put_u32_le(self.timestamp);
        buf.put_u16_le(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet of {} bytes is shorter than the header", buf.remaining());
        }

        let version_and_channel = buf.get_u8();
        let version = version_and_channel >> 4;
        if version != Self::PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let id = PacketId::from_raw(buf.get_u32_le());
        let raw_type = buf.get_u8();
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown packet type {}", raw_type))?;
        let timestamp = buf.get_u32_le();
        let payload_len = buf.get_u16_le();

        Ok(PacketHeader {
            channel: version_and_channel & Self::MAX_CHANNEL,
            id,
            packet_type,
            timestamp,
            payload_len,
        })
    }
}

/// A structurally valid packet, i.e. a parsed header together with the datagram it came from.
///
/// The only way to get a [`Packet`] for received bytes is [`Packet::parse`], so payload access
///  always happens after validation.
#[derive(Clone, Debug)]
pub struct Packet {
    header: PacketHeader,
    buf: Bytes,
}

impl Packet {
    pub fn parse(buf: Bytes) -> anyhow::Result<Packet> {
        let header = PacketHeader::deser(&mut buf.as_ref())?;

        let actual_payload_len = buf.len() - PacketHeader::SERIALIZED_LEN;
        if header.payload_len as usize != actual_payload_len {
            bail!("declared payload length {} does not match actual payload length {}", header.payload_len, actual_payload_len);
        }
        if !header.packet_type.carries_payload() && actual_payload_len != 0 {
            bail!("{:?} packet must not carry a payload", header.packet_type);
        }

        Ok(Packet { header, buf })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> Bytes {
        self.buf.slice(PacketHeader::SERIALIZED_LEN..)
    }

    pub fn data(channel: u8, id: PacketId, timestamp: u32, payload: &[u8]) -> Bytes {
        encode(channel, id, PacketType::Data, timestamp, payload)
    }

    pub fn ping(channel: u8, timestamp: u32, payload: &[u8]) -> Bytes {
        encode(channel, PacketId::STREAM_START, PacketType::Ping, timestamp, payload)
    }

    pub fn reset(channel: u8, timestamp: u32) -> Bytes {
        encode(channel, PacketId::STREAM_START, PacketType::Reset, timestamp, &[])
    }

    /// ACK to this (DATA) packet: the same header with the packet type rewritten and no payload
    pub fn ack(&self) -> Bytes {
        self.echo(PacketType::Ack, &[])
    }

    pub fn ack_reset(&self) -> Bytes {
        self.echo(PacketType::AckReset, &[])
    }

    /// ACK_PING echoes the PING's payload along with its header
    pub fn ack_ping(&self) -> Bytes {
        let payload = self.payload();
        self.echo(PacketType::AckPing, &payload)
    }

    fn echo(&self, packet_type: PacketType, payload: &[u8]) -> Bytes {
        encode(self.header.channel, self.header.id, packet_type, self.header.timestamp, payload)
    }
}

fn encode(channel: u8, id: PacketId, packet_type: PacketType, timestamp: u32, payload: &[u8]) -> Bytes {
    debug_assert!(channel <= PacketHeader::MAX_CHANNEL);
    debug_assert!(payload.len() <= u16::MAX as usize, "payload length is checked before encoding");

    let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
    PacketHeader {
        channel,
        id,
        packet_type,
        timestamp,
        payload_len: payload.len() as u16,
    }.ser(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Structural check of a received buffer: long enough for the header, a known protocol version and
///  packet type, and a payload that matches the declared length.
pub fn validate(buf: &[u8]) -> bool {
    let header = match PacketHeader::deser(&mut &buf[..]) {
        Ok(header) => header,
        Err(_) => return false,
    };
    let actual_payload_len = buf.len() - PacketHeader::SERIALIZED_LEN;

    header.payload_len as usize == actual_payload_len
        && (header.packet_type.carries_payload() || actual_payload_len == 0)
}

pub fn decode_header(buf: &[u8]) -> anyhow::Result<PacketHeader> {
    PacketHeader::deser(&mut &buf[..])
}
