use thiserror::Error;

use crate::channel::ChannelKey;

/// Failures reported to callers of the [`EndPoint`](crate::EndPoint) and
///  [`ConnectionHandle`](crate::ConnectionHandle) APIs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrudpError {
    #[error("connection {0} is closed")]
    ConnectionClosed(ChannelKey),

    #[error("send and write queues of connection {0} are full")]
    QueueFull(ChannelKey),

    #[error("channel number {0} is out of range")]
    InvalidChannel(u8),

    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("end point is shut down")]
    EndPointClosed,

    #[error("could not resolve {0}")]
    Resolve(String),
}
