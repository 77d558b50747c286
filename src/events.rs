use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::ChannelKey;

pub type EventReceiver = mpsc::UnboundedReceiver<TrudpEvent>;
pub type EventSender = mpsc::UnboundedSender<TrudpEvent>;

/// Everything the end point reports to the application, in the order it happened
#[derive(Clone, Debug, PartialEq)]
pub enum TrudpEvent {
    /// the socket is bound and the kernel is running
    Initialized { local_addr: SocketAddr },
    /// the channel has exchanged packets in both directions
    Connected(ChannelKey),
    /// only emitted for channels that were connected before
    Disconnected { key: ChannelKey, reason: DisconnectReason },
    /// a payload, delivered strictly in send order per channel
    Data { key: ChannelKey, payload: Bytes },
    /// the channel's sequence state was reset, either on request of the peer or after a reset
    ///  that this side requested was acknowledged
    ResetLocal(ChannelKey),
    /// this side received data it could not place and asked the peer to restart its stream
    ResetSent(ChannelKey),
    GotAckPing { key: ChannelKey, rtt: Duration },
    /// the end point stopped; `error` is set if this was caused by a socket failure
    Terminated { error: Option<String> },
}

impl TrudpEvent {
    pub fn key(&self) -> Option<ChannelKey> {
        match self {
            TrudpEvent::Connected(key)
            | TrudpEvent::Disconnected { key, .. }
            | TrudpEvent::Data { key, .. }
            | TrudpEvent::ResetLocal(key)
            | TrudpEvent::ResetSent(key)
            | TrudpEvent::GotAckPing { key, .. } => Some(*key),
            TrudpEvent::Initialized { .. }
            | TrudpEvent::Terminated { .. } => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// closed through the local API
    Closed,
    /// nothing was received for the disconnect timeout
    Timeout,
    /// a DATA packet was not acknowledged after the maximum number of resends
    ResendExhausted,
    /// a RESET was not acknowledged after the maximum number of resends
    ResetExhausted,
    EndPointShutdown,
    SocketFailure,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ResendExhausted => "resend attempts exhausted",
            DisconnectReason::ResetExhausted => "reset attempts exhausted",
            DisconnectReason::EndPointShutdown => "end point shutdown",
            DisconnectReason::SocketFailure => "socket failure",
        };
        write!(f, "{}", s)
    }
}
