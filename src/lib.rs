//! TR-UDP is a small reliable transport on top of UDP: it delivers discrete messages in order,
//!  acknowledging and resending them as needed, and it multiplexes any number of logical
//!  connections ('channels') over a single UDP socket.
//!
//! A channel is identified by the peer's socket address and a channel number `0..=15`. There is no
//!  handshake: a channel is created by the first DATA or PING packet that arrives for it, or
//!  explicitly by [`EndPoint::connect`].
//!
//! ## Packet format
//!
//! All numbers are little endian.
//!
//! ```ascii
//!  0: protocol version (high nibble, currently 1) | channel number (low nibble)
//!  1: packet id (u32) - sequence number for DATA, echoed by ACK, 0 for all other kinds
//!  5: packet type (u8):
//!     * 0 DATA
//!     * 1 ACK - header of the acknowledged DATA packet, without payload
//!     * 2 RESET - the receiver lost track of the sender's stream and asks it to start over
//!     * 3 ACK_RESET - header of the RESET, without payload
//!     * 4 PING
//!     * 5 ACK_PING - header and payload of the PING
//!  6: timestamp (u32) - sender's clock in milliseconds, echoed by all ACK kinds for RTT measurement
//! 10: payload length (u16)
//! 12: payload
//! ```
//!
//! ## Sequencing
//!
//! DATA ids are assigned per channel and direction. The first DATA packet of a stream has id 0;
//!  the sender waits for its ACK before sending more, and after that ids run from 1, wrapping
//!  from `u32::MAX` to 1. A receiver that sees a DATA packet without having seen the stream start
//!  replies with RESET, and the sender starts over with id 0.
//!
//! Unacknowledged DATA packets are resent after the smoothed round trip time (clamped) plus a
//!  margin. A channel is destroyed if a packet is not acknowledged after a maximum number of
//!  resends, or if nothing is received for the disconnect timeout; idle channels send PINGs to
//!  keep each other alive.
//!
//! ## Concurrency
//!
//! All channel state is owned by a single kernel task. The application talks to it through
//!  [`EndPoint`] and [`ConnectionHandle`], which send messages to the kernel, and it receives
//!  payloads and lifecycle notifications as [`TrudpEvent`]s.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod end_point;
pub mod error;
pub mod events;
pub mod kernel;
pub mod packet;
pub mod packet_id;
pub mod receive_queue;
pub mod rtt;
pub mod send_queue;
pub mod send_socket;
pub mod stats;

pub use channel::ChannelKey;
pub use config::{PortPolicy, TrudpConfig};
pub use end_point::{ConnectionHandle, EndPoint};
pub use error::TrudpError;
pub use events::{DisconnectReason, EventReceiver, TrudpEvent};
pub use stats::{ChannelStats, EndPointStats};
