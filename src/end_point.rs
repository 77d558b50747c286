use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::ChannelKey;
use crate::config::{PortPolicy, TrudpConfig};
use crate::dispatcher::ChannelTable;
use crate::error::TrudpError;
use crate::events::{EventReceiver, TrudpEvent};
use crate::kernel::{receive_loop, Command, Kernel};
use crate::packet::PacketHeader;
use crate::rtt::Clock;
use crate::send_socket::SendSocket;
use crate::stats::{ChannelStats, EndPointStats};

/// EndPoint is the place where all other parts of the protocol come together: It owns the UDP
///  socket and the kernel task that all channels live in, and it has the API for application code
///  to open channels. Everything that happens is reported through the [`EventReceiver`] that is
///  returned from [`EndPoint::bind`].
///
/// Dropping the end point stops its tasks without further events, [`EndPoint::shutdown`] stops
///  them gracefully.
pub struct EndPoint {
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    kernel_handle: JoinHandle<()>,
    receive_handle: JoinHandle<()>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.kernel_handle.abort();
        self.receive_handle.abort();
    }
}

impl EndPoint {
    pub async fn bind(config: TrudpConfig) -> anyhow::Result<(EndPoint, EventReceiver)> {
        config.validate()?;

        let socket = Arc::new(bind_socket(&config).await?);
        Self::start(config, socket.clone(), Arc::new(socket))
    }

    /// Starts the kernel and the receive loop on an existing socket, with a separate abstraction
    ///  for sending so it can be intercepted
    pub(crate) fn start(config: TrudpConfig, receive_socket: Arc<UdpSocket>, send_socket: Arc<dyn SendSocket>) -> anyhow::Result<(EndPoint, EventReceiver)> {
        let local_addr = receive_socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(config.inbound_queue_size);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size);

        let _ = events_tx.send(TrudpEvent::Initialized { local_addr });

        let table = ChannelTable::new(config.clone(), Clock::system(Instant::now()));
        let kernel = Kernel::new(table, send_socket, events_tx, config.tick_interval);
        let kernel_handle = tokio::spawn(kernel.run(commands_rx, inbound_rx));
        let receive_handle = tokio::spawn(receive_loop(receive_socket, config.max_datagram_size, inbound_tx));

        Ok((EndPoint {
            local_addr,
            commands: commands_tx,
            kernel_handle,
            receive_handle,
        }, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Opens the channel to `addr` with channel number `channel`, or returns a handle to it if
    ///  it exists already
    pub async fn connect(&self, addr: SocketAddr, channel: u8) -> Result<ConnectionHandle, TrudpError> {
        if channel > PacketHeader::MAX_CHANNEL {
            return Err(TrudpError::InvalidChannel(channel));
        }

        let key = ChannelKey::new(addr, channel);
        let (reply, generation) = oneshot::channel();
        self.commands.send(Command::Connect { key, reply }).await
            .map_err(|_| TrudpError::EndPointClosed)?;
        let generation = generation.await
            .map_err(|_| TrudpError::EndPointClosed)?;

        debug!("connected handle for {} (generation {})", key, generation);
        Ok(ConnectionHandle {
            key,
            generation,
            commands: self.commands.clone(),
        })
    }

    pub async fn connect_host(&self, host: &str, port: u16, channel: u8) -> Result<ConnectionHandle, TrudpError> {
        let addr = lookup_host((host, port)).await
            .map_err(|_| TrudpError::Resolve(format!("{}:{}", host, port)))?
            .next()
            .ok_or_else(|| TrudpError::Resolve(format!("{}:{}", host, port)))?;
        self.connect(addr, channel).await
    }

    pub async fn stats(&self) -> Result<EndPointStats, TrudpError> {
        let (reply, stats) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).await
            .map_err(|_| TrudpError::EndPointClosed)?;
        stats.await
            .map_err(|_| TrudpError::EndPointClosed)
    }

    /// Destroys all channels, reporting them as disconnected, and stops the end point after a
    ///  final [`TrudpEvent::Terminated`]
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        info!("end point {:?} is shut down", self.local_addr);
    }
}

/// Binds the socket, trying the following ports if the configured one is in use and the port
///  policy allows it
async fn bind_socket(config: &TrudpConfig) -> anyhow::Result<UdpSocket> {
    let mut addr = config.bind_addr;
    let mut attempts = 1;

    loop {
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == ErrorKind::AddrInUse
                && config.port_policy == PortPolicy::Increment
                && addr.port() != 0 =>
            {
                if attempts >= config.max_port_attempts || addr.port() == u16::MAX {
                    bail!("no free port in {} attempts starting at {:?}", attempts, config.bind_addr);
                }
                debug!("port {} is in use, trying the next one", addr.port());
                addr.set_port(addr.port() + 1);
                attempts += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("binding UDP socket to {:?}", addr));
            }
        }
    }
}

/// A handle to one channel of an [`EndPoint`]. Handles are cheap to clone; all of them refer to
///  the channel that existed when [`EndPoint::connect`] was called, and they fail with
///  [`TrudpError::ConnectionClosed`] once that channel is destroyed.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    key: ChannelKey,
    generation: u64,
    commands: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Sends a message. This returns once the message is in the channel's send queue (not when it
    ///  was acknowledged), waiting for room in the queue if necessary.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<usize, TrudpError> {
        let (reply, result) = oneshot::channel();
        self.commands.send(Command::Write {
            key: self.key,
            generation: self.generation,
            payload: payload.into(),
            reply,
        }).await
            .map_err(|_| TrudpError::ConnectionClosed(self.key))?;

        result.await
            .map_err(|_| TrudpError::ConnectionClosed(self.key))?
    }

    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close { key: self.key, generation: self.generation }).await;
    }

    pub async fn stats(&self) -> Result<ChannelStats, TrudpError> {
        let (reply, stats) = oneshot::channel();
        self.commands.send(Command::ChannelStats { key: self.key, generation: self.generation, reply }).await
            .map_err(|_| TrudpError::ConnectionClosed(self.key))?;
        stats.await
            .map_err(|_| TrudpError::ConnectionClosed(self.key))?
            .ok_or(TrudpError::ConnectionClosed(self.key))
    }
}
