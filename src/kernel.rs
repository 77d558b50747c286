use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelKey, WriteReply};
use crate::dispatcher::{ChannelTable, Outbox};
use crate::events::{DisconnectReason, EventSender, TrudpEvent};
use crate::send_socket::SendSocket;
use crate::stats::{ChannelStats, EndPointStats};

/// Requests from the API to the kernel
#[derive(Debug)]
pub enum Command {
    Connect { key: ChannelKey, reply: oneshot::Sender<u64> },
    Write { key: ChannelKey, generation: u64, payload: Bytes, reply: WriteReply },
    Close { key: ChannelKey, generation: u64 },
    Stats { reply: oneshot::Sender<EndPointStats> },
    ChannelStats { key: ChannelKey, generation: u64, reply: oneshot::Sender<Option<ChannelStats>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Input from the receive loop
#[derive(Debug)]
pub enum Inbound {
    Datagram { from: SocketAddr, buf: Bytes },
    ReadFailed(std::io::Error),
}

/// The single task that owns all channel state. API commands, received datagrams and timer ticks
///  are processed one at a time, and the datagrams and events each of them produces are flushed
///  before the next one is taken.
pub struct Kernel {
    table: ChannelTable,
    send_socket: Arc<dyn SendSocket>,
    events: EventSender,
    tick_interval: Duration,
}

impl Kernel {
    pub fn new(table: ChannelTable, send_socket: Arc<dyn SendSocket>, events: EventSender, tick_interval: Duration) -> Kernel {
        Kernel {
            table,
            send_socket,
            events,
            tick_interval,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbound: mpsc::Receiver<Inbound>) {
        info!("starting kernel");

        let mut ticks = time::interval(self.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut out = Outbox::default();
            let mut shutdown_reply = None;

            let keep_running = select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            shutdown_reply = self.on_command(cmd, &mut out);
                            shutdown_reply.is_none()
                        }
                        None => {
                            debug!("all command senders are gone");
                            self.terminate(DisconnectReason::EndPointShutdown, None, &mut out);
                            false
                        }
                    }
                }
                msg = inbound.recv() => {
                    match msg {
                        Some(Inbound::Datagram { from, buf }) => {
                            self.table.on_datagram(Instant::now(), from, buf, &mut out);
                            true
                        }
                        Some(Inbound::ReadFailed(e)) => {
                            self.terminate(DisconnectReason::SocketFailure, Some(e.to_string()), &mut out);
                            false
                        }
                        None => {
                            self.terminate(DisconnectReason::SocketFailure, Some("receive loop ended".to_string()), &mut out);
                            false
                        }
                    }
                }
                _ = ticks.tick() => {
                    self.table.on_tick(Instant::now(), &mut out);
                    true
                }
            };

            self.flush(out).await;
            if let Some(reply) = shutdown_reply {
                let _ = reply.send(());
            }
            if !keep_running {
                break;
            }
        }

        info!("kernel stopped");
    }

    /// returns the reply channel if this was a shutdown request, to be answered once the
    ///  resulting events are flushed
    fn on_command(&mut self, cmd: Command, out: &mut Outbox) -> Option<oneshot::Sender<()>> {
        let now = Instant::now();
        match cmd {
            Command::Connect { key, reply } => {
                let generation = self.table.connect(now, key, out);
                let _ = reply.send(generation);
            }
            Command::Write { key, generation, payload, reply } => {
                self.table.write(now, key, generation, payload, reply, out);
            }
            Command::Close { key, generation } => {
                if !self.table.close(now, key, generation, out) {
                    trace!("close for channel {} which is closed already", key);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.table.stats());
            }
            Command::ChannelStats { key, generation, reply } => {
                let _ = reply.send(self.table.channel_stats(key, generation));
            }
            Command::Shutdown { reply } => {
                self.terminate(DisconnectReason::EndPointShutdown, None, out);
                return Some(reply);
            }
        }
        None
    }

    fn terminate(&mut self, reason: DisconnectReason, error: Option<String>, out: &mut Outbox) {
        match &error {
            Some(e) => error!("terminating: {}", e),
            None => info!("shutting down"),
        }
        self.table.shutdown(Instant::now(), reason, out);
        out.events.push(TrudpEvent::Terminated { error });
    }

    async fn flush(&mut self, out: Outbox) {
        for (to, buf) in out.datagrams {
            if let Err(e) = self.send_socket.send_packet(to, &buf).await {
                warn!("error sending UDP packet to {:?}: {}", to, e);
                self.table.record_send_error();
            }
        }
        for event in out.events {
            if self.events.send(event).is_err() {
                trace!("event receiver is gone - discarding event");
            }
        }
    }
}

/// Reads datagrams from the socket and forwards them to the kernel
pub async fn receive_loop(socket: Arc<UdpSocket>, max_datagram_size: usize, inbound: mpsc::Sender<Inbound>) {
    info!("starting receive loop");

    let mut buf = vec![0u8; max_datagram_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((num_read, from)) => {
                trace!("received {} bytes from {:?}", num_read, from);
                let msg = Inbound::Datagram {
                    from,
                    buf: Bytes::copy_from_slice(&buf[..num_read]),
                };
                if inbound.send(msg).await.is_err() {
                    debug!("kernel is stopped - ending receive loop");
                    return;
                }
            }
            // ICMP errors for earlier sends are reported on some platforms and say nothing about this socket
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                debug!("ignoring socket error: {}", e);
            }
            Err(e) => {
                error!("socket error: {}", e);
                let _ = inbound.send(Inbound::ReadFailed(e)).await;
                return;
            }
        }
    }
}
