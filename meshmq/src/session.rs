//! Per-connection task.
//!
//! A transport hands decoded packets to [`spawn`] and writes whatever arrives on the
//! returned outbound receiver. The task dispatches inbound packets in order, enforces the
//! handshake and keepalive deadlines and, for a persistent session left `Offline`, waits
//! out the session expiry.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::channel::{Channel, ChannelStatus};
use crate::context::ServerContext;
use crate::packet::Packet;
use crate::types::Reason;

//packets read while CONNECT is still being dispatched
const MAX_PIPELINED: usize = 64;

/// Starts serving one transport connection.
///
/// The outbound receiver holds at most `max_outbound_packets`; a writer that falls
/// behind loses QoS 0 deliveries and has QoS 1/2 deliveries resent later.
pub fn spawn(
    scx: &ServerContext,
    inbound: mpsc::Receiver<Packet>,
    remote_addr: Option<SocketAddr>,
) -> (Channel, mpsc::Receiver<Packet>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(scx.settings.mqtt.max_outbound_packets.max(1));
    let channel = Channel::new(scx.next_connection_id(), remote_addr, tx);
    scx.stats.handshakings.inc();
    let state = SessionState {
        scx: scx.clone(),
        channel: channel.clone(),
        inbound,
        pipelined: VecDeque::new(),
        handshaking: true,
    };
    let handle = tokio::spawn(state.run());
    (channel, rx, handle)
}

struct SessionState {
    scx: ServerContext,
    channel: Channel,
    inbound: mpsc::Receiver<Packet>,
    pipelined: VecDeque<Packet>,
    handshaking: bool,
}

impl SessionState {
    async fn run(mut self) {
        let reason = self.run_loop().await;
        self.handshake_done();
        if let Err(reason) = reason {
            self.channel.close(&self.scx, reason).await;
        }
        if self.channel.status() == ChannelStatus::Offline {
            self.offline_run_loop().await;
        }
        log::debug!("{:?} exit session task", self.channel);
    }

    fn handshake_done(&mut self) {
        if self.handshaking {
            self.handshaking = false;
            self.scx.stats.handshakings.dec();
        }
    }

    /// Deadline for the next inbound packet.
    fn idle_interval(&self) -> Duration {
        match self.channel.info() {
            None => self.scx.settings.mqtt.handshake_timeout,
            Some(info) if info.keepalive == 0 => Duration::from_secs(u32::MAX as u64),
            Some(info) => Duration::from_secs(info.keepalive as u64).mul_f32(self.scx.settings.mqtt.keepalive_backoff),
        }
    }

    async fn run_loop(&mut self) -> std::result::Result<(), Reason> {
        log::debug!("{:?} start session loop", self.channel);
        let token = self.channel.token().clone();
        let idle_delay = tokio::time::sleep(self.idle_interval());
        tokio::pin!(idle_delay);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    return Ok(());
                }

                _ = &mut idle_delay => {
                    return if self.channel.info().is_none() {
                        self.scx.metrics.client_handshaking_timeout_inc();
                        Err(Reason::HandshakeTimeout)
                    } else {
                        self.scx.metrics.client_keepalive_timeout_inc();
                        Err(Reason::KeepaliveTimeout)
                    };
                }

                packet = self.inbound.recv() => {
                    let Some(packet) = packet else {
                        return Err(Reason::TransportClosed);
                    };
                    if matches!(packet, Packet::Connect(_)) && self.channel.status() == ChannelStatus::Connecting {
                        self.connect(packet, idle_delay.as_mut()).await?;
                    } else {
                        self.process_packet(packet).await?;
                    }
                    while let Some(packet) = self.pipelined.pop_front() {
                        self.process_packet(packet).await?;
                    }
                    idle_delay.as_mut().reset(Instant::now() + self.idle_interval());
                }
            }
        }
    }

    /// Dispatches CONNECT while still watching the handshake deadline and the transport.
    /// Either one ending first abandons the handshake; its result is then discarded.
    async fn connect(&mut self, packet: Packet, mut idle_delay: Pin<&mut Sleep>) -> std::result::Result<(), Reason> {
        let abandoned = {
            let SessionState { scx, channel, inbound, pipelined, .. } = self;
            let (scx, channel) = (&*scx, &*channel);
            let dispatch = scx.dispatcher.dispatch(scx, packet.into(), Some(channel));
            tokio::pin!(dispatch);

            let mut abandoned = None;
            loop {
                tokio::select! {
                    biased;

                    _ = &mut dispatch => break,

                    _ = &mut idle_delay, if abandoned.is_none() => {
                        scx.metrics.client_handshaking_timeout_inc();
                        abandoned = Some(Reason::HandshakeTimeout);
                        channel.token().cancel();
                    }

                    packet = inbound.recv(), if abandoned.is_none() && pipelined.len() < MAX_PIPELINED => {
                        match packet {
                            Some(packet) => pipelined.push_back(packet),
                            None => {
                                abandoned = Some(Reason::TransportClosed);
                                channel.token().cancel();
                            }
                        }
                    }
                }
            }
            abandoned
        };

        self.handshake_done();
        if let Some(reason) = abandoned {
            log::debug!("{:?} handshake abandoned, reason: {}", self.channel, reason);
            return Err(reason);
        }
        if self.channel.status() == ChannelStatus::Connecting {
            return Err(Reason::ConnectRejected);
        }
        Ok(())
    }

    async fn process_packet(&mut self, packet: Packet) -> std::result::Result<(), Reason> {
        match (self.channel.status(), matches!(packet, Packet::Connect(_))) {
            (ChannelStatus::Connecting, _) => {
                return Err(Reason::ProtocolError(format!("{} before CONNECT", packet.name())));
            }
            (ChannelStatus::Online, true) => {
                return Err(Reason::ProtocolError("CONNECT repeated".into()));
            }
            _ => {}
        }
        self.scx.dispatcher.dispatch(&self.scx, packet.into(), Some(&self.channel)).await;
        Ok(())
    }

    async fn offline_run_loop(&self) {
        let session_expiry = self.scx.settings.mqtt.session_expiry;
        log::debug!("{:?} start offline loop, session expiry: {:?}", self.channel, session_expiry);
        tokio::select! {
            _ = self.channel.ended().cancelled() => {}
            _ = tokio::time::sleep(session_expiry) => {
                if self.channel.status() == ChannelStatus::Offline {
                    self.scx.metrics.session_expired_inc();
                    self.channel.close(&self.scx, Reason::SessionExpired).await;
                }
            }
        }
    }
}
