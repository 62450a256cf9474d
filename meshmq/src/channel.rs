//! Per-connection state.
//!
//! A [`Channel`] moves through `Connecting -> Online -> {Offline, Closed}`; an `Offline`
//! channel (persistent session) ends in `Closed` on expiry or takeover. Every status change
//! and every delivery decision happen under the channel's gate, so a delivery never races
//! with the session-queue drain that precedes the `Online` transition.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::ack::{AckKey, AckManager, AckStage, ResendFn};
use crate::context::ServerContext;
use crate::dispatch::Message;
use crate::error::MqttError;
use crate::handler::publish::publish_message;
use crate::packet::{LastWill, Packet};
use crate::store::QueueOutcome;
use crate::types::{
    ClientId, ConnectInfo, ConnectionId, DashMap, HashMap, HashSet, PacketId, Publish, QoS, Reason, TopicFilter,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStatus {
    Connecting = 0,
    Online = 1,
    Offline = 2,
    Closed = 3,
}

impl From<u8> for ChannelStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ChannelStatus::Connecting,
            1 => ChannelStatus::Online,
            2 => ChannelStatus::Offline,
            _ => ChannelStatus::Closed,
        }
    }
}

#[derive(Clone)]
pub struct Channel(Arc<ChannelInner>);

pub struct ChannelInner {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    status: AtomicU8,
    info: OnceCell<ConnectInfo>,
    will: Mutex<Option<LastWill>>,
    topics: Mutex<HashMap<TopicFilter, QoS>>,
    tx: mpsc::Sender<Packet>,
    next_packet_id: AtomicU16,
    //QoS 1/2 deliveries are waiting in the session queue for an in-flight slot
    backlogged: AtomicBool,
    //inbound QoS 2 packet ids waiting for PUBREL
    inbound_qos2: Mutex<HashSet<PacketId>>,
    gate: tokio::sync::Mutex<()>,
    token: CancellationToken,
    ended: CancellationToken,
}

impl Channel {
    pub fn new(id: ConnectionId, remote_addr: Option<SocketAddr>, tx: mpsc::Sender<Packet>) -> Self {
        Channel(Arc::new(ChannelInner {
            id,
            remote_addr,
            status: AtomicU8::new(ChannelStatus::Connecting as u8),
            info: OnceCell::new(),
            will: Mutex::new(None),
            topics: Mutex::new(HashMap::default()),
            tx,
            next_packet_id: AtomicU16::new(1),
            backlogged: AtomicBool::new(false),
            inbound_qos2: Mutex::new(HashSet::default()),
            gate: tokio::sync::Mutex::new(()),
            token: CancellationToken::new(),
            ended: CancellationToken::new(),
        }))
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.0.id
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.0.remote_addr
    }

    #[inline]
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from(self.0.status.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_status(&self, status: ChannelStatus) {
        self.0.status.store(status as u8, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.status() == ChannelStatus::Online
    }

    #[inline]
    pub fn info(&self) -> Option<&ConnectInfo> {
        self.0.info.get()
    }

    /// Binds the accepted CONNECT; only the first call takes effect.
    #[inline]
    pub(crate) fn set_info(&self, info: ConnectInfo) -> bool {
        self.0.info.set(info).is_ok()
    }

    #[inline]
    pub fn client_id(&self) -> Option<&ClientId> {
        self.info().map(|i| &i.client_id)
    }

    #[inline]
    pub(crate) fn add_topic(&self, topic_filter: TopicFilter, qos: QoS) {
        self.0.topics.lock().insert(topic_filter, qos);
    }

    #[inline]
    pub(crate) fn remove_topic(&self, topic_filter: &TopicFilter) -> Option<QoS> {
        self.0.topics.lock().remove(topic_filter)
    }

    /// Filters this channel is subscribed to, with their granted QoS.
    #[inline]
    pub fn topics(&self) -> Vec<(TopicFilter, QoS)> {
        self.0.topics.lock().iter().map(|(tf, qos)| (tf.clone(), *qos)).collect()
    }

    #[inline]
    pub(crate) fn set_will(&self, will: Option<LastWill>) {
        *self.0.will.lock() = will;
    }

    #[inline]
    pub(crate) fn take_will(&self) -> Option<LastWill> {
        self.0.will.lock().take()
    }

    /// Cancelled when the channel stops serving its transport.
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.0.token
    }

    /// Cancelled once the channel reaches `Closed`.
    #[inline]
    pub fn ended(&self) -> &CancellationToken {
        &self.0.ended
    }

    #[inline]
    pub(crate) async fn gate(&self) -> MutexGuard<'_, ()> {
        self.0.gate.lock().await
    }

    /// Queues a packet for the transport writer, failing when its buffer is full.
    #[inline]
    pub fn send(&self, packet: Packet) -> std::result::Result<(), MqttError> {
        self.0.tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => MqttError::OutboundFull,
            TrySendError::Closed(_) => MqttError::ChannelClosed,
        })
    }

    /// Records an inbound QoS 2 packet id, `false` if it is already awaiting PUBREL.
    #[inline]
    pub(crate) fn inbound_qos2_insert(&self, packet_id: PacketId) -> bool {
        self.0.inbound_qos2.lock().insert(packet_id)
    }

    #[inline]
    pub(crate) fn inbound_qos2_remove(&self, packet_id: PacketId) -> bool {
        self.0.inbound_qos2.lock().remove(&packet_id)
    }

    /// Next outbound packet id, skipping ids that still have a delivery in flight.
    pub(crate) fn next_packet_id(&self, acks: &AckManager) -> std::result::Result<PacketId, MqttError> {
        for _ in 0..=u16::MAX {
            let v = self.0.next_packet_id.fetch_add(1, Ordering::SeqCst);
            let Some(packet_id) = PacketId::new(v) else {
                continue;
            };
            if !acks.contains(&AckKey::new(self.id(), packet_id)) {
                return Ok(packet_id);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }

    /// Delivers `publish` at `qos`: sent now when online, queued in the session store
    /// when the session is not online and `qos` is at least 1, dropped otherwise.
    pub async fn deliver(&self, scx: &ServerContext, mut publish: Publish, qos: QoS) -> Result<()> {
        publish.qos = qos;
        publish.dup = false;
        let _gate = self.gate().await;
        match self.status() {
            ChannelStatus::Online => self.deliver_online(scx, publish).await,
            ChannelStatus::Connecting | ChannelStatus::Offline if qos > QoS::AtMostOnce => {
                self.enqueue(scx, publish).await
            }
            _ => {
                log::debug!("{:?} message dropped, status: {:?}, topic: {}", self, self.status(), publish.topic);
                scx.metrics.messages_dropped_inc();
                Ok(())
            }
        }
    }

    /// Sends without looking at the status; the caller holds the gate.
    ///
    /// QoS 1/2 deliveries beyond `max_inflight`, or behind deliveries already waiting
    /// for a slot, go to the session queue and leave it as acknowledgements come in.
    pub(crate) async fn deliver_online(&self, scx: &ServerContext, publish: Publish) -> Result<()> {
        if publish.qos == QoS::AtMostOnce {
            return self.send_untracked(scx, publish);
        }
        if self.is_backlogged() {
            self.drain_backlog(scx).await?;
        }
        if self.is_backlogged() || self.inflight_full(scx) {
            self.0.backlogged.store(true, Ordering::SeqCst);
            return self.enqueue(scx, publish).await;
        }
        self.send_tracked(scx, publish)
    }

    /// Starts draining the session queue of a resumed session; the caller holds the gate.
    pub(crate) async fn deliver_queued(&self, scx: &ServerContext) -> Result<()> {
        self.0.backlogged.store(true, Ordering::SeqCst);
        self.drain_backlog(scx).await
    }

    /// Moves queued deliveries into free in-flight slots.
    pub async fn resume_backlog(&self, scx: &ServerContext) -> Result<()> {
        let _gate = self.gate().await;
        if self.is_online() && self.is_backlogged() {
            self.drain_backlog(scx).await?;
        }
        Ok(())
    }

    #[inline]
    fn is_backlogged(&self) -> bool {
        self.0.backlogged.load(Ordering::SeqCst)
    }

    #[inline]
    fn inflight_full(&self, scx: &ServerContext) -> bool {
        let max_inflight = scx.settings.mqtt.max_inflight;
        max_inflight > 0 && scx.acks.connection_len(self.id()) >= max_inflight
    }

    async fn drain_backlog(&self, scx: &ServerContext) -> Result<()> {
        let Some(client_id) = self.client_id() else {
            return Ok(());
        };
        while !self.inflight_full(scx) {
            match scx.store.pop_session_message(client_id).await? {
                Some(publish) if publish.qos == QoS::AtMostOnce => self.send_untracked(scx, publish)?,
                Some(publish) => self.send_tracked(scx, publish)?,
                None => {
                    self.0.backlogged.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        Ok(())
    }

    fn send_untracked(&self, scx: &ServerContext, mut publish: Publish) -> Result<()> {
        publish.packet_id = None;
        match self.send(Packet::Publish(publish)) {
            Ok(()) => scx.metrics.messages_delivered_inc(),
            Err(MqttError::OutboundFull) => {
                log::debug!("{:?} outbound queue full, QoS 0 message dropped", self);
                scx.metrics.messages_dropped_inc();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn send_tracked(&self, scx: &ServerContext, mut publish: Publish) -> Result<()> {
        let packet_id = self.next_packet_id(&scx.acks)?;
        publish.packet_id = Some(packet_id);

        let tx = self.0.tx.clone();
        let resend_msg = publish.clone();
        let resend: ResendFn = Arc::new(move |_attempt| {
            let mut p = resend_msg.clone();
            p.dup = true;
            if let Err(e) = tx.try_send(Packet::Publish(p)) {
                log::debug!("resend skipped, packet id: {}, {}", packet_id, e);
            }
        });
        scx.acks.track(AckKey::new(self.id(), packet_id), AckStage::Publish, Some(publish.clone()), resend);

        match self.send(Packet::Publish(publish)) {
            Ok(()) => {}
            //the retry timer sends it once the writer catches up
            Err(MqttError::OutboundFull) => log::debug!("{:?} outbound queue full, packet id: {}", self, packet_id),
            Err(e) => return Err(e.into()),
        }
        scx.metrics.messages_delivered_inc();
        Ok(())
    }

    async fn enqueue(&self, scx: &ServerContext, publish: Publish) -> Result<()> {
        let Some(client_id) = self.client_id() else {
            scx.metrics.messages_dropped_inc();
            return Ok(());
        };
        match scx.store.save_session_message(client_id, publish).await? {
            QueueOutcome::Queued => scx.metrics.messages_queued_inc(),
            QueueOutcome::Evicted(evicted) => {
                log::warn!("{:?} session queue full, oldest message evicted, topic: {}", self, evicted.topic);
                scx.metrics.messages_queued_inc();
                scx.metrics.messages_queue_overflow_inc();
                scx.metrics.messages_dropped_inc();
            }
            QueueOutcome::Rejected(rejected) => {
                log::warn!("{:?} session queue full, message rejected, topic: {}", self, rejected.topic);
                scx.metrics.messages_queue_overflow_inc();
                scx.metrics.messages_dropped_inc();
            }
        }
        Ok(())
    }

    /// Closes the channel. Repeated calls on a `Closed` channel do nothing.
    ///
    /// A persistent session leaving `Online` goes `Offline`: it keeps its registry entry
    /// and subscriptions, and its unacknowledged deliveries move into the session queue.
    /// Every other close releases the registry entry, the subscriptions and the ack
    /// records. Leaving `Online` also emits the disconnect notice and, unless the client
    /// disconnected explicitly, publishes the will.
    pub async fn close(&self, scx: &ServerContext, reason: Reason) {
        let keep_session = self.info().map(|i| !i.clean_session).unwrap_or_default()
            && !matches!(reason, Reason::SessionExpired | Reason::SessionDiscarded | Reason::Kicked(_));

        let (prev, status) = {
            let _gate = self.gate().await;
            let prev = self.status();
            if prev == ChannelStatus::Closed {
                return;
            }
            let status = if keep_session && prev == ChannelStatus::Online && reason != Reason::SessionTakenOver {
                ChannelStatus::Offline
            } else {
                ChannelStatus::Closed
            };
            self.set_status(status);
            if keep_session {
                self.requeue_inflights(scx).await;
            }
            (prev, status)
        };
        self.token().cancel();
        log::debug!("{:?} closed, {:?} -> {:?}, reason: {}", self, prev, status, reason);

        if status == ChannelStatus::Closed {
            if let Some(client_id) = self.client_id() {
                scx.channels.remove_if(client_id, self.id());
                if !keep_session {
                    if let Err(e) = scx.store.remove_session(client_id).await {
                        log::warn!("{:?} remove session error, {:?}", self, e);
                    }
                }
            }
            scx.registry.unsubscribe_all(self);
            if prev != ChannelStatus::Connecting && reason != Reason::SessionTakenOver {
                scx.stats.sessions.dec();
            }
            self.ended().cancel();
        }
        scx.acks.clear(self.id());

        if prev != ChannelStatus::Online {
            return;
        }
        scx.stats.connections.dec();

        if let Some(client_id) = self.client_id() {
            let notice = Message::Disconnected { client_id: client_id.clone(), reason: reason.clone() };
            scx.dispatcher.dispatch(scx, notice, Some(self)).await;
        }

        let will = self.take_will();
        if let (Some(will), false) = (will, reason.is_graceful()) {
            self.publish_will(scx, will).await;
        }
    }

    async fn requeue_inflights(&self, scx: &ServerContext) {
        let Some(client_id) = self.client_id() else {
            return;
        };
        let records = scx.acks.clear(self.id());
        //in-flight deliveries are older than anything waiting for a slot
        let backlog = match scx.store.drain_session(client_id).await {
            Ok(backlog) => backlog,
            Err(e) => {
                log::warn!("{:?} drain backlog error, {:?}", self, e);
                Vec::new()
            }
        };
        for record in records {
            let Some(mut publish) = record.publish.filter(|_| record.stage == AckStage::Publish) else {
                continue;
            };
            publish.packet_id = None;
            publish.dup = false;
            if self.requeue(scx, client_id, publish).await {
                scx.metrics.messages_queued_inc();
            }
        }
        for publish in backlog {
            self.requeue(scx, client_id, publish).await;
        }
    }

    async fn requeue(&self, scx: &ServerContext, client_id: &ClientId, publish: Publish) -> bool {
        match scx.store.save_session_message(client_id, publish).await {
            Ok(outcome) if outcome.is_overflow() => {
                scx.metrics.messages_queue_overflow_inc();
                scx.metrics.messages_dropped_inc();
                matches!(outcome, QueueOutcome::Evicted(_))
            }
            Ok(_) => true,
            Err(e) => {
                log::warn!("{:?} requeue error, {:?}", self, e);
                false
            }
        }
    }

    async fn publish_will(&self, scx: &ServerContext, will: LastWill) {
        let mut publish = Publish::new(will.topic, will.message, will.qos).retain(will.retain);
        if let Some(client_id) = self.client_id() {
            publish.client_id = client_id.clone();
        }
        scx.metrics.messages_publish_lastwill_inc();
        if let Err(e) = publish_message(scx, publish, true).await {
            log::warn!("{:?} publish will error, {:?}", self, e);
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client_id) => write!(f, "{}/{}", self.id(), client_id),
            None => write!(f, "{}/-", self.id()),
        }
    }
}

/// Channels by client id, at most one per client.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ClientId, Channel>,
}

impl ChannelRegistry {
    /// Registers `channel`, returning the channel it replaced.
    #[inline]
    pub fn insert(&self, client_id: ClientId, channel: Channel) -> Option<Channel> {
        self.channels.insert(client_id, channel)
    }

    #[inline]
    pub fn get(&self, client_id: &ClientId) -> Option<Channel> {
        self.channels.get(client_id).map(|c| c.value().clone())
    }

    /// Removes the entry only while it still belongs to connection `id`.
    #[inline]
    pub fn remove_if(&self, client_id: &ClientId, id: ConnectionId) -> Option<Channel> {
        self.channels.remove_if(client_id, |_, c| c.id() == id).map(|(_, c)| c)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
