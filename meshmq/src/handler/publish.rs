use std::collections::hash_map::Entry;

use async_trait::async_trait;

use crate::channel::Channel;
use crate::cluster::ClusterMessage;
use crate::context::ServerContext;
use crate::dispatch::{Handler, Message};
use crate::error::MqttError;
use crate::event::Event;
use crate::packet::Packet;
use crate::topic::parse_topic_name;
use crate::types::{Action, ClientId, HashMap, Publish, QoS};
use crate::utils::timestamp_millis;
use crate::Result;

use super::{bound, online, unexpected};

/// Inbound PUBLISH, from a client or forwarded by another node.
pub struct PublishHandler;

#[async_trait]
impl Handler for PublishHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::Publish(publish)) = msg else {
            return Err(unexpected(name).into());
        };
        match channel {
            Some(channel) => from_client(scx, online(Some(channel))?, publish).await,
            None => {
                scx.metrics.messages_from_cluster_inc();
                publish_message(scx, publish, false).await?;
                Ok(None)
            }
        }
    }
}

async fn from_client(scx: &ServerContext, channel: &Channel, mut publish: Publish) -> Result<Option<Event>> {
    let info = channel.info().ok_or(MqttError::NotConnected)?;
    publish.client_id = info.client_id.clone();
    publish.create_time = timestamp_millis();
    publish.dup = false;

    parse_topic_name(&publish.topic).map_err(MqttError::from)?;
    if publish.qos > QoS::AtMostOnce && publish.packet_id.is_none() {
        return Err(MqttError::HandlerFault(format!("{:?} publish without packet id", publish.qos)).into());
    }

    if !scx.acl.check_allowed(info, &publish.topic, Action::Publish).await {
        scx.metrics.client_publish_acl_denied_inc();
        return Err(MqttError::AuthorizationDenied(publish.topic.clone(), Action::Publish).into());
    }

    //the acl check may have yielded, the channel can be gone by now
    if !channel.is_online() {
        log::debug!("{:?} publish discarded, channel is {:?}", channel, channel.status());
        return Ok(None);
    }

    let packet_id = publish.packet_id;
    if let (QoS::ExactlyOnce, Some(packet_id)) = (publish.qos, packet_id) {
        if !channel.inbound_qos2_insert(packet_id) {
            log::debug!("{:?} duplicate QoS 2 publish, packet id: {}", channel, packet_id);
            channel.send(Packet::PublishReceived { packet_id })?;
            return Ok(None);
        }
    }

    scx.metrics.messages_publish_inc();
    let event = Event::Published {
        client_id: publish.client_id.clone(),
        topic: publish.topic.clone(),
        qos: publish.qos,
        retain: publish.retain,
        payload: publish.payload.clone(),
        time: publish.create_time,
    };
    let qos = publish.qos;
    publish_message(scx, publish, true).await?;

    match (qos, packet_id) {
        (QoS::AtLeastOnce, Some(packet_id)) => channel.send(Packet::PublishAck { packet_id })?,
        (QoS::ExactlyOnce, Some(packet_id)) => channel.send(Packet::PublishReceived { packet_id })?,
        _ => {}
    }
    Ok(Some(event))
}

/// Inbound PUBREL; always answered, an unknown packet id is treated as already released.
pub struct PublishReleaseHandler;

#[async_trait]
impl Handler for PublishReleaseHandler {
    async fn handle(&self, _scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::PublishRelease { packet_id }) = msg else {
            return Err(unexpected(name).into());
        };
        let channel = bound(channel)?;
        if !channel.inbound_qos2_remove(packet_id) {
            log::debug!("{:?} PUBREL for unknown packet id: {}", channel, packet_id);
        }
        channel.send(Packet::PublishComplete { packet_id })?;
        Ok(None)
    }
}

/// Routes `publish` to the local subscribers, stores it when it carries the retain flag
/// and, when `forward` is set and the broker is clustered, hands it to the other nodes.
///
/// A client with several matching subscriptions receives one copy, at the highest granted
/// QoS capped by the publish QoS. Returns the number of local recipients.
pub(crate) async fn publish_message(scx: &ServerContext, publish: Publish, forward: bool) -> Result<usize> {
    let delivered = route(scx, &publish).await;

    if publish.retain {
        scx.store.save_retained(publish.clone()).await?;
    }

    if forward {
        if let Some(cluster) = scx.cluster.as_ref() {
            let msg = ClusterMessage::Publish { from_node: cluster.node_id(), publish };
            cluster.forward(scx, msg).await;
        }
    }
    Ok(delivered)
}

async fn route(scx: &ServerContext, publish: &Publish) -> usize {
    let subs = scx.registry.matches(&publish.topic);
    if subs.is_empty() {
        scx.metrics.messages_nonsubscribed_inc();
        return 0;
    }

    let mut targets: HashMap<ClientId, (Channel, QoS)> = HashMap::default();
    for sub in subs {
        let Some(client_id) = sub.channel.client_id().cloned() else {
            continue;
        };
        match targets.entry(client_id) {
            Entry::Vacant(e) => {
                e.insert((sub.channel, sub.qos));
            }
            Entry::Occupied(mut e) => {
                let (channel, qos) = e.get_mut();
                //a session being taken over is matched through both channels, the newer wins
                if sub.channel.id() > channel.id() {
                    *channel = sub.channel;
                    *qos = sub.qos;
                } else if sub.channel.id() == channel.id() && sub.qos > *qos {
                    *qos = sub.qos;
                }
            }
        }
    }

    let delivered = targets.len();
    for (_, (channel, sub_qos)) in targets {
        let mut msg = publish.clone();
        msg.retain = false;
        msg.packet_id = None;
        if let Err(e) = channel.deliver(scx, msg, publish.qos.less_value(sub_qos)).await {
            log::warn!("{:?} deliver error, topic: {}, {:?}", channel, publish.topic, e);
        }
    }
    delivered
}
