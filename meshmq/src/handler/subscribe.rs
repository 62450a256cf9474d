use async_trait::async_trait;

use crate::channel::{Channel, ChannelStatus};
use crate::context::ServerContext;
use crate::dispatch::{Handler, Message};
use crate::error::MqttError;
use crate::event::Event;
use crate::packet::{Packet, SubscribeReturnCode};
use crate::types::{Action, QoS, TopicFilter};
use crate::utils::timestamp_millis;
use crate::Result;

use super::{online, unexpected};

/// SUBSCRIBE. A packet containing a filter the client may not subscribe to is dropped as a
/// whole; filters that fail to parse are answered with a failure code.
pub struct SubscribeHandler;

#[async_trait]
impl Handler for SubscribeHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::Subscribe { packet_id, topic_filters }) = msg else {
            return Err(unexpected(name).into());
        };
        let channel = online(channel)?;
        let info = channel.info().ok_or(MqttError::NotConnected)?;

        for (tf, _) in &topic_filters {
            if !scx.acl.check_allowed(info, tf, Action::Subscribe).await {
                scx.metrics.client_subscribe_acl_denied_inc();
                return Err(MqttError::AuthorizationDenied(tf.clone(), Action::Subscribe).into());
            }
        }

        let mut results = Vec::with_capacity(topic_filters.len());
        let mut granted: Vec<(TopicFilter, QoS)> = Vec::new();
        for (tf, qos) in topic_filters {
            match scx.registry.subscribe(&tf, channel, qos) {
                Ok(_) => {
                    scx.metrics.client_subscribe_inc();
                    results.push((tf.clone(), SubscribeReturnCode::Success(qos)));
                    granted.push((tf, qos));
                }
                Err(e) => {
                    log::debug!("{:?} subscribe `{}` failed, {}", channel, tf, e);
                    results.push((tf, SubscribeReturnCode::Failure));
                }
            }
        }

        //closed while the acl was consulted, the close already released the registry
        if channel.status() == ChannelStatus::Closed {
            let filters = granted.into_iter().map(|(tf, _)| tf).collect::<Vec<_>>();
            scx.registry.unsubscribe(channel, &filters);
            return Ok(None);
        }

        let status = results.iter().map(|(_, code)| *code).collect();
        channel.send(Packet::SubscribeAck { packet_id, status })?;

        for (tf, qos) in granted {
            for retained in scx.store.matches_retained(&tf).await? {
                let qos = retained.qos.less_value(qos);
                channel.deliver(scx, retained, qos).await?;
                scx.metrics.messages_delivered_retain_inc();
            }
        }

        Ok(Some(Event::Subscribed { client_id: info.client_id.clone(), topic_filters: results, time: timestamp_millis() }))
    }
}

pub struct UnsubscribeHandler;

#[async_trait]
impl Handler for UnsubscribeHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::Unsubscribe { packet_id, topic_filters }) = msg else {
            return Err(unexpected(name).into());
        };
        let channel = online(channel)?;
        let client_id = channel.client_id().cloned().ok_or(MqttError::NotConnected)?;

        let removed = scx.registry.unsubscribe(channel, &topic_filters);
        for _ in 0..removed {
            scx.metrics.client_unsubscribe_inc();
        }
        channel.send(Packet::UnsubscribeAck { packet_id })?;
        Ok(Some(Event::Unsubscribed { client_id, topic_filters, time: timestamp_millis() }))
    }
}
