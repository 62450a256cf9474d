//! Acknowledgements of outbound deliveries.
//!
//! QoS 1 ends with PUBACK. QoS 2 runs PUBREC, answered with PUBREL which is itself
//! retried until PUBCOMP arrives.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ack::{AckKey, AckStage, ResendFn};
use crate::channel::Channel;
use crate::context::ServerContext;
use crate::dispatch::{Handler, Message};
use crate::event::Event;
use crate::packet::Packet;
use crate::types::PacketId;
use crate::Result;

use super::{bound, unexpected};

fn expects(scx: &ServerContext, channel: &Channel, key: &AckKey, stage: AckStage) -> bool {
    match scx.acks.stage(key) {
        Some(s) if s == stage => true,
        Some(s) => {
            log::debug!("{:?} ack stage mismatch, {}, expected {:?}, got {:?}", channel, key, stage, s);
            false
        }
        None => {
            log::debug!("{:?} ack for unknown delivery, {}", channel, key);
            false
        }
    }
}

/// Ends the delivery and hands its in-flight slot to the session queue.
async fn acknowledge(scx: &ServerContext, channel: &Channel, packet_id: PacketId, stage: AckStage) -> Result<()> {
    let key = AckKey::new(channel.id(), packet_id);
    if expects(scx, channel, &key, stage) && scx.acks.acknowledge(&key).is_some() {
        scx.metrics.messages_acked_inc();
        channel.resume_backlog(scx).await?;
    }
    Ok(())
}

pub struct PublishAckHandler;

#[async_trait]
impl Handler for PublishAckHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::PublishAck { packet_id }) = msg else {
            return Err(unexpected(name).into());
        };
        acknowledge(scx, bound(channel)?, packet_id, AckStage::Publish).await?;
        Ok(None)
    }
}

pub struct PublishReceivedHandler;

#[async_trait]
impl Handler for PublishReceivedHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::PublishReceived { packet_id }) = msg else {
            return Err(unexpected(name).into());
        };
        let channel = bound(channel)?;
        let key = AckKey::new(channel.id(), packet_id);
        let known = expects(scx, channel, &key, AckStage::Publish);
        if let Err(e) = channel.send(Packet::PublishRelease { packet_id }) {
            log::debug!("{:?} PUBREL not sent, {}, {}", channel, key, e);
        }
        if known {
            let ch = channel.clone();
            let resend: ResendFn = Arc::new(move |_attempt| {
                if let Err(e) = ch.send(Packet::PublishRelease { packet_id }) {
                    log::debug!("PUBREL resend skipped, packet id: {}, {}", packet_id, e);
                }
            });
            //replaces the publish record, the in-flight slot stays taken
            scx.acks.track(key, AckStage::Release, None, resend);
        }
        Ok(None)
    }
}

pub struct PublishCompleteHandler;

#[async_trait]
impl Handler for PublishCompleteHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::PublishComplete { packet_id }) = msg else {
            return Err(unexpected(name).into());
        };
        acknowledge(scx, bound(channel)?, packet_id, AckStage::Release).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::online_channel;
    use crate::channel::ChannelStatus;
    use crate::conf::{Inner, OverflowPolicy, Settings};
    use crate::types::{ConnectInfo, Protocol, Publish, QoS};

    fn pid(v: u16) -> PacketId {
        PacketId::new(v).expect("non zero")
    }

    #[tokio::test]
    async fn test_qos1_ack() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (c, mut rx) = online_channel(scx.next_connection_id(), "c1");
        c.deliver(&scx, Publish::new("t", "x", QoS::AtLeastOnce), QoS::AtLeastOnce).await.expect("");
        let Ok(Packet::Publish(p)) = rx.try_recv() else { panic!("publish expected") };
        let packet_id = p.packet_id.expect("packet id");

        scx.dispatcher.dispatch(&scx, Packet::PublishAck { packet_id }.into(), Some(&c)).await;
        assert!(scx.acks.is_empty());
        assert_eq!(scx.metrics.messages_acked(), 1);

        scx.dispatcher.dispatch(&scx, Packet::PublishAck { packet_id }.into(), Some(&c)).await;
        assert_eq!(scx.metrics.messages_acked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qos2_flow() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (c, mut rx) = online_channel(scx.next_connection_id(), "c1");
        c.deliver(&scx, Publish::new("t", "x", QoS::ExactlyOnce), QoS::ExactlyOnce).await.expect("");
        let Ok(Packet::Publish(p)) = rx.try_recv() else { panic!("publish expected") };
        let packet_id = p.packet_id.expect("packet id");
        let key = AckKey::new(c.id(), packet_id);

        scx.dispatcher.dispatch(&scx, Packet::PublishReceived { packet_id }.into(), Some(&c)).await;
        assert_eq!(rx.try_recv(), Ok(Packet::PublishRelease { packet_id }));
        assert_eq!(scx.acks.stage(&key), Some(AckStage::Release));

        tokio::time::sleep(scx.settings.mqtt.retry_interval + std::time::Duration::from_millis(10)).await;
        assert_eq!(rx.try_recv(), Ok(Packet::PublishRelease { packet_id }));

        scx.dispatcher.dispatch(&scx, Packet::PublishComplete { packet_id }.into(), Some(&c)).await;
        assert!(scx.acks.is_empty());
        assert_eq!(scx.metrics.messages_acked(), 1);
    }

    #[tokio::test]
    async fn test_inflight_limit_backlog() {
        let mut inner = Inner::default();
        inner.mqtt.max_inflight = 1;
        let scx = ServerContext::builder(Settings::from(inner)).build();
        let (c, mut rx) = online_channel(scx.next_connection_id(), "c1");
        for payload in ["a", "b", "c"] {
            c.deliver(&scx, Publish::new("t", payload, QoS::AtLeastOnce), QoS::AtLeastOnce).await.expect("");
        }
        c.deliver(&scx, Publish::new("t", "d", QoS::ExactlyOnce), QoS::ExactlyOnce).await.expect("");

        let Ok(Packet::Publish(first)) = rx.try_recv() else { panic!("publish expected") };
        assert_eq!(first.payload, "a");
        assert!(rx.try_recv().is_err());
        assert_eq!(scx.acks.connection_len(c.id()), 1);
        assert_eq!(scx.store.session_len(&"c1".into()).await, 3);

        let packet_id = first.packet_id.expect("packet id");
        scx.dispatcher.dispatch(&scx, Packet::PublishAck { packet_id }.into(), Some(&c)).await;
        let Ok(Packet::Publish(second)) = rx.try_recv() else { panic!("publish expected") };
        assert_eq!(second.payload, "b");
        assert!(rx.try_recv().is_err());
        assert_eq!(scx.store.session_len(&"c1".into()).await, 2);

        let packet_id = second.packet_id.expect("packet id");
        scx.dispatcher.dispatch(&scx, Packet::PublishAck { packet_id }.into(), Some(&c)).await;
        let Ok(Packet::Publish(third)) = rx.try_recv() else { panic!("publish expected") };
        assert_eq!(third.payload, "c");
        assert_eq!(scx.metrics.messages_acked(), 2);
    }

    #[tokio::test]
    async fn test_inflight_backlog_overflow() {
        for (policy, kept) in [(OverflowPolicy::DropOldest, "c"), (OverflowPolicy::RejectNewest, "b")] {
            let mut inner = Inner::default();
            inner.mqtt.max_inflight = 1;
            inner.mqtt.max_session_queue = 1;
            inner.mqtt.overflow_policy = policy;
            let scx = ServerContext::builder(Settings::from(inner)).build();
            let (c, mut rx) = online_channel(scx.next_connection_id(), "c1");
            for payload in ["a", "b", "c"] {
                c.deliver(&scx, Publish::new("t", payload, QoS::AtLeastOnce), QoS::AtLeastOnce).await.expect("");
            }
            assert_eq!(scx.metrics.messages_dropped(), 1);
            assert_eq!(scx.metrics.messages_queue_overflow(), 1);

            let Ok(Packet::Publish(first)) = rx.try_recv() else { panic!("publish expected") };
            let packet_id = first.packet_id.expect("packet id");
            scx.dispatcher.dispatch(&scx, Packet::PublishAck { packet_id }.into(), Some(&c)).await;
            let Ok(Packet::Publish(next)) = rx.try_recv() else { panic!("publish expected") };
            assert_eq!(next.payload, kept);
        }
    }

    #[tokio::test]
    async fn test_qos0_dropped_when_outbound_full() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let c = Channel::new(scx.next_connection_id(), None, tx);
        c.set_info(ConnectInfo::new("c1".into(), Protocol::V4));
        c.set_status(ChannelStatus::Online);

        c.deliver(&scx, Publish::new("t", "1", QoS::AtMostOnce), QoS::AtMostOnce).await.expect("");
        c.deliver(&scx, Publish::new("t", "2", QoS::AtMostOnce), QoS::AtMostOnce).await.expect("");
        assert_eq!(scx.metrics.messages_dropped(), 1);

        //tracked deliveries wait for the retry timer instead
        c.deliver(&scx, Publish::new("t", "3", QoS::AtLeastOnce), QoS::AtLeastOnce).await.expect("");
        assert_eq!(scx.acks.connection_len(c.id()), 1);
        assert!(matches!(rx.try_recv(), Ok(Packet::Publish(p)) if p.payload == "1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pubrec_unknown() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (c, mut rx) = online_channel(scx.next_connection_id(), "c1");
        scx.dispatcher.dispatch(&scx, Packet::PublishReceived { packet_id: pid(9) }.into(), Some(&c)).await;
        assert_eq!(rx.try_recv(), Ok(Packet::PublishRelease { packet_id: pid(9) }));
        assert!(scx.acks.is_empty());
    }
}
