//! CONNECT handshake, PINGREQ, DISCONNECT and the internal disconnect notice.

use std::future::Future;

use async_trait::async_trait;
use uuid::Uuid;

use crate::channel::{Channel, ChannelStatus};
use crate::cluster::ClusterMessage;
use crate::context::ServerContext;
use crate::dispatch::{Handler, Message};
use crate::error::MqttError;
use crate::event::Event;
use crate::packet::{Connect, ConnectAck, ConnectAckReason, Packet};
use crate::topic::parse_topic_name;
use crate::types::{Action, ClientId, ConnectInfo, Protocol, Reason};
use crate::utils::timestamp_millis;
use crate::{Error, Result};

use super::{bound, online, unexpected};

/// CONNECT. On rejection the CONNACK carries the failure code and the channel stays
/// `Connecting`; the session loop closes it after dispatch.
pub struct ConnectHandler;

#[async_trait]
impl Handler for ConnectHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Packet(Packet::Connect(connect)) = msg else {
            return Err(unexpected(name).into());
        };
        let channel = bound(channel)?;
        if channel.status() != ChannelStatus::Connecting {
            return Err(MqttError::HandlerFault(format!("CONNECT on a {:?} channel", channel.status())).into());
        }
        scx.metrics.client_connect_inc();

        match handshake(scx, channel, *connect).await {
            Ok(event) => Ok(event),
            Err((ack_code, e)) => {
                refused_ack(scx, channel, ack_code, e)?;
                Ok(None)
            }
        }
    }
}

fn refused_ack(scx: &ServerContext, channel: &Channel, ack_code: ConnectAckReason, e: Error) -> Result<()> {
    log::info!("{:?} connection refused, {}, {}", channel, ack_code.reason(), e);
    scx.metrics.client_connack_inc();
    match ack_code {
        ConnectAckReason::UnacceptableProtocolVersion => scx.metrics.client_connack_version_error_inc(),
        ConnectAckReason::BadUserNameOrPassword => scx.metrics.client_connack_auth_error_inc(),
        _ => {}
    }
    channel.send(Packet::ConnectAck(ConnectAck { return_code: ack_code, session_present: false }))?;
    Ok(())
}

fn refused(e: MqttError) -> (ConnectAckReason, Error) {
    (e.connack_reason(), e.into())
}

fn unavailable(e: Error) -> (ConnectAckReason, Error) {
    (ConnectAckReason::ServiceUnavailable, e)
}

async fn handshake(
    scx: &ServerContext,
    channel: &Channel,
    connect: Connect,
) -> std::result::Result<Option<Event>, (ConnectAckReason, Error)> {
    let protocol = Protocol::try_from(connect.protocol).map_err(refused)?;

    let client_id = if connect.client_id.is_empty() {
        if connect.clean_session && scx.settings.mqtt.allow_zero_length_clientid {
            ClientId::from(Uuid::new_v4().simple().to_string())
        } else {
            return Err(refused(MqttError::IdentifierRejected));
        }
    } else {
        connect.client_id.clone()
    };

    let max_keepalive = scx.settings.mqtt.max_keepalive;
    let keepalive = if max_keepalive > 0 && (connect.keep_alive == 0 || connect.keep_alive > max_keepalive) {
        max_keepalive
    } else {
        connect.keep_alive
    };

    let info = ConnectInfo {
        client_id: client_id.clone(),
        username: connect.username.clone(),
        protocol,
        keepalive,
        clean_session: connect.clean_session,
        remote_addr: channel.remote_addr(),
        connected_at: timestamp_millis(),
    };

    let authenticate = scx.authenticator.authenticate(connect.username.as_ref(), connect.password.as_ref(), &client_id);
    let Some(authenticated) = unless_abandoned(channel, authenticate).await else {
        return Ok(None);
    };
    if !authenticated {
        return Err(refused(MqttError::AuthenticationFailed));
    }

    if let Some(will) = connect.last_will.as_ref() {
        parse_topic_name(&will.topic).map_err(|e| refused(e.into()))?;
        let Some(allowed) = unless_abandoned(channel, scx.acl.check_allowed(&info, &will.topic, Action::Publish)).await
        else {
            return Ok(None);
        };
        if !allowed {
            return Err(refused(MqttError::AuthorizationDenied(will.topic.clone(), Action::Publish)));
        }
    }

    if is_abandoned(channel) {
        return Ok(None);
    }

    if !channel.set_info(info) {
        return Err(unavailable(MqttError::HandlerFault("connect info already bound".into()).into()));
    }
    channel.set_will(connect.last_will);

    let session_present = register(scx, channel, &client_id, connect.clean_session).await.map_err(unavailable)?;

    if let Some(cluster) = scx.cluster.as_ref() {
        let msg = ClusterMessage::Connected { client_id: client_id.clone(), node_id: cluster.node_id() };
        cluster.forward(scx, msg).await;
    }

    {
        let _gate = channel.gate().await;
        if is_abandoned(channel) {
            //the taken over session goes down with this channel
            if session_present {
                scx.stats.sessions.dec();
            }
            return Ok(None);
        }
        channel
            .send(Packet::ConnectAck(ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present }))
            .map_err(|e| unavailable(e.into()))?;
        channel.set_status(ChannelStatus::Online);
        if !connect.clean_session {
            if let Err(e) = channel.deliver_queued(scx).await {
                log::warn!("{:?} deliver queued messages error, {:?}", channel, e);
            }
        }
    }

    scx.metrics.client_connack_inc();
    scx.metrics.client_connected_inc();
    scx.stats.connections.inc();
    if session_present {
        scx.metrics.session_resumed_inc();
    } else {
        scx.metrics.session_created_inc();
        scx.stats.sessions.inc();
    }

    Ok(Some(Event::Connected {
        client_id,
        username: connect.username,
        connection_id: channel.id(),
        session_present,
        time: timestamp_millis(),
    }))
}

/// Runs `f` unless the session abandons the handshake first, by timeout or by the
/// transport closing.
async fn unless_abandoned<F: Future>(channel: &Channel, f: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = channel.token().cancelled() => {
            log::debug!("{:?} handshake abandoned while pending", channel);
            None
        }
        out = f => Some(out),
    }
}

fn is_abandoned(channel: &Channel) -> bool {
    let abandoned = channel.status() != ChannelStatus::Connecting || channel.token().is_cancelled();
    if abandoned {
        log::debug!("{:?} handshake abandoned, status: {:?}", channel, channel.status());
    }
    abandoned
}

/// Binds `client_id` to `channel`, dealing with a channel previously registered under the
/// same id. Returns whether the previous session state was taken over.
async fn register(scx: &ServerContext, channel: &Channel, client_id: &ClientId, clean_session: bool) -> Result<bool> {
    let Some(old) = scx.channels.insert(client_id.clone(), channel.clone()) else {
        if clean_session {
            scx.store.remove_session(client_id).await?;
        }
        return Ok(false);
    };

    let old_status = old.status();
    let old_persistent = old.info().is_some_and(|i| !i.clean_session);
    let resumable = matches!(old_status, ChannelStatus::Online | ChannelStatus::Offline);

    if !clean_session && old_persistent && resumable {
        log::debug!("{:?} takes over session of {:?}, status: {:?}", channel, old, old_status);
        for (topic_filter, qos) in old.topics() {
            scx.registry.subscribe(&topic_filter, channel, qos)?;
        }
        old.close(scx, Reason::SessionTakenOver).await;
        return Ok(true);
    }

    let reason = if old_status == ChannelStatus::Offline { Reason::SessionDiscarded } else { Reason::Kicked(None) };
    log::debug!("{:?} replaces {:?}, status: {:?}, reason: {}", channel, old, old_status, reason);
    old.close(scx, reason).await;
    if clean_session {
        scx.store.remove_session(client_id).await?;
    }
    Ok(false)
}

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        if !matches!(msg, Message::Packet(Packet::PingRequest)) {
            return Err(unexpected(msg.name()).into());
        }
        online(channel)?.send(Packet::PingResponse)?;
        Ok(None)
    }
}

/// Client DISCONNECT: the will is discarded and the channel closed gracefully.
pub struct DisconnectHandler;

#[async_trait]
impl Handler for DisconnectHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        if !matches!(msg, Message::Packet(Packet::Disconnect)) {
            return Err(unexpected(msg.name()).into());
        }
        let channel = online(channel)?;
        channel.take_will();
        channel.close(scx, Reason::ClientDisconnect).await;
        Ok(None)
    }
}

/// Notice emitted once a channel leaves `Online`.
pub struct DisconnectedHandler;

#[async_trait]
impl Handler for DisconnectedHandler {
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>> {
        let name = msg.name();
        let Message::Disconnected { client_id, reason } = msg else {
            return Err(unexpected(name).into());
        };
        scx.metrics.client_disconnected_inc();

        if let (Some(cluster), Some(_)) = (scx.cluster.as_ref(), channel) {
            let msg = ClusterMessage::Disconnected { client_id: client_id.clone(), node_id: cluster.node_id() };
            cluster.forward(scx, msg).await;
        }
        Ok(Some(Event::Disconnected { client_id, reason, time: timestamp_millis() }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::conf::{Inner, Settings};
    use crate::packet::LastWill;
    use crate::types::{Publish, QoS};

    fn connecting(scx: &ServerContext) -> (Channel, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(64);
        (Channel::new(scx.next_connection_id(), None, tx), rx)
    }

    fn connack(rx: &mut mpsc::Receiver<Packet>) -> ConnectAck {
        match rx.try_recv() {
            Ok(Packet::ConnectAck(ack)) => ack,
            other => panic!("CONNACK expected, got {:?}", other),
        }
    }

    async fn connect(scx: &ServerContext, c: &Channel, connect: Connect) -> Option<Event> {
        scx.dispatcher.dispatch(scx, Packet::Connect(Box::new(connect)).into(), Some(c)).await
    }

    #[tokio::test]
    async fn test_accept() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (c, mut rx) = connecting(&scx);
        let event = connect(&scx, &c, Connect::default().client_id("c1")).await;
        assert!(matches!(event, Some(Event::Connected { session_present: false, .. })));
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::ConnectionAccepted);
        assert!(c.is_online());
        assert_eq!(scx.channels.get(&"c1".into()), Some(c.clone()));
        assert_eq!(scx.stats.connections.count(), 1);

        scx.dispatcher.dispatch(&scx, Packet::PingRequest.into(), Some(&c)).await;
        assert_eq!(rx.try_recv(), Ok(Packet::PingResponse));

        scx.dispatcher.dispatch(&scx, Packet::Disconnect.into(), Some(&c)).await;
        assert_eq!(c.status(), ChannelStatus::Closed);
        assert!(scx.channels.is_empty());
        assert_eq!(scx.metrics.client_disconnected(), 1);
    }

    #[tokio::test]
    async fn test_rejections() {
        let mut inner = Inner::default();
        inner.auth.allow_anonymous = false;
        inner.auth.users.insert("u".into(), "p".into());
        inner.mqtt.allow_zero_length_clientid = false;
        let scx = ServerContext::builder(Settings::from(inner)).build();

        let (c, mut rx) = connecting(&scx);
        let mut bad_version = Connect::default().client_id("c1");
        bad_version.protocol = 9;
        assert!(connect(&scx, &c, bad_version).await.is_none());
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::UnacceptableProtocolVersion);
        assert_eq!(c.status(), ChannelStatus::Connecting);

        let (c, mut rx) = connecting(&scx);
        connect(&scx, &c, Connect::default()).await;
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::IdentifierRejected);

        let (c, mut rx) = connecting(&scx);
        let mut bad_password = Connect::default().client_id("c1");
        bad_password.username = Some("u".into());
        bad_password.password = Some(Bytes::from_static(b"x"));
        connect(&scx, &c, bad_password).await;
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::BadUserNameOrPassword);

        let (c, mut rx) = connecting(&scx);
        let mut bad_will = Connect::default().client_id("c1");
        bad_will.username = Some("u".into());
        bad_will.password = Some(Bytes::from_static(b"p"));
        bad_will.last_will =
            Some(LastWill { qos: QoS::AtMostOnce, retain: false, topic: "w/#".into(), message: Bytes::new() });
        connect(&scx, &c, bad_will).await;
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::NotAuthorized);

        assert!(scx.channels.is_empty());
        assert_eq!(scx.metrics.client_connack_auth_error(), 1);
        assert_eq!(scx.metrics.client_connack_version_error(), 1);
    }

    #[tokio::test]
    async fn test_assigned_client_id_and_keepalive_cap() {
        let mut inner = Inner::default();
        inner.mqtt.max_keepalive = 30;
        let scx = ServerContext::builder(Settings::from(inner)).build();
        let (c, mut rx) = connecting(&scx);
        let mut conn = Connect::default();
        conn.keep_alive = 0;
        connect(&scx, &c, conn).await;
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::ConnectionAccepted);
        let info = c.info().expect("info");
        assert!(!info.client_id.is_empty());
        assert_eq!(info.keepalive, 30);
    }

    #[tokio::test]
    async fn test_takeover_resumes_session() {
        let scx = ServerContext::builder(Settings::default()).build();
        let persistent = || {
            let mut conn = Connect::default().client_id("p1");
            conn.clean_session = false;
            conn
        };

        let (old, mut old_rx) = connecting(&scx);
        connect(&scx, &old, persistent()).await;
        connack(&mut old_rx);
        scx.registry.subscribe(&"a/#".into(), &old, QoS::AtLeastOnce).expect("");
        old.deliver(&scx, Publish::new("a/1", "inflight", QoS::AtLeastOnce), QoS::AtLeastOnce).await.expect("");

        let (new, mut new_rx) = connecting(&scx);
        let event = connect(&scx, &new, persistent()).await;
        assert!(matches!(event, Some(Event::Connected { session_present: true, .. })));
        assert!(connack(&mut new_rx).session_present);
        assert_eq!(old.status(), ChannelStatus::Closed);
        match new_rx.try_recv() {
            Ok(Packet::Publish(p)) => assert_eq!(p.payload, "inflight"),
            other => panic!("unexpected {:?}", other),
        }

        let subs = scx.registry.matches("a/2");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].channel, new);
        assert_eq!(scx.stats.sessions.count(), 1);
        assert_eq!(scx.stats.connections.count(), 1);
    }

    #[tokio::test]
    async fn test_clean_connect_discards_session() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (old, mut old_rx) = connecting(&scx);
        let mut conn = Connect::default().client_id("p1");
        conn.clean_session = false;
        connect(&scx, &old, conn).await;
        connack(&mut old_rx);
        scx.registry.subscribe(&"a".into(), &old, QoS::AtLeastOnce).expect("");
        old.close(&scx, Reason::TransportClosed).await;
        assert_eq!(old.status(), ChannelStatus::Offline);
        old.deliver(&scx, Publish::new("a", "queued", QoS::AtLeastOnce), QoS::AtLeastOnce).await.expect("");

        let (new, mut new_rx) = connecting(&scx);
        connect(&scx, &new, Connect::default().client_id("p1")).await;
        assert!(!connack(&mut new_rx).session_present);
        assert!(new_rx.try_recv().is_err());
        assert_eq!(old.status(), ChannelStatus::Closed);
        assert!(scx.registry.is_empty());
        assert_eq!(scx.store.session_len(&"p1".into()).await, 0);
        assert_eq!(scx.stats.sessions.count(), 1);
    }

    struct Stall;

    #[async_trait]
    impl crate::auth::Authenticator for Stall {
        async fn authenticate(
            &self,
            username: Option<&crate::types::UserName>,
            _password: Option<&crate::types::Password>,
            _client_id: &ClientId,
        ) -> bool {
            if username.is_some_and(|u| *u == "slow") {
                std::future::pending::<()>().await;
            }
            true
        }
    }

    #[tokio::test]
    async fn test_clean_connect_replaces_online_persistent() {
        let scx = ServerContext::builder(Settings::default()).build();
        let (old, mut old_rx) = connecting(&scx);
        let mut conn = Connect::default().client_id("p");
        conn.clean_session = false;
        connect(&scx, &old, conn).await;
        connack(&mut old_rx);
        assert_eq!(scx.stats.sessions.count(), 1);

        let (new, mut new_rx) = connecting(&scx);
        connect(&scx, &new, Connect::default().client_id("p")).await;
        assert!(!connack(&mut new_rx).session_present);
        assert_eq!(old.status(), ChannelStatus::Closed);
        assert_eq!(scx.channels.len(), 1);
        assert_eq!(scx.channels.get(&"p".into()), Some(new));
        assert_eq!(scx.stats.sessions.count(), 1);
        assert_eq!(scx.stats.connections.count(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_before_will_check() {
        let mut inner = Inner::default();
        inner.auth.allow_anonymous = false;
        let scx = ServerContext::builder(Settings::from(inner)).build();
        let (c, mut rx) = connecting(&scx);
        let mut conn = Connect::default().client_id("c1");
        conn.last_will =
            Some(LastWill { qos: QoS::AtMostOnce, retain: false, topic: "w/#".into(), message: Bytes::new() });
        connect(&scx, &c, conn).await;
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::BadUserNameOrPassword);
        assert_eq!(scx.metrics.client_connack_auth_error(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_handshake_keeps_live_session() {
        let scx = ServerContext::builder(Settings::default()).authenticator(Arc::new(Stall)).build();
        let (old, mut old_rx) = connecting(&scx);
        connect(&scx, &old, Connect::default().client_id("x")).await;
        connack(&mut old_rx);

        let (new, mut new_rx) = connecting(&scx);
        let mut slow = Connect::default().client_id("x");
        slow.username = Some("slow".into());
        let (event, _) = tokio::join!(connect(&scx, &new, slow), async {
            tokio::task::yield_now().await;
            new.token().cancel();
        });
        assert!(event.is_none());
        assert!(new_rx.try_recv().is_err());
        assert_eq!(new.status(), ChannelStatus::Connecting);
        assert!(new.info().is_none());
        assert!(old.is_online());
        assert_eq!(scx.channels.get(&"x".into()), Some(old));
        assert_eq!(scx.stats.sessions.count(), 1);
    }

    #[tokio::test]
    async fn test_custom_authenticator() {
        struct Deny;
        #[async_trait]
        impl crate::auth::Authenticator for Deny {
            async fn authenticate(
                &self,
                _username: Option<&crate::types::UserName>,
                _password: Option<&crate::types::Password>,
                _client_id: &ClientId,
            ) -> bool {
                false
            }
        }
        let scx = ServerContext::builder(Settings::default()).authenticator(Arc::new(Deny)).build();
        let (c, mut rx) = connecting(&scx);
        connect(&scx, &c, Connect::default().client_id("c1")).await;
        assert_eq!(connack(&mut rx).return_code, ConnectAckReason::BadUserNameOrPassword);
    }
}
