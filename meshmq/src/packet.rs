//! Decoded MQTT control packets.
//!
//! Framing and byte-level encoding live outside this crate; a transport hands already
//! decoded [`Packet`] values to the session loop and receives reply packets back on the
//! channel's outbound queue.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ClientId, PacketId, Password, Publish, QoS, TopicFilter, TopicName, UserName};

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConnectAckReason {
    ConnectionAccepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServiceUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl From<ConnectAckReason> for u8 {
    fn from(v: ConnectAckReason) -> Self {
        match v {
            ConnectAckReason::ConnectionAccepted => 0,
            ConnectAckReason::UnacceptableProtocolVersion => 1,
            ConnectAckReason::IdentifierRejected => 2,
            ConnectAckReason::ServiceUnavailable => 3,
            ConnectAckReason::BadUserNameOrPassword => 4,
            ConnectAckReason::NotAuthorized => 5,
        }
    }
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => "Connection Refused, unacceptable protocol version",
            ConnectAckReason::IdentifierRejected => "Connection Refused, identifier rejected",
            ConnectAckReason::ServiceUnavailable => "Connection Refused, Server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "Connection Refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "Connection Refused, not authorized",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
/// Connection Will
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: TopicName,
    pub message: Bytes,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
/// Connect packet content
pub struct Connect {
    /// raw protocol level, validated by the broker
    pub protocol: u8,
    pub clean_session: bool,
    /// seconds, 0 disables the keepalive check
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub password: Option<Password>,
}

impl Default for Connect {
    fn default() -> Self {
        Connect {
            protocol: 4,
            clean_session: true,
            keep_alive: 60,
            last_will: None,
            client_id: ClientId::default(),
            username: None,
            password: None,
        }
    }
}

impl Connect {
    pub fn client_id<T>(mut self, client_id: T) -> Self
    where
        ClientId: From<T>,
    {
        self.client_id = client_id.into();
        self
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    /// whether the server resumed stored session state for this client
    pub session_present: bool,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// MQTT Control Packets
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),

    Publish(Publish),
    PublishAck {
        packet_id: PacketId,
    },
    /// assured delivery part 1
    PublishReceived {
        packet_id: PacketId,
    },
    /// assured delivery part 2
    PublishRelease {
        packet_id: PacketId,
    },
    /// assured delivery part 3
    PublishComplete {
        packet_id: PacketId,
    },

    Subscribe {
        packet_id: PacketId,
        topic_filters: Vec<(TopicFilter, QoS)>,
    },
    SubscribeAck {
        packet_id: PacketId,
        status: Vec<SubscribeReturnCode>,
    },

    Unsubscribe {
        packet_id: PacketId,
        topic_filters: Vec<TopicFilter>,
    },
    UnsubscribeAck {
        packet_id: PacketId,
    },

    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck { .. } => "PUBACK",
            Packet::PublishReceived { .. } => "PUBREC",
            Packet::PublishRelease { .. } => "PUBREL",
            Packet::PublishComplete { .. } => "PUBCOMP",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubscribeAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubscribeAck { .. } => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
