use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::error::MqttError;

pub use meshmq_utils::{NodeId, TimestampMillis};

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type Password = Bytes;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;

/// Broker-local identity of one transport session. Never reused within a process.
pub type ConnectionId = u64;

/// MQTT packet identifier
pub type PacketId = NonZeroU16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn less_value(self, other: QoS) -> QoS {
        self.min(other)
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::HandlerFault(format!("invalid qos value: {}", v))),
        }
    }
}

/// Protocol level carried by CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// 3.1
    V3,
    /// 3.1.1
    V4,
    /// 5.0
    V5,
}

impl Protocol {
    #[inline]
    pub fn level(&self) -> u8 {
        match self {
            Protocol::V3 => 3,
            Protocol::V4 => 4,
            Protocol::V5 => 5,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = MqttError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            3 => Ok(Protocol::V3),
            4 => Ok(Protocol::V4),
            5 => Ok(Protocol::V5),
            _ => Err(MqttError::ProtocolVersionUnsupported(level)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::V3 => f.write_str("MQTT 3.1"),
            Protocol::V4 => f.write_str("MQTT 3.1.1"),
            Protocol::V5 => f.write_str("MQTT 5.0"),
        }
    }
}

/// A published application message.
///
/// The same value is used for inbound PUBLISH packets, outbound deliveries, retained
/// entries, queued session messages and cluster forwards. `packet_id` is the identifier
/// on the current hop only; `client_id` is the original publisher and is filled in by the
/// broker, decoders leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    pub packet_id: Option<PacketId>,
    pub payload: Bytes,

    pub client_id: ClientId,
    pub create_time: TimestampMillis,
}

impl Publish {
    pub fn new<T, P>(topic: T, payload: P, qos: QoS) -> Self
    where
        TopicName: From<T>,
        Bytes: From<P>,
    {
        Publish {
            dup: false,
            retain: false,
            qos,
            topic: TopicName::from(topic),
            packet_id: None,
            payload: Bytes::from(payload),
            client_id: ClientId::default(),
            create_time: meshmq_utils::timestamp_millis(),
        }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = NonZeroU16::new(packet_id);
        self
    }
}

/// What a client established with an accepted CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub protocol: Protocol,
    /// negotiated keepalive, seconds
    pub keepalive: u16,
    pub clean_session: bool,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: TimestampMillis,
}

impl ConnectInfo {
    pub fn new(client_id: ClientId, protocol: Protocol) -> Self {
        ConnectInfo {
            client_id,
            username: None,
            protocol,
            keepalive: 0,
            clean_session: true,
            remote_addr: None,
            connected_at: meshmq_utils::timestamp_millis(),
        }
    }
}

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Publish,
    Subscribe,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => f.write_str("publish"),
            Action::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// Why a channel left the ONLINE state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    ClientDisconnect,
    KeepaliveTimeout,
    HandshakeTimeout,
    ConnectRejected,
    TransportClosed,
    /// Replaced by another connection with the same client id, locally or on `NodeId`
    Kicked(Option<NodeId>),
    /// A persistent reconnect resumed this session on a new connection
    SessionTakenOver,
    SessionExpired,
    /// An offline session was replaced by a clean one
    SessionDiscarded,
    ProtocolError(String),
}

impl Reason {
    /// Graceful closes do not publish the will.
    #[inline]
    pub fn is_graceful(&self) -> bool {
        matches!(self, Reason::ClientDisconnect)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ClientDisconnect => f.write_str("Disconnect"),
            Reason::KeepaliveTimeout => f.write_str("KeepaliveTimeout"),
            Reason::HandshakeTimeout => f.write_str("HandshakeTimeout"),
            Reason::ConnectRejected => f.write_str("ConnectRejected"),
            Reason::TransportClosed => f.write_str("TransportClosed"),
            Reason::Kicked(None) => f.write_str("Kicked"),
            Reason::Kicked(Some(node_id)) => write!(f, "Kicked by node {}", node_id),
            Reason::SessionTakenOver => f.write_str("SessionTakenOver"),
            Reason::SessionExpired => f.write_str("SessionExpired"),
            Reason::SessionDiscarded => f.write_str("SessionDiscarded"),
            Reason::ProtocolError(e) => write!(f, "ProtocolError({})", e),
        }
    }
}
