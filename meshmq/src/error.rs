use crate::packet::ConnectAckReason;
use crate::topic::TopicError;
use crate::types::{Action, ClientId, ConnectionId, TopicName};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MqttError {
    #[error("unsupported protocol version, level: {0}")]
    ProtocolVersionUnsupported(u8),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("not authorized to {1} `{0}`")]
    AuthorizationDenied(TopicName, Action),
    #[error("handler fault, {0}")]
    HandlerFault(String),
    #[error("retry exhausted, connection: {connection_id}, packet id: {packet_id}, attempts: {attempts}")]
    RetryExhausted { connection_id: ConnectionId, packet_id: u16, attempts: u32 },
    #[error("session queue overflow, client: {client_id}, capacity: {capacity}")]
    StoreOverflow { client_id: ClientId, capacity: usize },
    #[error("invalid topic, {0}")]
    InvalidTopic(String),
    #[error("not connected")]
    NotConnected,
    #[error("channel closed")]
    ChannelClosed,
    #[error("outbound queue full")]
    OutboundFull,
    #[error("no handler registered for {0}")]
    NoHandler(&'static str),
    #[error("no free packet id")]
    PacketIdExhausted,
    #[error("codec error, {0}")]
    Codec(String),
}

impl MqttError {
    /// CONNACK code reported when this error rejects a CONNECT.
    pub fn connack_reason(&self) -> ConnectAckReason {
        match self {
            MqttError::ProtocolVersionUnsupported(_) => ConnectAckReason::UnacceptableProtocolVersion,
            MqttError::AuthenticationFailed => ConnectAckReason::BadUserNameOrPassword,
            MqttError::IdentifierRejected => ConnectAckReason::IdentifierRejected,
            MqttError::AuthorizationDenied(..) | MqttError::InvalidTopic(_) => ConnectAckReason::NotAuthorized,
            _ => ConnectAckReason::ServiceUnavailable,
        }
    }
}

impl From<TopicError> for MqttError {
    fn from(e: TopicError) -> Self {
        MqttError::InvalidTopic(e.to_string())
    }
}

impl From<bincode::Error> for MqttError {
    fn from(e: bincode::Error) -> Self {
        MqttError::Codec(e.to_string())
    }
}
