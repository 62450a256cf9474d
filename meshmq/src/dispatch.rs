//! Message-kind to handler table.
//!
//! The table is assembled once, before the server context is built, and never changes
//! afterwards. A handler failure is contained to the one message being handled.

use std::fmt;

use async_trait::async_trait;

use crate::channel::Channel;
use crate::context::ServerContext;
use crate::error::MqttError;
use crate::event::Event;
use crate::handler;
use crate::packet::Packet;
use crate::types::{ClientId, HashMap, Reason};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Connect,
    ConnectAck,
    Publish,
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
    /// broker internal, a channel left the online state
    Disconnected,
}

/// Input of the dispatch engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Packet(Packet),
    Disconnected { client_id: ClientId, reason: Reason },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Packet(p) => match p {
                Packet::Connect(_) => Kind::Connect,
                Packet::ConnectAck(_) => Kind::ConnectAck,
                Packet::Publish(_) => Kind::Publish,
                Packet::PublishAck { .. } => Kind::PublishAck,
                Packet::PublishReceived { .. } => Kind::PublishReceived,
                Packet::PublishRelease { .. } => Kind::PublishRelease,
                Packet::PublishComplete { .. } => Kind::PublishComplete,
                Packet::Subscribe { .. } => Kind::Subscribe,
                Packet::SubscribeAck { .. } => Kind::SubscribeAck,
                Packet::Unsubscribe { .. } => Kind::Unsubscribe,
                Packet::UnsubscribeAck { .. } => Kind::UnsubscribeAck,
                Packet::PingRequest => Kind::PingRequest,
                Packet::PingResponse => Kind::PingResponse,
                Packet::Disconnect => Kind::Disconnect,
            },
            Message::Disconnected { .. } => Kind::Disconnected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Packet(p) => p.name(),
            Message::Disconnected { .. } => "DISCONNECTED",
        }
    }
}

impl From<Packet> for Message {
    fn from(p: Packet) -> Self {
        Message::Packet(p)
    }
}

#[async_trait]
pub trait Handler: Sync + Send {
    /// `channel` is `None` for messages entering from the cluster.
    async fn handle(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Result<Option<Event>>;
}

pub struct Dispatcher {
    handlers: HashMap<Kind, Box<dyn Handler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// The standard handler set.
    pub fn new() -> Self {
        let mut handlers: HashMap<Kind, Box<dyn Handler>> = HashMap::default();
        handlers.insert(Kind::Connect, Box::new(handler::connect::ConnectHandler));
        handlers.insert(Kind::Publish, Box::new(handler::publish::PublishHandler));
        handlers.insert(Kind::PublishRelease, Box::new(handler::publish::PublishReleaseHandler));
        handlers.insert(Kind::PublishAck, Box::new(handler::delivery::PublishAckHandler));
        handlers.insert(Kind::PublishReceived, Box::new(handler::delivery::PublishReceivedHandler));
        handlers.insert(Kind::PublishComplete, Box::new(handler::delivery::PublishCompleteHandler));
        handlers.insert(Kind::Subscribe, Box::new(handler::subscribe::SubscribeHandler));
        handlers.insert(Kind::Unsubscribe, Box::new(handler::subscribe::UnsubscribeHandler));
        handlers.insert(Kind::PingRequest, Box::new(handler::connect::PingHandler));
        handlers.insert(Kind::Disconnect, Box::new(handler::connect::DisconnectHandler));
        handlers.insert(Kind::Disconnected, Box::new(handler::connect::DisconnectedHandler));
        Self { handlers }
    }

    /// Replaces the handler of `kind`.
    pub fn handler<H: Handler + 'static>(mut self, kind: Kind, h: H) -> Self {
        self.handlers.insert(kind, Box::new(h));
        self
    }

    #[inline]
    pub fn contains(&self, kind: Kind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Runs the handler for `msg`, hands the resulting event to the event sink and
    /// returns it. Errors are logged and swallowed.
    pub async fn dispatch(&self, scx: &ServerContext, msg: Message, channel: Option<&Channel>) -> Option<Event> {
        let kind = msg.kind();
        let name = msg.name();
        let res = match self.handlers.get(&kind) {
            Some(h) => h.handle(scx, msg, channel).await,
            None => Err(MqttError::NoHandler(name).into()),
        };
        match res {
            Ok(Some(event)) => {
                scx.events.emit(&event);
                Some(event)
            }
            Ok(None) => None,
            Err(e) => {
                match e.downcast_ref::<MqttError>() {
                    Some(MqttError::AuthorizationDenied(..)) => {
                        log::info!("{:?} {} dropped, {}", channel, name, e)
                    }
                    _ => {
                        scx.metrics.handler_faults_inc();
                        log::warn!("{:?} {}", channel, MqttError::HandlerFault(format!("{}, {:?}", name, e)));
                    }
                }
                None
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dispatcher {{ handlers: {} }}", self.handlers.len())
    }
}
