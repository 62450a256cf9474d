use std::fmt;

use bytes::Bytes;
use serde_json::json;

use crate::packet::SubscribeReturnCode;
use crate::types::{ClientId, ConnectionId, QoS, Reason, TimestampMillis, TopicFilter, TopicName, UserName};
use crate::utils::format_timestamp_millis;

/// Target used for audit records written by [`LogEventSink`].
pub const AUDIT_TARGET: &str = "meshmq::audit";

/// Observable broker events, returned by dispatch and handed to an [`EventSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected {
        client_id: ClientId,
        username: Option<UserName>,
        connection_id: ConnectionId,
        session_present: bool,
        time: TimestampMillis,
    },
    Published {
        client_id: ClientId,
        topic: TopicName,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        time: TimestampMillis,
    },
    Subscribed {
        client_id: ClientId,
        topic_filters: Vec<(TopicFilter, SubscribeReturnCode)>,
        time: TimestampMillis,
    },
    Unsubscribed {
        client_id: ClientId,
        topic_filters: Vec<TopicFilter>,
        time: TimestampMillis,
    },
    Disconnected {
        client_id: ClientId,
        reason: Reason,
        time: TimestampMillis,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "client.connected",
            Event::Published { .. } => "message.publish",
            Event::Subscribed { .. } => "session.subscribed",
            Event::Unsubscribed { .. } => "session.unsubscribed",
            Event::Disconnected { .. } => "client.disconnected",
        }
    }

    pub fn client_id(&self) -> &ClientId {
        match self {
            Event::Connected { client_id, .. }
            | Event::Published { client_id, .. }
            | Event::Subscribed { client_id, .. }
            | Event::Unsubscribed { client_id, .. }
            | Event::Disconnected { client_id, .. } => client_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Event::Connected { client_id, username, connection_id, session_present, time } => json!({
                "event": self.name(),
                "clientid": client_id,
                "username": username,
                "connection_id": connection_id,
                "session_present": session_present,
                "time": format_timestamp_millis(*time),
            }),
            Event::Published { client_id, topic, qos, retain, payload, time } => json!({
                "event": self.name(),
                "clientid": client_id,
                "topic": topic,
                "qos": qos.value(),
                "retain": retain,
                "payload": String::from_utf8_lossy(payload),
                "time": format_timestamp_millis(*time),
            }),
            Event::Subscribed { client_id, topic_filters, time } => {
                let topics = topic_filters
                    .iter()
                    .map(|(tf, code)| {
                        let qos = match code {
                            SubscribeReturnCode::Success(qos) => json!(qos.value()),
                            SubscribeReturnCode::Failure => json!(null),
                        };
                        json!({ "topic": tf, "qos": qos })
                    })
                    .collect::<Vec<_>>();
                json!({
                    "event": self.name(),
                    "clientid": client_id,
                    "topics": topics,
                    "time": format_timestamp_millis(*time),
                })
            }
            Event::Unsubscribed { client_id, topic_filters, time } => json!({
                "event": self.name(),
                "clientid": client_id,
                "topics": topic_filters,
                "time": format_timestamp_millis(*time),
            }),
            Event::Disconnected { client_id, reason, time } => json!({
                "event": self.name(),
                "clientid": client_id,
                "reason": reason.to_string(),
                "time": format_timestamp_millis(*time),
            }),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Receives every event produced by dispatch. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    #[inline]
    fn emit(&self, event: &Event) {
        log::info!(target: AUDIT_TARGET, "{}", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json() {
        let e = Event::Published {
            client_id: "c1".into(),
            topic: "a/b".into(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: Bytes::from_static(b"hi"),
            time: 0,
        };
        let v = e.to_json();
        assert_eq!(v["event"], "message.publish");
        assert_eq!(v["clientid"], "c1");
        assert_eq!(v["qos"], 1);
        assert_eq!(v["payload"], "hi");
        assert_eq!(e.client_id(), &ClientId::from("c1"));

        let e = Event::Subscribed {
            client_id: "c1".into(),
            topic_filters: vec![
                ("a/+".into(), SubscribeReturnCode::Success(QoS::ExactlyOnce)),
                ("a/#/b".into(), SubscribeReturnCode::Failure),
            ],
            time: 0,
        };
        let v = e.to_json();
        assert_eq!(v["topics"][0]["qos"], 2);
        assert!(v["topics"][1]["qos"].is_null());

        let e = Event::Disconnected { client_id: "c1".into(), reason: Reason::KeepaliveTimeout, time: 0 };
        assert_eq!(e.to_json()["reason"], "KeepaliveTimeout");
    }
}
