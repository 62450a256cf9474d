//! Subscription index.
//!
//! Filters without wildcards live in a flat map keyed by the literal topic, so an exact
//! lookup is a single hash probe. Wildcard filters live in topic trees sharded by their
//! first level (`sport`, `+`, `#`, ...). A publish to `sport/x` only touches the exact map
//! and the `sport`, `+` and `#` shards, and writers lock one shard at a time.

use std::fmt;

use crate::channel::Channel;
use crate::error::MqttError;
use crate::topic::{parse_topic_name, Level, Topic};
use crate::trie::TopicTree;
use crate::types::{ConnectionId, DashMap, HashMap, QoS, TopicFilter, TopicName};
use crate::utils::Counter;

/// A filter a connection subscribed to, with the QoS it was granted.
#[derive(Clone)]
pub struct Subscription {
    pub topic_filter: TopicFilter,
    pub qos: QoS,
    pub channel: Channel,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscription({}, {:?}, {:?})", self.topic_filter, self.qos, self.channel)
    }
}

pub struct TopicRegistry {
    exact: DashMap<TopicName, HashMap<ConnectionId, Subscription>>,
    wildcards: DashMap<Level, TopicTree<ConnectionId, Subscription>>,
    max_levels: usize,
    subscriptions: Counter,
}

impl TopicRegistry {
    /// `max_levels` of 0 leaves filter depth unlimited.
    pub fn new(max_levels: usize) -> Self {
        Self {
            exact: DashMap::default(),
            wildcards: DashMap::default(),
            max_levels,
            subscriptions: Counter::new(),
        }
    }

    fn parse_filter(&self, topic_filter: &str) -> Result<Topic, MqttError> {
        let topic: Topic = topic_filter.parse()?;
        if self.max_levels > 0 && topic.levels().len() > self.max_levels {
            return Err(MqttError::InvalidTopic(format!(
                "topic filter `{}` exceeds {} levels",
                topic_filter, self.max_levels
            )));
        }
        Ok(topic)
    }

    /// Adds or refreshes `channel`'s subscription to `topic_filter`.
    ///
    /// Returns `true` when the subscription is new, `false` when an existing one for the
    /// same connection and filter was replaced.
    pub fn subscribe(&self, topic_filter: &TopicFilter, channel: &Channel, qos: QoS) -> Result<bool, MqttError> {
        let topic = self.parse_filter(topic_filter)?;
        let sub = Subscription { topic_filter: topic_filter.clone(), qos, channel: channel.clone() };

        let prev = if topic.has_wildcard() {
            let shard = topic.levels()[0].clone();
            self.wildcards.entry(shard).or_default().insert(&topic, channel.id(), sub)
        } else {
            self.exact.entry(topic_filter.clone()).or_default().insert(channel.id(), sub)
        };
        channel.add_topic(topic_filter.clone(), qos);

        if prev.is_none() {
            self.subscriptions.inc();
        }
        Ok(prev.is_none())
    }

    /// Removes `channel`'s subscriptions to the given filters, returning how many existed.
    pub fn unsubscribe(&self, channel: &Channel, topic_filters: &[TopicFilter]) -> usize {
        let mut removed = 0;
        for topic_filter in topic_filters {
            channel.remove_topic(topic_filter);
            let topic = match self.parse_filter(topic_filter) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("{:?} unsubscribe ignored, {}", channel, e);
                    continue;
                }
            };
            if self.remove(&topic, topic_filter, channel.id()) {
                removed += 1;
            }
        }
        self.subscriptions.decs(removed as isize);
        removed
    }

    /// Removes every subscription the channel holds.
    #[inline]
    pub fn unsubscribe_all(&self, channel: &Channel) -> usize {
        let topic_filters = channel.topics().into_iter().map(|(tf, _)| tf).collect::<Vec<_>>();
        self.unsubscribe(channel, &topic_filters)
    }

    fn remove(&self, topic: &Topic, topic_filter: &TopicFilter, id: ConnectionId) -> bool {
        if topic.has_wildcard() {
            let shard = &topic.levels()[0];
            let (removed, empty) = match self.wildcards.get_mut(shard) {
                Some(mut tree) => {
                    let removed = tree.remove(topic, &id).is_some();
                    (removed, tree.is_empty())
                }
                None => (false, false),
            };
            if empty {
                self.wildcards.remove_if(shard, |_, tree| tree.is_empty());
            }
            removed
        } else {
            let (removed, empty) = match self.exact.get_mut(topic_filter) {
                Some(mut subs) => {
                    let removed = subs.remove(&id).is_some();
                    (removed, subs.is_empty())
                }
                None => (false, false),
            };
            if empty {
                self.exact.remove_if(topic_filter, |_, subs| subs.is_empty());
            }
            removed
        }
    }

    /// All subscriptions whose filter selects the topic name `topic`.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let mut out = Vec::new();
        let levels = match parse_topic_name(topic) {
            Ok(t) => t,
            Err(e) => {
                log::debug!("match skipped, {}", e);
                return out;
            }
        };

        if let Some(subs) = self.exact.get(topic) {
            out.extend(subs.values().cloned());
        }

        let first = &levels.levels()[0];
        if let Some(tree) = self.wildcards.get(first) {
            tree.matches(levels.levels(), &mut out);
        }
        if !first.is_metadata() {
            for shard in [Level::SingleWildcard, Level::MultiWildcard] {
                if let Some(tree) = self.wildcards.get(&shard) {
                    tree.matches(levels.levels(), &mut out);
                }
            }
        }
        out
    }

    #[inline]
    pub fn subscriptions(&self) -> &Counter {
        &self.subscriptions
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TopicRegistry {{ exact: {}, wildcard_shards: {}, subscriptions: {:?} }}",
            self.exact.len(),
            self.wildcards.len(),
            self.subscriptions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::online_channel;

    fn ids(subs: &[Subscription]) -> Vec<(ConnectionId, String)> {
        let mut v = subs.iter().map(|s| (s.channel.id(), s.topic_filter.to_string())).collect::<Vec<_>>();
        v.sort();
        v
    }

    #[test]
    fn test_subscribe_and_match() {
        let reg = TopicRegistry::new(0);
        let (c1, _rx1) = online_channel(1, "c1");
        let (c2, _rx2) = online_channel(2, "c2");

        assert!(reg.subscribe(&"sport/+/player1".into(), &c1, QoS::AtLeastOnce).expect(""));
        assert!(reg.subscribe(&"sport/#".into(), &c2, QoS::AtMostOnce).expect(""));
        assert!(reg.subscribe(&"sport/tennis/player1".into(), &c2, QoS::ExactlyOnce).expect(""));
        assert!(reg.subscribe(&"#".into(), &c1, QoS::AtMostOnce).expect(""));
        assert_eq!(reg.subscriptions().count(), 4);

        assert_eq!(
            ids(&reg.matches("sport/tennis/player1")),
            vec![
                (1, "#".to_string()),
                (1, "sport/+/player1".to_string()),
                (2, "sport/#".to_string()),
                (2, "sport/tennis/player1".to_string())
            ]
        );
        assert_eq!(
            ids(&reg.matches("sport/tennis/player1/ranking")),
            vec![(1, "#".to_string()), (2, "sport/#".to_string())]
        );
        assert_eq!(ids(&reg.matches("sport")), vec![(1, "#".to_string()), (2, "sport/#".to_string())]);
        assert!(reg.matches("$SYS/x").is_empty());
        assert!(reg.matches("a/+").is_empty());
    }

    #[test]
    fn test_subscribe_is_idempotent_per_connection() {
        let reg = TopicRegistry::new(0);
        let (c1, _rx1) = online_channel(1, "c1");

        assert!(reg.subscribe(&"a/+".into(), &c1, QoS::AtMostOnce).expect(""));
        assert!(!reg.subscribe(&"a/+".into(), &c1, QoS::ExactlyOnce).expect(""));
        assert!(reg.subscribe(&"a/b".into(), &c1, QoS::AtMostOnce).expect(""));
        assert!(!reg.subscribe(&"a/b".into(), &c1, QoS::AtLeastOnce).expect(""));

        let subs = reg.matches("a/b");
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().any(|s| s.topic_filter == "a/+" && s.qos == QoS::ExactlyOnce));
        assert!(subs.iter().any(|s| s.topic_filter == "a/b" && s.qos == QoS::AtLeastOnce));
        assert_eq!(reg.subscriptions().count(), 2);
        assert_eq!(c1.topics().len(), 2);
    }

    #[test]
    fn test_unsubscribe_prunes() {
        let reg = TopicRegistry::new(0);
        let (c1, _rx1) = online_channel(1, "c1");
        let (c2, _rx2) = online_channel(2, "c2");

        reg.subscribe(&"a/+".into(), &c1, QoS::AtMostOnce).expect("");
        reg.subscribe(&"a/+".into(), &c2, QoS::AtMostOnce).expect("");
        reg.subscribe(&"a/b".into(), &c1, QoS::AtMostOnce).expect("");

        assert_eq!(reg.unsubscribe(&c1, &["a/+".into(), "a/b".into(), "nope".into()]), 2);
        assert_eq!(ids(&reg.matches("a/b")), vec![(2, "a/+".to_string())]);
        assert!(c1.topics().is_empty());

        assert_eq!(reg.unsubscribe_all(&c2), 1);
        assert!(reg.is_empty());
        assert_eq!(reg.subscriptions().count(), 0);
    }

    #[test]
    fn test_invalid_filters() {
        let reg = TopicRegistry::new(3);
        let (c1, _rx1) = online_channel(1, "c1");
        assert!(reg.subscribe(&"a/#/b".into(), &c1, QoS::AtMostOnce).is_err());
        assert!(reg.subscribe(&"a+".into(), &c1, QoS::AtMostOnce).is_err());
        assert!(reg.subscribe(&"a/b/c/d".into(), &c1, QoS::AtMostOnce).is_err());
        assert!(reg.subscribe(&"a/b/c".into(), &c1, QoS::AtMostOnce).is_ok());
        assert!(c1.topics().iter().all(|(tf, _)| tf == "a/b/c"));
    }
}
