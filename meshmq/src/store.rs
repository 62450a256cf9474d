//! Retained messages and offline session queues.
//!
//! | Method                   | Cost                                  |
//! |--------------------------|---------------------------------------|
//! | `save_retained()`        | O(1)                                  |
//! | `matches_retained()`     | O(1) for a literal filter, O(n) else  |
//! | `save_session_message()` | O(1)                                  |
//! | `drain_session()`        | O(k), k = queued messages             |

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::conf::OverflowPolicy;
use crate::error::MqttError;
use crate::topic::Topic;
use crate::types::{ClientId, DashMap, Publish, TopicFilter, TopicName};
use crate::utils::Counter;
use crate::Result;

/// What happened to a message handed to a session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// Queued after evicting the returned oldest message
    Evicted(Publish),
    /// The queue was full and the returned message was refused
    Rejected(Publish),
}

impl QueueOutcome {
    #[inline]
    pub fn is_overflow(&self) -> bool {
        !matches!(self, QueueOutcome::Queued)
    }
}

#[async_trait]
pub trait MessageStore: Sync + Send {
    ///Stores `msg` as the retained message of its topic, an empty payload deletes it
    async fn save_retained(&self, msg: Publish) -> Result<()>;

    ///topic - concrete topic
    async fn get_retained(&self, topic: &TopicName) -> Result<Option<Publish>>;

    ///Retained messages whose topic is selected by `topic_filter`
    async fn matches_retained(&self, topic_filter: &TopicFilter) -> Result<Vec<Publish>>;

    async fn retained_count(&self) -> isize;

    ///Appends to the client's offline queue, applying the overflow policy
    async fn save_session_message(&self, client_id: &ClientId, msg: Publish) -> Result<QueueOutcome>;

    ///Removes and returns the oldest queued message
    async fn pop_session_message(&self, client_id: &ClientId) -> Result<Option<Publish>>;

    ///Removes and returns the whole queue in enqueue order
    async fn drain_session(&self, client_id: &ClientId) -> Result<Vec<Publish>>;

    ///Discards the queue, returning how many messages were dropped
    async fn remove_session(&self, client_id: &ClientId) -> Result<usize>;

    async fn session_len(&self, client_id: &ClientId) -> usize;

    ///Messages queued across all sessions
    async fn session_messages(&self) -> isize;
}

pub struct DefaultMessageStore {
    retaineds: DashMap<TopicName, Publish>,
    sessions: DashMap<ClientId, VecDeque<Publish>>,
    capacity: usize,
    policy: OverflowPolicy,
    retained_count: Counter,
    queued_count: Counter,
}

impl DefaultMessageStore {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            retaineds: DashMap::default(),
            sessions: DashMap::default(),
            capacity,
            policy,
            retained_count: Counter::new(),
            queued_count: Counter::new(),
        }
    }
}

#[async_trait]
impl MessageStore for DefaultMessageStore {
    async fn save_retained(&self, mut msg: Publish) -> Result<()> {
        if msg.payload.is_empty() {
            if self.retaineds.remove(&msg.topic).is_some() {
                self.retained_count.dec();
            }
            return Ok(());
        }
        msg.dup = false;
        msg.retain = true;
        msg.packet_id = None;
        if self.retaineds.insert(msg.topic.clone(), msg).is_none() {
            self.retained_count.inc();
        }
        Ok(())
    }

    async fn get_retained(&self, topic: &TopicName) -> Result<Option<Publish>> {
        Ok(self.retaineds.get(topic).map(|r| r.value().clone()))
    }

    async fn matches_retained(&self, topic_filter: &TopicFilter) -> Result<Vec<Publish>> {
        let filter: Topic = topic_filter.parse().map_err(MqttError::from)?;
        if !filter.has_wildcard() {
            return Ok(self.retaineds.get(topic_filter).map(|r| vec![r.value().clone()]).unwrap_or_default());
        }
        let mut out = self
            .retaineds
            .iter()
            .filter(|entry| filter.matches_str(entry.key()))
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        out.sort_by_key(|p| p.create_time);
        Ok(out)
    }

    #[inline]
    async fn retained_count(&self) -> isize {
        self.retained_count.count()
    }

    async fn save_session_message(&self, client_id: &ClientId, msg: Publish) -> Result<QueueOutcome> {
        if self.capacity == 0 {
            log::warn!("{}", MqttError::StoreOverflow { client_id: client_id.clone(), capacity: 0 });
            return Ok(QueueOutcome::Rejected(msg));
        }
        let mut queue = self.sessions.entry(client_id.clone()).or_default();
        if queue.len() < self.capacity {
            queue.push_back(msg);
            self.queued_count.inc();
            return Ok(QueueOutcome::Queued);
        }

        log::warn!(
            "{}, policy: {:?}",
            MqttError::StoreOverflow { client_id: client_id.clone(), capacity: self.capacity },
            self.policy
        );
        match self.policy {
            OverflowPolicy::RejectNewest => Ok(QueueOutcome::Rejected(msg)),
            OverflowPolicy::DropOldest => match queue.pop_front() {
                Some(oldest) => {
                    queue.push_back(msg);
                    Ok(QueueOutcome::Evicted(oldest))
                }
                None => Ok(QueueOutcome::Rejected(msg)),
            },
        }
    }

    async fn pop_session_message(&self, client_id: &ClientId) -> Result<Option<Publish>> {
        let msg = self.sessions.get_mut(client_id).and_then(|mut q| q.pop_front());
        self.sessions.remove_if(client_id, |_, q| q.is_empty());
        if msg.is_some() {
            self.queued_count.dec();
        }
        Ok(msg)
    }

    async fn drain_session(&self, client_id: &ClientId) -> Result<Vec<Publish>> {
        let msgs: Vec<Publish> = self.sessions.remove(client_id).map(|(_, q)| q.into()).unwrap_or_default();
        self.queued_count.decs(msgs.len() as isize);
        Ok(msgs)
    }

    async fn remove_session(&self, client_id: &ClientId) -> Result<usize> {
        let n = self.sessions.remove(client_id).map(|(_, q)| q.len()).unwrap_or_default();
        self.queued_count.decs(n as isize);
        Ok(n)
    }

    async fn session_len(&self, client_id: &ClientId) -> usize {
        self.sessions.get(client_id).map(|q| q.len()).unwrap_or_default()
    }

    #[inline]
    async fn session_messages(&self) -> isize {
        self.queued_count.count()
    }
}
