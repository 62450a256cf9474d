//! Outbound QoS 1/2 delivery tracking.
//!
//! Each unacknowledged delivery owns one [`AckRecord`] keyed by
//! `(connection_id, packet_id)` and one timer task. The timer resends the packet with the
//! DUP flag at a fixed interval until the peer acknowledges it or `max_retries` resends
//! have been made, after which the record is dropped and the failure is reported.
//!
//! Every record carries a generation number. Timers only touch the record of their own
//! generation, so an acknowledgement or a replacing `track` racing with a firing timer is
//! resolved by whichever side removes the record first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::error::MqttError;
use crate::metrics::Metrics;
use crate::types::{ConnectionId, DashMap, PacketId, Publish, TimestampMillis};
use crate::utils::{timestamp_millis, Counter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckKey {
    pub connection_id: ConnectionId,
    pub packet_id: PacketId,
}

impl AckKey {
    #[inline]
    pub fn new(connection_id: ConnectionId, packet_id: PacketId) -> Self {
        Self { connection_id, packet_id }
    }
}

impl fmt::Display for AckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection_id, self.packet_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Sent,
    Retrying,
}

/// Which acknowledgement the record waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStage {
    /// PUBACK for QoS 1, PUBREC for QoS 2
    Publish,
    /// PUBCOMP after the broker sent PUBREL
    Release,
}

/// Called with the 1-based attempt number on every resend.
pub type ResendFn = Arc<dyn Fn(u32) + Send + Sync>;

pub struct AckRecord {
    pub key: AckKey,
    pub stage: AckStage,
    pub state: AckState,
    pub retries: u32,
    pub max_retries: u32,
    pub interval: Duration,
    /// The delivered message, kept so an offline session can requeue it
    pub publish: Option<Publish>,
    pub create_time: TimestampMillis,
    resend: ResendFn,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl AckRecord {
    #[inline]
    fn cancel(&self) {
        if let Some(timer) = self.timer.as_ref() {
            timer.abort();
        }
    }
}

impl fmt::Debug for AckRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckRecord")
            .field("key", &self.key)
            .field("stage", &self.stage)
            .field("state", &self.state)
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Clone)]
pub struct AckManager(Arc<AckManagerInner>);

pub struct AckManagerInner {
    records: DashMap<AckKey, AckRecord>,
    //outstanding records per connection, entries removed at zero
    per_connection: DashMap<ConnectionId, usize>,
    max_retries: u32,
    interval: Duration,
    generation: AtomicU64,
    inflights: Counter,
    metrics: Arc<Metrics>,
}

impl std::ops::Deref for AckManager {
    type Target = AckManagerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl AckManager {
    pub fn new(max_retries: u32, interval: Duration, metrics: Arc<Metrics>) -> Self {
        AckManager(Arc::new(AckManagerInner {
            records: DashMap::default(),
            per_connection: DashMap::default(),
            max_retries,
            interval,
            generation: AtomicU64::new(1),
            inflights: Counter::new(),
            metrics,
        }))
    }

    /// Starts tracking a delivery that was just sent.
    ///
    /// A record already tracked under `key` is replaced and its timer cancelled; the
    /// return value tells whether that happened.
    pub fn track(&self, key: AckKey, stage: AckStage, publish: Option<Publish>, resend: ResendFn) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let record = AckRecord {
            key,
            stage,
            state: AckState::Sent,
            retries: 0,
            max_retries: self.max_retries,
            interval: self.interval,
            publish,
            create_time: timestamp_millis(),
            resend,
            generation,
            timer: None,
        };

        let replaced = match self.records.insert(key, record) {
            Some(prev) => {
                prev.cancel();
                log::debug!("{} ack record replaced, previous: {:?}", key, prev);
                true
            }
            None => {
                self.inflights.inc();
                *self.per_connection.entry(key.connection_id).or_default() += 1;
                false
            }
        };

        let timer = tokio::spawn(self.clone().retry_loop(key, generation)).abort_handle();
        match self.records.get_mut(&key) {
            Some(mut r) if r.generation == generation => r.timer = Some(timer),
            _ => timer.abort(),
        }
        replaced
    }

    async fn retry_loop(self, key: AckKey, generation: u64) {
        loop {
            tokio::time::sleep(self.interval).await;

            let resend = match self.records.get_mut(&key) {
                Some(mut r) if r.generation == generation => {
                    if r.retries >= r.max_retries {
                        None
                    } else {
                        r.retries += 1;
                        r.state = AckState::Retrying;
                        Some((r.resend.clone(), r.retries))
                    }
                }
                _ => return,
            };

            match resend {
                Some((resend, attempt)) => {
                    log::debug!("{} resend, attempt: {}", key, attempt);
                    self.metrics.messages_retried_inc();
                    resend(attempt);
                }
                None => {
                    if let Some((_, r)) = self.records.remove_if(&key, |_, r| r.generation == generation) {
                        self.released(key.connection_id);
                        self.metrics.messages_retry_exhausted_inc();
                        log::warn!(
                            "{}",
                            MqttError::RetryExhausted {
                                connection_id: key.connection_id,
                                packet_id: key.packet_id.get(),
                                attempts: r.retries,
                            }
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Removes the record for `key` and cancels its timer.
    pub fn acknowledge(&self, key: &AckKey) -> Option<AckRecord> {
        let (_, record) = self.records.remove(key)?;
        record.cancel();
        self.released(key.connection_id);
        Some(record)
    }

    fn released(&self, connection_id: ConnectionId) {
        self.inflights.dec();
        if let Some(mut n) = self.per_connection.get_mut(&connection_id) {
            *n = n.saturating_sub(1);
        }
        self.per_connection.remove_if(&connection_id, |_, n| *n == 0);
    }

    /// Number of deliveries of `connection_id` awaiting acknowledgement.
    #[inline]
    pub fn connection_len(&self, connection_id: ConnectionId) -> usize {
        self.per_connection.get(&connection_id).map(|n| *n).unwrap_or_default()
    }

    /// Drops every record of a connection, oldest first in the returned list.
    pub fn clear(&self, connection_id: ConnectionId) -> Vec<AckRecord> {
        let keys = self
            .records
            .iter()
            .filter(|entry| entry.key().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        let mut removed = keys.iter().filter_map(|key| self.acknowledge(key)).collect::<Vec<_>>();
        removed.sort_by_key(|r| r.generation);
        removed
    }

    /// Stage of the delivery tracked under `key`.
    #[inline]
    pub fn stage(&self, key: &AckKey) -> Option<AckStage> {
        self.records.get(key).map(|r| r.stage)
    }

    #[inline]
    pub fn contains(&self, key: &AckKey) -> bool {
        self.records.contains_key(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn inflights(&self) -> &Counter {
        &self.inflights
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn pid(id: u16) -> PacketId {
        PacketId::new(id).expect("non-zero")
    }

    fn counting() -> (Arc<AtomicU32>, ResendFn) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        (count, Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_exhausted() {
        let metrics = Arc::new(Metrics::new());
        let acks = AckManager::new(3, Duration::from_secs(5), metrics.clone());
        let key = AckKey::new(1, pid(10));
        let (count, resend) = counting();

        assert!(!acks.track(key, AckStage::Publish, None, resend));
        assert_eq!(acks.inflights().count(), 1);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        {
            let r = acks.records.get(&key).expect("record");
            assert_eq!(r.retries, 1);
            assert_eq!(r.state, AckState::Retrying);
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(acks.contains(&key));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!acks.contains(&key));
        assert_eq!(acks.inflights().count(), 0);
        assert_eq!(acks.connection_len(1), 0);
        assert_eq!(metrics.messages_retry_exhausted(), 1);
        assert_eq!(metrics.messages_retried(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_stops_retries() {
        let acks = AckManager::new(5, Duration::from_secs(5), Arc::new(Metrics::new()));
        let key = AckKey::new(1, pid(1));
        let (count, resend) = counting();
        acks.track(key, AckStage::Publish, None, resend);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let r = acks.acknowledge(&key).expect("record");
        assert_eq!(r.retries, 1);
        assert!(acks.acknowledge(&key).is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(acks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_track_replaces_and_restarts_timer() {
        let acks = AckManager::new(5, Duration::from_secs(5), Arc::new(Metrics::new()));
        let key = AckKey::new(7, pid(3));
        let (first, resend1) = counting();
        let (second, resend2) = counting();

        acks.track(key, AckStage::Publish, None, resend1);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(acks.track(key, AckStage::Release, None, resend2));
        assert_eq!(acks.len(), 1);
        assert_eq!(acks.inflights().count(), 1);
        assert_eq!(acks.connection_len(7), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(acks.acknowledge(&key).map(|r| r.stage), Some(AckStage::Release));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_connection() {
        let acks = AckManager::new(5, Duration::from_secs(5), Arc::new(Metrics::new()));
        let (count, resend) = counting();
        for id in [3, 1, 2] {
            acks.track(AckKey::new(1, pid(id)), AckStage::Publish, None, resend.clone());
        }
        acks.track(AckKey::new(2, pid(1)), AckStage::Publish, None, resend.clone());
        assert_eq!(acks.connection_len(1), 3);

        let cleared = acks.clear(1);
        assert_eq!(cleared.iter().map(|r| r.key.packet_id.get()).collect::<Vec<_>>(), vec![3, 1, 2]);
        assert_eq!(acks.len(), 1);
        assert!(acks.contains(&AckKey::new(2, pid(1))));
        assert_eq!(acks.connection_len(1), 0);
        assert!(acks.per_connection.get(&1).is_none());
        assert_eq!(acks.connection_len(2), 1);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
