use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ack::AckManager;
use crate::acl::{AclChecker, DefaultAcl};
use crate::auth::{Authenticator, DefaultAuthenticator};
use crate::channel::ChannelRegistry;
use crate::cluster::{ClusterAdaptor, ClusterMessage, ClusterTransport};
use crate::conf::Settings;
use crate::dispatch::Dispatcher;
use crate::event::{EventSink, LogEventSink};
use crate::metrics::Metrics;
use crate::registry::TopicRegistry;
use crate::stats::Stats;
use crate::store::{DefaultMessageStore, MessageStore};
use crate::types::{ConnectionId, NodeId};

/// Everything a broker instance shares between connections.
///
/// Passed explicitly to every operation; there is no process-global instance.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub node_id: NodeId,
    pub registry: TopicRegistry,
    pub channels: ChannelRegistry,
    pub acks: AckManager,
    pub store: Arc<dyn MessageStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub acl: Arc<dyn AclChecker>,
    pub cluster: Option<ClusterAdaptor>,
    pub dispatcher: Dispatcher,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
    pub stats: Stats,
    next_connection_id: AtomicU64,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[inline]
    pub fn builder(settings: Settings) -> ServerContextBuilder {
        ServerContextBuilder::new(settings)
    }

    /// Allocates a connection id; ids are never reused within the process.
    #[inline]
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Entry point for messages delivered by the cluster transport.
    pub async fn cluster_received(&self, msg: ClusterMessage) {
        match self.cluster.as_ref() {
            Some(cluster) => cluster.on_message(self, msg).await,
            None => log::warn!("cluster message ignored, cluster is not enabled, {:?}", msg),
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext {{ node_id: {}, channels: {} }}", self.node_id, self.channels.len())
    }
}

/// Assembles a [`ServerContext`]; collaborators not supplied fall back to the
/// settings-driven defaults.
pub struct ServerContextBuilder {
    settings: Settings,
    store: Option<Arc<dyn MessageStore>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    acl: Option<Arc<dyn AclChecker>>,
    transport: Option<Arc<dyn ClusterTransport>>,
    dispatcher: Option<Dispatcher>,
    events: Option<Arc<dyn EventSink>>,
}

impl ServerContextBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
            authenticator: None,
            acl: None,
            transport: None,
            dispatcher: None,
            events: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn acl(mut self, acl: Arc<dyn AclChecker>) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Used only when `cluster.enable` is set.
    pub fn cluster_transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> ServerContext {
        let settings = self.settings;
        let mqtt = &settings.mqtt;
        let metrics = Arc::new(Metrics::new());

        let cluster = match (settings.cluster.enable, self.transport) {
            (true, Some(transport)) => Some(ClusterAdaptor::new(transport)),
            (true, None) => {
                log::warn!("cluster is enabled but no transport is configured, running standalone");
                None
            }
            (false, Some(_)) => {
                log::info!("cluster transport ignored, cluster is not enabled");
                None
            }
            (false, None) => None,
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(DefaultMessageStore::new(mqtt.max_session_queue, mqtt.overflow_policy)));
        let authenticator =
            self.authenticator.unwrap_or_else(|| Arc::new(DefaultAuthenticator::new(&settings.auth)));
        let acl = self.acl.unwrap_or_else(|| Arc::new(DefaultAcl::new(settings.acl.clone())));

        ServerContext {
            inner: Arc::new(ServerContextInner {
                node_id: settings.node.id,
                registry: TopicRegistry::new(mqtt.max_topic_levels),
                channels: ChannelRegistry::default(),
                acks: AckManager::new(mqtt.max_retries, mqtt.retry_interval, metrics.clone()),
                store,
                authenticator,
                acl,
                cluster,
                dispatcher: self.dispatcher.unwrap_or_default(),
                events: self.events.unwrap_or_else(|| Arc::new(LogEventSink)),
                metrics,
                stats: Stats::new(),
                next_connection_id: AtomicU64::new(1),
                settings,
            }),
        }
    }
}
