#![deny(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use meshmq_utils::{deserialize_duration, NodeAddr, NodeId};

use self::logging::Log;

pub mod logging;

pub type Result<T> = anyhow::Result<T>;

/// Broker settings, cheap to clone and shared by every component of a server context.
#[derive(Clone, Default)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub acl: Vec<AclRule>,
    #[serde(default)]
    pub cluster: Cluster,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Settings {
    /// Loads settings from the standard file locations, an optional explicit file and
    /// `MESHMQ__*` environment variables, later sources overriding earlier ones.
    pub fn new(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/meshmq/meshmq").required(false))
            .add_source(File::with_name("meshmq").required(false));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("meshmq")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("node_id is {}", self.node.id);
        log::info!("mqtt config is {:?}", self.mqtt);
        log::info!("cluster enable is {}, peers: {:?}", self.cluster.enable, self.cluster.node_addrs);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")
    }
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: NodeId,
}

/// What to do when a client's session queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Refuse the incoming message
    RejectNewest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    //Resend attempts for an unacknowledged QoS 1/2 delivery before giving up.
    #[serde(default = "Mqtt::max_retries_default")]
    pub max_retries: u32,
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    //Idle deadline = keepalive * keepalive_backoff.
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    //Max time between transport accept and CONNECT.
    #[serde(default = "Mqtt::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    //0 means the client's value is accepted as is.
    #[serde(default)]
    pub max_keepalive: u16,
    //Unacknowledged QoS 1/2 deliveries per connection, 0 means unlimited. Deliveries
    //beyond the limit wait in the session queue.
    #[serde(default = "Mqtt::max_inflight_default")]
    pub max_inflight: usize,
    //Packets buffered towards one transport writer.
    #[serde(default = "Mqtt::max_outbound_packets_default")]
    pub max_outbound_packets: usize,
    #[serde(default = "Mqtt::max_session_queue_default")]
    pub max_session_queue: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default = "Mqtt::session_expiry_default", deserialize_with = "deserialize_duration")]
    pub session_expiry: Duration,
    //0 means unlimited.
    #[serde(default)]
    pub max_topic_levels: usize,
    #[serde(default = "Mqtt::allow_zero_length_clientid_default")]
    pub allow_zero_length_clientid: bool,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            max_retries: Self::max_retries_default(),
            retry_interval: Self::retry_interval_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            max_keepalive: 0,
            max_inflight: Self::max_inflight_default(),
            max_outbound_packets: Self::max_outbound_packets_default(),
            max_session_queue: Self::max_session_queue_default(),
            overflow_policy: OverflowPolicy::default(),
            session_expiry: Self::session_expiry_default(),
            max_topic_levels: 0,
            allow_zero_length_clientid: Self::allow_zero_length_clientid_default(),
        }
    }
}

impl Mqtt {
    fn max_retries_default() -> u32 {
        5
    }
    fn retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn keepalive_backoff_default() -> f32 {
        2.0
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn max_inflight_default() -> usize {
        16
    }
    fn max_outbound_packets_default() -> usize {
        1024
    }
    fn max_session_queue_default() -> usize {
        1000
    }
    fn session_expiry_default() -> Duration {
        Duration::from_secs(2 * 60 * 60)
    }
    fn allow_zero_length_clientid_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    #[serde(default = "Auth::allow_anonymous_default")]
    pub allow_anonymous: bool,
    //username => password
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for Auth {
    fn default() -> Self {
        Self { allow_anonymous: Self::allow_anonymous_default(), users: HashMap::new() }
    }
}

impl Auth {
    fn allow_anonymous_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    Publish,
    Subscribe,
    All,
}

/// One ACL rule. Topics may use the `${clientid}` and `${username}` placeholders.
#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    pub permission: Permission,
    pub action: AclAction,
    pub topic: String,
    #[serde(default)]
    pub clientid: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub node_addrs: Vec<NodeAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.node.id, 0);
        assert_eq!(s.mqtt.max_retries, 5);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(20));
        assert_eq!(s.mqtt.keepalive_backoff, 2.0);
        assert_eq!(s.mqtt.max_session_queue, 1000);
        assert_eq!(s.mqtt.max_inflight, 16);
        assert_eq!(s.mqtt.max_outbound_packets, 1024);
        assert_eq!(s.mqtt.overflow_policy, OverflowPolicy::DropOldest);
        assert!(s.auth.allow_anonymous);
        assert!(s.acl.is_empty());
        assert!(!s.cluster.enable);
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("meshmq-conf-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[node]
id = 3

[log]
to = "both"
level = "debug"

[mqtt]
max_retries = 2
retry_interval = "500ms"
max_session_queue = 16
max_inflight = 4
overflow_policy = "reject_newest"
session_expiry = "1m"

[auth]
allow_anonymous = false
users = { alice = "secret" }

[[acl]]
permission = "deny"
action = "publish"
topic = "sys/#"

[cluster]
enable = true
node_addrs = ["1@127.0.0.1:5363", "2@127.0.0.1:5364"]
"#,
        )
        .expect("write config");

        let s = Settings::new(path.to_str()).expect("Settings creation failed");
        let _ = std::fs::remove_file(&path);

        assert_eq!(s.node.id, 3);
        assert_eq!(s.log.to, logging::To::Both);
        assert_eq!(s.log.level.inner(), slog::Level::Debug);
        assert_eq!(s.mqtt.max_retries, 2);
        assert_eq!(s.mqtt.retry_interval, Duration::from_millis(500));
        assert_eq!(s.mqtt.max_session_queue, 16);
        assert_eq!(s.mqtt.max_inflight, 4);
        assert_eq!(s.mqtt.overflow_policy, OverflowPolicy::RejectNewest);
        assert_eq!(s.mqtt.session_expiry, Duration::from_secs(60));
        assert!(!s.auth.allow_anonymous);
        assert_eq!(s.auth.users.get("alice").map(|p| p.as_str()), Some("secret"));
        assert_eq!(s.acl.len(), 1);
        assert_eq!(s.acl[0].permission, Permission::Deny);
        assert_eq!(s.acl[0].action, AclAction::Publish);
        assert!(s.cluster.enable);
        assert_eq!(s.cluster.node_addrs.len(), 2);
        assert_eq!(s.cluster.node_addrs[1].id, 2);
    }
}
