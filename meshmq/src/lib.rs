//! meshmq, the core of an MQTT 3.1.1 broker.
//!
//! Transports decode packets and feed them to [`session::spawn`]; everything after that
//! runs here: authentication and authorization, topic routing, QoS 1/2 acknowledgement
//! and retry, retained messages, offline session queues and the optional cluster fan-out.
//!
//! ```no_run
//! use meshmq::conf::Settings;
//! use meshmq::context::ServerContext;
//!
//! # async fn run() -> meshmq::Result<()> {
//! let settings = Settings::new(None)?;
//! meshmq::logger::init_logger(&settings)?;
//! let scx = ServerContext::builder(settings).build();
//! let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(128);
//! let (channel, outbound_rx, task) = meshmq::session::spawn(&scx, inbound_rx, None);
//! # drop((inbound_tx, channel, outbound_rx, task));
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![recursion_limit = "256"]

pub mod ack;
pub mod acl;
pub mod auth;
pub mod channel;
pub mod cluster;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod logger;
pub mod metrics;
pub mod packet;
pub mod registry;
pub mod session;
pub mod stats;
pub mod store;
pub mod topic;
pub mod trie;
pub mod types;

pub use meshmq_conf as conf;
pub use meshmq_macros as macros;
pub use meshmq_utils as utils;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T>;
