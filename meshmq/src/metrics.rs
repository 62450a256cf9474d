//! Monotonic broker counters.
//!
//! Every field gets a `<name>_inc()` incrementer and a `<name>()` getter from
//! `#[derive(Metrics)]`; `to_json()` renders keys with `.` in place of `_`
//! (`client_connack_auth_error` becomes `client.connack.auth.error`).

use std::sync::atomic::AtomicUsize;

use serde::{Deserialize, Serialize};

use crate::macros::Metrics;

#[derive(Serialize, Deserialize, Debug, Default, Metrics)]
pub struct Metrics {
    client_connect: AtomicUsize,
    client_connack: AtomicUsize,
    client_connack_auth_error: AtomicUsize,
    client_connack_version_error: AtomicUsize,
    client_connected: AtomicUsize,
    client_disconnected: AtomicUsize,
    client_handshaking_timeout: AtomicUsize,
    client_keepalive_timeout: AtomicUsize,
    client_subscribe: AtomicUsize,
    client_unsubscribe: AtomicUsize,
    client_subscribe_acl_denied: AtomicUsize,
    client_publish_acl_denied: AtomicUsize,

    session_created: AtomicUsize,
    session_resumed: AtomicUsize,
    session_expired: AtomicUsize,

    messages_publish: AtomicUsize,
    messages_delivered: AtomicUsize,
    messages_delivered_retain: AtomicUsize,
    messages_acked: AtomicUsize,
    messages_dropped: AtomicUsize,
    messages_nonsubscribed: AtomicUsize,
    messages_publish_lastwill: AtomicUsize,
    messages_retried: AtomicUsize,
    messages_retry_exhausted: AtomicUsize,
    messages_queued: AtomicUsize,
    messages_queue_overflow: AtomicUsize,
    messages_forward: AtomicUsize,
    messages_from_cluster: AtomicUsize,

    handler_faults: AtomicUsize,
}
