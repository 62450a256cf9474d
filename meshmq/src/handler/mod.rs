//! The standard handler set installed by [`crate::dispatch::Dispatcher::new`].

use crate::channel::Channel;
use crate::error::MqttError;

pub mod connect;
pub mod delivery;
pub mod publish;
pub mod subscribe;

/// Packets from a client are only served while its channel is online.
#[inline]
pub(crate) fn online(channel: Option<&Channel>) -> Result<&Channel, MqttError> {
    match channel {
        Some(c) if c.is_online() => Ok(c),
        _ => Err(MqttError::NotConnected),
    }
}

/// Channel-bound message that arrived without its channel.
#[inline]
pub(crate) fn bound(channel: Option<&Channel>) -> Result<&Channel, MqttError> {
    channel.ok_or(MqttError::NotConnected)
}

#[inline]
pub(crate) fn unexpected(name: &str) -> MqttError {
    MqttError::HandlerFault(format!("unexpected message, {}", name))
}
