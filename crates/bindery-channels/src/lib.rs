//! Channel abstraction for bindery handshakes.
//!
//! A handshake exchanges bytes with its peer over one of two transports:
//!
//! - `DirectCallback`: the requesting application carries the bytes itself.
//!   Sending hands them to [`DeviceAuthCallback::on_transmit`]; there is no
//!   real channel id, so [`DEFAULT_CHANNEL_ID`] stands in for one and the
//!   channel counts as open immediately.
//! - `ProximityNetwork`: a session-oriented transport owned by an external
//!   [`ChannelProvider`]. Opening is asynchronous; the provider reports the
//!   open, close, and inbound data events, which the service turns into
//!   worker tasks. The request-to-channel association lives in a
//!   [`ChannelEntries`] table behind its own lock because those events arrive
//!   outside the worker.
//!
//! Which kind a request uses is decided once, when its session is created,
//! by [`ChannelManager::resolve_channel_kind`].

mod entries;
mod provider;

use std::sync::Arc;

use bindery_types::{fields, DeviceAuthCallback, ErrorCode, RequestId, DEFAULT_CHANNEL_ID};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use entries::ChannelEntries;
pub use provider::ChannelProvider;

/// Errors that can occur during channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request has no usable channel")]
    NoChannel,
    #[error("channel kind {0} is not compiled in")]
    NotSupported(&'static str),
    #[error("no proximity channel provider is installed")]
    NoProvider,
    #[error("missing transmit callback")]
    NoCallback,
    #[error("failed to open channel: {0}")]
    OpenFailed(String),
    #[error("failed to send on channel {channel_id}: {reason}")]
    SendFailed { channel_id: i64, reason: String },
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::NoCallback => ErrorCode::InvalidInput,
            _ => ErrorCode::TransportFailure,
        }
    }
}

/// Transport used by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// No usable transport.
    None,
    DirectCallback,
    ProximityNetwork,
}

impl ChannelKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::DirectCallback => "DIRECT_CALLBACK",
            Self::ProximityNetwork => "PROXIMITY_NETWORK",
        }
    }

    /// Whether the channel is usable as soon as `open` returns.
    pub fn opens_immediately(self) -> bool {
        matches!(self, Self::DirectCallback)
    }
}

/// Whether the proximity-network kind was compiled in.
pub const fn proximity_enabled() -> bool {
    cfg!(feature = "proximity")
}

/// Returns the request's connect parameters, if it carries any.
pub fn connect_params(params: &Value) -> Option<&Value> {
    params
        .get(fields::CONNECT_PARAMS)
        .filter(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.is_empty()))
}

/// Selects, opens, and operates transports on behalf of sessions.
pub struct ChannelManager {
    provider: Option<Arc<dyn ChannelProvider>>,
    entries: ChannelEntries,
}

impl ChannelManager {
    /// Creates a manager. `provider` backs the proximity-network kind.
    pub fn new(provider: Option<Arc<dyn ChannelProvider>>) -> Self {
        Self {
            provider,
            entries: ChannelEntries::default(),
        }
    }

    /// Creates a manager that can only use the direct-callback kind.
    pub fn direct_only() -> Self {
        Self::new(None)
    }

    pub fn entries(&self) -> &ChannelEntries {
        &self.entries
    }

    /// Picks the transport for a request.
    ///
    /// Connect parameters select the proximity network when it is compiled
    /// in; otherwise a callback able to transmit selects the direct channel.
    pub fn resolve_channel_kind(
        &self,
        callback: Option<&dyn DeviceAuthCallback>,
        params: &Value,
    ) -> ChannelKind {
        if proximity_enabled() && connect_params(params).is_some() {
            return ChannelKind::ProximityNetwork;
        }
        match callback {
            Some(cb) if cb.can_transmit() => ChannelKind::DirectCallback,
            _ => ChannelKind::None,
        }
    }

    /// Opens a channel and returns its id.
    ///
    /// For the proximity network the returned id is provisional until the
    /// provider reports the open through [`ChannelManager::on_opened`].
    pub fn open(
        &self,
        kind: ChannelKind,
        params: &Value,
        request_id: RequestId,
    ) -> Result<i64, ChannelError> {
        match kind {
            ChannelKind::None => Err(ChannelError::NoChannel),
            ChannelKind::DirectCallback => Ok(DEFAULT_CHANNEL_ID),
            ChannelKind::ProximityNetwork => {
                if !proximity_enabled() {
                    return Err(ChannelError::NotSupported(kind.label()));
                }
                let provider = self.provider.as_ref().ok_or(ChannelError::NoProvider)?;
                let connect = connect_params(params).ok_or(ChannelError::NoChannel)?;
                let channel_id = provider.open_channel(request_id, connect)?;
                tracing::debug!(request_id, channel_id, "proximity channel opening");
                Ok(channel_id)
            }
        }
    }

    /// Sends bytes to the peer of `request_id`.
    pub fn send(
        &self,
        kind: ChannelKind,
        request_id: RequestId,
        channel_id: i64,
        callback: Option<&dyn DeviceAuthCallback>,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        match kind {
            ChannelKind::None => Err(ChannelError::NoChannel),
            ChannelKind::DirectCallback => {
                let callback = callback.ok_or(ChannelError::NoCallback)?;
                if callback.on_transmit(request_id, data) {
                    Ok(())
                } else {
                    Err(ChannelError::SendFailed {
                        channel_id,
                        reason: "transmit callback refused the data".to_string(),
                    })
                }
            }
            ChannelKind::ProximityNetwork => {
                let provider = self.provider.as_ref().ok_or(ChannelError::NoProvider)?;
                provider.send(channel_id, data)
            }
        }
    }

    /// Closes a channel. Closing the direct channel is a no-op.
    pub fn close(&self, kind: ChannelKind, channel_id: i64) {
        if kind != ChannelKind::ProximityNetwork {
            return;
        }
        self.entries.remove_channel(channel_id);
        if let Some(provider) = &self.provider {
            provider.close_channel(channel_id);
        }
    }

    /// Tells the transport the handshake on `channel_id` succeeded.
    pub fn notify_peer_result(&self, kind: ChannelKind, channel_id: i64) {
        if kind != ChannelKind::ProximityNetwork {
            return;
        }
        if let Some(provider) = &self.provider {
            provider.notify_result(channel_id);
        }
    }

    /// Records that the proximity channel for `request_id` is now open.
    pub fn on_opened(&self, request_id: RequestId, channel_id: i64) {
        self.entries.insert(request_id, channel_id);
    }

    /// Forgets a closed proximity channel, returning the request it served.
    pub fn on_closed(&self, channel_id: i64) -> Option<RequestId> {
        self.entries.remove_channel(channel_id)
    }

    /// Looks up the request a proximity channel serves.
    pub fn request_for_channel(&self, channel_id: i64) -> Option<RequestId> {
        self.entries.request_for(channel_id)
    }

    /// Whether `channel_id` is the open proximity channel of `request_id`.
    pub fn serves(&self, request_id: RequestId, channel_id: i64) -> bool {
        self.entries.channel_for(request_id) == Some(channel_id)
    }
}
