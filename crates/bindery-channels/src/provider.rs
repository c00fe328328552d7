//! Transport provider interface for the proximity-network channel.

use bindery_types::RequestId;
use serde_json::Value;

use crate::ChannelError;

/// A session-oriented transport implemented outside this crate.
///
/// Events flow back the other way: the provider reports a completed open,
/// a close, or inbound bytes to the service, which queues them for the
/// session worker. Implementations must not call back into the service
/// synchronously from these methods.
pub trait ChannelProvider: Send + Sync {
    /// Starts opening a channel to the peer described by `connect_params`.
    /// Returns the id the provider will use for the channel.
    fn open_channel(&self, request_id: RequestId, connect_params: &Value)
        -> Result<i64, ChannelError>;

    fn close_channel(&self, channel_id: i64);

    fn send(&self, channel_id: i64, data: &[u8]) -> Result<(), ChannelError>;

    /// Signals the transport that the handshake on this channel succeeded.
    fn notify_result(&self, channel_id: i64);
}
