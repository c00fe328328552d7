//! Application-facing notification traits.
//!
//! An application registers one [`DeviceAuthCallback`] per app id to follow
//! its own requests, and optionally a [`DataChangeListener`] to observe trust
//! store changes made by anyone.

use crate::{ErrorCode, OperationCode, RequestId};

/// Per-request progress notifications for the application that started it.
///
/// All methods are invoked from the service worker thread. Implementations
/// must not block on the service itself; enqueueing follow-up work (for
/// example forwarding transmitted bytes to a peer's `process_data`) is fine.
pub trait DeviceAuthCallback: Send + Sync {
    /// Whether this callback can carry handshake bytes to the peer.
    ///
    /// When false and no proximity connect parameters are supplied, a request
    /// has no usable channel.
    fn can_transmit(&self) -> bool {
        true
    }

    /// Hands handshake bytes to the application for delivery to the peer.
    /// Returns false if the bytes could not be delivered.
    fn on_transmit(&self, request_id: RequestId, data: &[u8]) -> bool;

    /// Delivers the session key negotiated by a finished handshake.
    fn on_session_key_returned(&self, _request_id: RequestId, _session_key: &[u8]) {}

    /// Reports successful completion. `return_data` is a JSON document.
    fn on_finish(&self, request_id: RequestId, operation_code: OperationCode, return_data: &str);

    /// Reports failure of a request.
    fn on_error(
        &self,
        request_id: RequestId,
        operation_code: OperationCode,
        error_code: ErrorCode,
        error_return: Option<&str>,
    );

    /// Asks the application to confirm an inbound request.
    ///
    /// Returning `Some(document)` answers immediately; returning `None`
    /// leaves the request waiting for a later `confirm_request` call.
    fn on_request(
        &self,
        _request_id: RequestId,
        _operation_code: OperationCode,
        _req_params: &str,
    ) -> Option<String> {
        None
    }
}

/// Observer of trust store changes. Every method has an empty default.
pub trait DataChangeListener: Send + Sync {
    fn on_group_created(&self, _group_info: &str) {}
    fn on_group_deleted(&self, _group_info: &str) {}
    fn on_device_bound(&self, _peer_udid: &str, _group_info: &str) {}
    fn on_device_unbound(&self, _peer_udid: &str, _group_info: &str) {}
    fn on_device_not_trusted(&self, _peer_udid: &str) {}
    fn on_last_group_deleted(&self, _peer_udid: &str, _group_type: i32) {}
    fn on_trusted_device_num_changed(&self, _cur_trusted_device_num: usize) {}
}
