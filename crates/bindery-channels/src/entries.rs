//! Request-to-channel association table.

use std::collections::HashMap;
use std::sync::Mutex;

use bindery_types::RequestId;

/// Maps live requests to their open proximity channel.
///
/// Touched from transport event contexts as well as the worker, so every
/// access takes the lock for a single lookup or update and never calls out.
#[derive(Debug, Default)]
pub struct ChannelEntries {
    inner: Mutex<HashMap<RequestId, i64>>,
}

impl ChannelEntries {
    /// Records or replaces the channel for a request.
    pub fn insert(&self, request_id: RequestId, channel_id: i64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = map.insert(request_id, channel_id) {
            if previous != channel_id {
                tracing::warn!(request_id, previous, channel_id, "channel entry replaced");
            }
        }
    }

    pub fn channel_for(&self, request_id: RequestId) -> Option<i64> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&request_id).copied()
    }

    pub fn request_for(&self, channel_id: i64) -> Option<RequestId> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .find(|(_, ch)| **ch == channel_id)
            .map(|(req, _)| *req)
    }

    /// Removes the entry for a channel, returning the request it served.
    pub fn remove_channel(&self, channel_id: i64) -> Option<RequestId> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let request_id = map
            .iter()
            .find(|(_, ch)| **ch == channel_id)
            .map(|(req, _)| *req)?;
        map.remove(&request_id);
        Some(request_id)
    }

    pub fn remove_request(&self, request_id: RequestId) -> Option<i64> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
