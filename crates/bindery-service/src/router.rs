//! Per-application callback and listener registration.
//!
//! Both tables are read on the worker and written from API threads. Lookups
//! clone the `Arc` out so no lock is held while application code runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bindery_types::{DataChangeListener, DeviceAuthCallback};

use crate::ServiceError;

fn check_app_id(app_id: &str) -> Result<(), ServiceError> {
    if app_id.trim().is_empty() {
        return Err(ServiceError::InvalidParams("appId must not be empty".into()));
    }
    Ok(())
}

/// Callbacks keyed by the app id that registered them.
#[derive(Default)]
pub struct CallbackRouter {
    callbacks: RwLock<HashMap<String, Arc<dyn DeviceAuthCallback>>>,
}

impl CallbackRouter {
    /// Registers or replaces the callback for `app_id`.
    pub fn register(
        &self,
        app_id: &str,
        callback: Arc<dyn DeviceAuthCallback>,
    ) -> Result<(), ServiceError> {
        check_app_id(app_id)?;
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(app_id.to_string(), callback);
        tracing::debug!(app_id, "callback registered");
        Ok(())
    }

    pub fn unregister(&self, app_id: &str) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(app_id);
    }

    pub fn get(&self, app_id: &str) -> Option<Arc<dyn DeviceAuthCallback>> {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(app_id)
            .cloned()
    }
}

/// Fans trust store changes out to every registered listener.
#[derive(Default)]
pub struct ListenerRouter {
    listeners: RwLock<HashMap<String, Arc<dyn DataChangeListener>>>,
}

impl ListenerRouter {
    pub fn register(
        &self,
        app_id: &str,
        listener: Arc<dyn DataChangeListener>,
    ) -> Result<(), ServiceError> {
        check_app_id(app_id)?;
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(app_id.to_string(), listener);
        tracing::debug!(app_id, "data change listener registered");
        Ok(())
    }

    pub fn unregister(&self, app_id: &str) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(app_id);
    }

    fn snapshot(&self) -> Vec<Arc<dyn DataChangeListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl DataChangeListener for ListenerRouter {
    fn on_group_created(&self, group_info: &str) {
        for l in self.snapshot() {
            l.on_group_created(group_info);
        }
    }

    fn on_group_deleted(&self, group_info: &str) {
        for l in self.snapshot() {
            l.on_group_deleted(group_info);
        }
    }

    fn on_device_bound(&self, peer_udid: &str, group_info: &str) {
        for l in self.snapshot() {
            l.on_device_bound(peer_udid, group_info);
        }
    }

    fn on_device_unbound(&self, peer_udid: &str, group_info: &str) {
        for l in self.snapshot() {
            l.on_device_unbound(peer_udid, group_info);
        }
    }

    fn on_device_not_trusted(&self, peer_udid: &str) {
        for l in self.snapshot() {
            l.on_device_not_trusted(peer_udid);
        }
    }

    fn on_last_group_deleted(&self, peer_udid: &str, group_type: i32) {
        for l in self.snapshot() {
            l.on_last_group_deleted(peer_udid, group_type);
        }
    }

    fn on_trusted_device_num_changed(&self, cur_trusted_device_num: usize) {
        for l in self.snapshot() {
            l.on_trusted_device_num_changed(cur_trusted_device_num);
        }
    }
}
