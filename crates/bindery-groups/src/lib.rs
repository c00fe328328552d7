//! Group operation layer for bindery.
//!
//! Turns validated intents into trust store mutations. Every public
//! operation checks its inputs and the caller's role before touching the
//! store, so a rejected call leaves no partial state behind.
//!
//! Roles, by app id:
//!
//! - owner: the app that created the group; may do anything
//! - manager: may edit members and friends, and delete the group
//! - friend: may read the group
//!
//! Public groups are readable by any app.
//!
//! Successful mutations return the [`TrustEvent`]s they caused. The caller
//! (the service) fans them out to data-change listeners once the operation
//! is complete.

mod commit;
mod manage;
pub mod params;
mod query;

use std::sync::Arc;

use bindery_db::{GroupEntry, StoreError, TrustStore};
use bindery_identity::IdentityError;
use bindery_modules::{IdentityParams, ModuleDispatcher, ModuleError, ModuleType};
use bindery_types::{
    DeviceType, ErrorCode, GroupType, Limits, LocalDevice, OsAccountId, TrustEvent,
};
use thiserror::Error;

pub use commit::{BindCommit, JoinPlan, UnbindPlan};

/// Errors produced by group operations.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("identifier derivation failed: {0}")]
    Identity(#[from] IdentityError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("app {app_id} may not {action}")]
    NotAuthorized { app_id: String, action: &'static str },
    #[error("group type {0} is not supported in this build")]
    NotSupported(&'static str),
    #[error("limit exceeded: {0}")]
    BeyondLimit(String),
    #[error("group {0} already exists")]
    AlreadyExists(String),
    #[error("trust store error: {0}")]
    Store(#[from] StoreError),
    #[error("module error: {0}")]
    Module(#[from] ModuleError),
}

impl GroupError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParams(_) | Self::Identity(_) => ErrorCode::InvalidInput,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::NotAuthorized { .. } => ErrorCode::NotAuthorized,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::BeyondLimit(_) => ErrorCode::BeyondLimit,
            Self::AlreadyExists(_) => ErrorCode::DuplicateRequest,
            Self::Store(e) => e.code(),
            Self::Module(e) => e.code(),
        }
    }

    fn not_authorized(app_id: &str, action: &'static str) -> Self {
        Self::NotAuthorized {
            app_id: app_id.to_string(),
            action,
        }
    }
}

/// Which authenticator module backs a group type.
pub fn module_type_for(group_type: GroupType) -> ModuleType {
    if group_type.is_account_based() {
        ModuleType::Credential
    } else {
        ModuleType::Identity
    }
}

/// Group operations over a trust store.
pub struct GroupManager {
    store: Arc<dyn TrustStore>,
    modules: Arc<ModuleDispatcher>,
    local: LocalDevice,
    limits: Limits,
}

impl GroupManager {
    pub fn new(
        store: Arc<dyn TrustStore>,
        modules: Arc<ModuleDispatcher>,
        local: LocalDevice,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            modules,
            local,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<dyn TrustStore> {
        &self.store
    }

    pub fn local_device(&self) -> &LocalDevice {
        &self.local
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn load_group(&self, os: OsAccountId, group_id: &str) -> Result<GroupEntry, GroupError> {
        self.store
            .get_group(os, group_id)?
            .ok_or_else(|| GroupError::NotFound(format!("group {group_id}")))
    }

    /// Owner, manager, friend, or anyone for a public group.
    fn can_read(group: &GroupEntry, app_id: &str) -> bool {
        group.visibility == bindery_types::GroupVisibility::Public
            || group.is_owner(app_id)
            || group.is_manager(app_id)
            || group.is_friend(app_id)
    }

    fn can_edit(group: &GroupEntry, app_id: &str) -> bool {
        group.is_owner(app_id) || group.is_manager(app_id)
    }

    fn local_identity(&self, group: &GroupEntry) -> IdentityParams {
        IdentityParams::for_group(&group.group_id, &self.local.udid, self.local.user_type)
    }

    fn peer_identity(group: &GroupEntry, auth_id: &str, user_type: DeviceType) -> IdentityParams {
        IdentityParams::for_group(&group.group_id, auth_id, user_type)
    }

    /// Registers the local identity key for a group.
    pub fn register_local_key(&self, group: &GroupEntry) -> Result<(), GroupError> {
        self.modules
            .register_local_identity(&self.local_identity(group), module_type_for(group.group_type))?;
        Ok(())
    }

    /// Removes the local identity key for a group, logging any failure.
    pub fn unregister_local_key(&self, group: &GroupEntry) {
        if let Err(e) = self
            .modules
            .unregister_local_identity(&self.local_identity(group), module_type_for(group.group_type))
        {
            tracing::warn!(group_id = %group.group_id, error = %e, "failed to unregister local identity key");
        }
    }

    fn delete_peer_key(&self, group: &GroupEntry, auth_id: &str, user_type: DeviceType) {
        let params = Self::peer_identity(group, auth_id, user_type);
        if let Err(e) = self
            .modules
            .delete_peer_identity(&params, module_type_for(group.group_type))
        {
            tracing::warn!(group_id = %group.group_id, error = %e, "failed to delete peer identity key");
        }
    }

    /// Number of distinct remote devices trusted by any group of the account.
    pub fn trusted_device_count(&self, os: OsAccountId) -> Result<usize, GroupError> {
        let mut udids: Vec<String> = self
            .store
            .query_devices(os, &Default::default())?
            .into_iter()
            .filter(|d| !d.is_local)
            .map(|d| d.udid)
            .collect();
        udids.sort();
        udids.dedup();
        Ok(udids.len())
    }

    /// Events describing a peer leaving `group`.
    fn removal_events(
        &self,
        os: OsAccountId,
        group: &GroupEntry,
        peer_udid: &str,
    ) -> Result<Vec<TrustEvent>, GroupError> {
        let info = group.to_info().to_string();
        let mut events = vec![TrustEvent::DeviceUnbound {
            peer_udid: peer_udid.to_string(),
            group_info: info,
        }];

        let remaining = self
            .store
            .query_devices(os, &bindery_db::DeviceQuery::by_udid(peer_udid))?;
        if remaining.is_empty() {
            events.push(TrustEvent::DeviceNotTrusted {
                peer_udid: peer_udid.to_string(),
            });
        }
        let mut same_type = false;
        for device in &remaining {
            if let Some(g) = self.store.get_group(os, &device.group_id)? {
                if g.group_type == group.group_type {
                    same_type = true;
                    break;
                }
            }
        }
        if !same_type {
            events.push(TrustEvent::LastGroupDeleted {
                peer_udid: peer_udid.to_string(),
                group_type: group.group_type.as_i32(),
            });
        }
        Ok(events)
    }
}
