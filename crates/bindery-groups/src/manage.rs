//! Group creation, deletion, and role management.

use bindery_db::{DeviceEntry, GroupEntry, GroupQuery};
use bindery_types::{fields, GroupType, OsAccountId, TrustEvent};
use serde_json::Value;

use crate::params;
use crate::{GroupError, GroupManager};

/// Which role list an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleList {
    Managers,
    Friends,
}

impl RoleList {
    fn entries(self, group: &mut GroupEntry) -> &mut Vec<String> {
        match self {
            Self::Managers => &mut group.managers,
            Self::Friends => &mut group.friends,
        }
    }
}

impl GroupManager {
    /// Derives the id a create request would produce.
    pub fn derive_group_id(
        group_type: GroupType,
        app_id: &str,
        params: &Value,
    ) -> Result<String, GroupError> {
        let id = match group_type {
            GroupType::PeerToPeer => bindery_identity::derive_peer_to_peer_group_id(
                params::required_str(params, fields::GROUP_NAME)?,
                app_id,
            )?,
            GroupType::IdenticalAccount => bindery_identity::derive_account_group_id(
                params::required_str(params, fields::USER_ID)?,
            )?,
            GroupType::AcrossAccount => bindery_identity::derive_across_account_group_id(
                params::required_str(params, fields::USER_ID)?,
                params::required_str(params, fields::SHARED_USER_ID)?,
            )?,
        };
        Ok(id)
    }

    /// Creates a group owned by `app_id`, registering the local device and
    /// its identity key. Returns the new group id.
    pub fn create_group(
        &self,
        os: OsAccountId,
        app_id: &str,
        params: &Value,
    ) -> Result<(String, Vec<TrustEvent>), GroupError> {
        if app_id.is_empty() {
            return Err(GroupError::InvalidParams("missing appId".into()));
        }
        let group_type = params::required_group_type(params, fields::GROUP_TYPE)?;
        let visibility = params::visibility(params, fields::GROUP_VISIBILITY)?;
        let expire_time = params::expire_time(params, fields::EXPIRE_TIME)?;
        let group_id = Self::derive_group_id(group_type, app_id, params)?;

        if self.store.group_exists(os, &group_id)? {
            return Err(GroupError::AlreadyExists(group_id));
        }
        if self.store.group_count(os)? >= self.limits.max_groups_per_account {
            return Err(GroupError::BeyondLimit(format!(
                "account {os} already has {} groups",
                self.limits.max_groups_per_account
            )));
        }

        let group_name = params::optional_str(params, fields::GROUP_NAME)
            .unwrap_or(group_id.as_str())
            .to_string();
        let mut group = GroupEntry::new(os, &group_id, group_name, group_type, app_id);
        group.visibility = visibility;
        group.expire_time = expire_time;
        group.user_id = params::optional_str(params, fields::USER_ID).map(str::to_string);
        group.shared_user_id =
            params::optional_str(params, fields::SHARED_USER_ID).map(str::to_string);

        self.store.add_group(&group)?;
        if let Err(e) = self.add_local_device(&group) {
            self.rollback_group(os, &group_id);
            return Err(e);
        }
        if let Err(e) = self.register_local_key(&group) {
            tracing::error!(group_id = %group_id, error = %e, "local key registration failed, rolling back group");
            self.rollback_group(os, &group_id);
            return Err(e);
        }
        self.store.save(os)?;

        tracing::info!(group_id = %group_id, group_type = group_type.label(), app_id, "group created");
        Ok((
            group_id,
            vec![TrustEvent::GroupCreated {
                group_info: group.to_info().to_string(),
            }],
        ))
    }

    pub(crate) fn add_local_device(&self, group: &GroupEntry) -> Result<(), GroupError> {
        let mut local = DeviceEntry::new(
            group.os_account_id,
            &group.group_id,
            &self.local.udid,
            self.local.user_type,
        );
        local.is_local = true;
        self.store.add_trusted_device(&local)?;
        Ok(())
    }

    fn rollback_group(&self, os: OsAccountId, group_id: &str) {
        if let Err(e) = self.store.delete_group(os, group_id) {
            tracing::error!(group_id, error = %e, "failed to roll back group");
        }
    }

    /// Deletes a group and everything in it. Owner or manager only.
    pub fn delete_group(
        &self,
        os: OsAccountId,
        app_id: &str,
        params: &Value,
    ) -> Result<Vec<TrustEvent>, GroupError> {
        let group_id = params::required_str(params, fields::GROUP_ID)?;
        let group = self.load_group(os, group_id)?;
        if !Self::can_edit(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "delete the group"));
        }

        let peers: Vec<DeviceEntry> = self
            .store
            .query_devices(os, &bindery_db::DeviceQuery::in_group(group_id))?
            .into_iter()
            .filter(|d| !d.is_local)
            .collect();

        self.store.delete_group(os, group_id)?;
        self.store.save(os)?;
        tracing::info!(group_id, app_id, peers = peers.len(), "group deleted");

        self.unregister_local_key(&group);
        let mut events = vec![TrustEvent::GroupDeleted {
            group_info: group.to_info().to_string(),
        }];
        for peer in &peers {
            self.delete_peer_key(&group, &peer.auth_id, peer.user_type);
            events.extend(self.removal_events(os, &group, &peer.udid)?);
        }
        if !peers.is_empty() {
            events.push(TrustEvent::TrustedDeviceNumChanged {
                cur_num: self.trusted_device_count(os)?,
            });
        }
        Ok(events)
    }

    fn edit_roles(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        target: &str,
        list: RoleList,
        add: bool,
    ) -> Result<(), GroupError> {
        if target.is_empty() {
            return Err(GroupError::InvalidParams("empty role app id".into()));
        }
        let mut group = self.load_group(os, group_id)?;
        let allowed = match list {
            RoleList::Managers => group.is_owner(app_id),
            RoleList::Friends => Self::can_edit(&group, app_id),
        };
        if !allowed {
            let action = match list {
                RoleList::Managers => "change group managers",
                RoleList::Friends => "change group friends",
            };
            return Err(GroupError::not_authorized(app_id, action));
        }

        let max_entries = self.limits.max_role_entries;
        let entries = list.entries(&mut group);
        if add {
            if entries.iter().any(|e| e == target) {
                return Ok(());
            }
            if entries.len() >= max_entries {
                return Err(GroupError::BeyondLimit(format!(
                    "group {group_id} role list is full"
                )));
            }
            entries.push(target.to_string());
        } else {
            let before = entries.len();
            entries.retain(|e| e != target);
            if entries.len() == before {
                return Err(GroupError::NotFound(format!("role entry {target}")));
            }
        }

        self.store.update_group(&group)?;
        self.store.save(os)?;
        tracing::info!(group_id, target, ?list, add, "group roles updated");
        Ok(())
    }

    /// Owner only.
    pub fn add_group_manager(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        manager_app_id: &str,
    ) -> Result<(), GroupError> {
        self.edit_roles(os, app_id, group_id, manager_app_id, RoleList::Managers, true)
    }

    /// Owner only.
    pub fn delete_group_manager(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        manager_app_id: &str,
    ) -> Result<(), GroupError> {
        self.edit_roles(os, app_id, group_id, manager_app_id, RoleList::Managers, false)
    }

    /// Owner or manager.
    pub fn add_group_friend(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        friend_app_id: &str,
    ) -> Result<(), GroupError> {
        self.edit_roles(os, app_id, group_id, friend_app_id, RoleList::Friends, true)
    }

    /// Owner or manager.
    pub fn delete_group_friend(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        friend_app_id: &str,
    ) -> Result<(), GroupError> {
        self.edit_roles(os, app_id, group_id, friend_app_id, RoleList::Friends, false)
    }

    pub fn get_group_managers(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Vec<String>, GroupError> {
        let group = self.load_group(os, group_id)?;
        if !Self::can_read(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "read the group"));
        }
        Ok(group.managers)
    }

    pub fn get_group_friends(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Vec<String>, GroupError> {
        let group = self.load_group(os, group_id)?;
        if !Self::can_read(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "read the group"));
        }
        Ok(group.friends)
    }

    /// Groups owned by `app_id`, used by tests and diagnostics.
    pub fn owned_groups(&self, os: OsAccountId, app_id: &str) -> Result<Vec<GroupEntry>, GroupError> {
        Ok(self.store.query_groups(
            os,
            &GroupQuery {
                owner: Some(app_id.to_string()),
                ..GroupQuery::default()
            },
        )?)
    }
}
