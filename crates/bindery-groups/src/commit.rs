//! Pre-handshake checks and post-handshake commits for bind, unbind, and
//! authentication.

use bindery_db::{DeviceEntry, DeviceQuery, GroupEntry};
use bindery_types::{fields, GroupType, OsAccountId, TrustEvent};
use serde_json::Value;

use crate::params;
use crate::{GroupError, GroupManager};

/// A validated client join request.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPlan {
    pub group_id: String,
    pub group_type: GroupType,
    /// Whether the group already exists on this device.
    pub group_exists: bool,
}

/// A validated unbind request.
#[derive(Debug, Clone, PartialEq)]
pub struct UnbindPlan {
    pub group: GroupEntry,
    pub peer: DeviceEntry,
    pub is_force: bool,
    pub ignore_channel: bool,
}

/// What a finished bind handshake adds to the trust store.
#[derive(Debug, Clone, PartialEq)]
pub struct BindCommit {
    /// The group as known after the handshake; created if absent locally.
    pub group: GroupEntry,
    pub peer: DeviceEntry,
}

impl GroupManager {
    fn ensure_room_for_peer(
        &self,
        group: &GroupEntry,
        peer_udid: Option<&str>,
    ) -> Result<(), GroupError> {
        if let Some(udid) = peer_udid {
            if self
                .store
                .get_device(group.os_account_id, &group.group_id, udid)?
                .is_some()
            {
                // Rebinding replaces a record and adds nothing.
                return Ok(());
            }
        }
        let count = self
            .store
            .device_count(group.os_account_id, &group.group_id)?;
        if count >= self.limits.max_devices_per_group {
            return Err(GroupError::BeyondLimit(format!(
                "group {} already has {count} devices",
                group.group_id
            )));
        }
        Ok(())
    }

    /// Validates a join on the requesting side.
    pub fn prepare_join(&self, os: OsAccountId, params: &Value) -> Result<JoinPlan, GroupError> {
        let group_id = params::required_str(params, fields::GROUP_ID)?.to_string();
        let group_type = params::required_group_type(params, fields::GROUP_TYPE)?;
        params::required_str(params, fields::PIN_CODE)?;

        match self.store.get_group(os, &group_id)? {
            Some(group) => {
                if group.group_type != group_type {
                    return Err(GroupError::InvalidParams(format!(
                        "group {group_id} is not of type {}",
                        group_type.label()
                    )));
                }
                self.ensure_room_for_peer(&group, None)?;
                Ok(JoinPlan {
                    group_id,
                    group_type,
                    group_exists: true,
                })
            }
            None => {
                if self.store.group_count(os)? >= self.limits.max_groups_per_account {
                    return Err(GroupError::BeyondLimit(format!(
                        "account {os} cannot join more groups"
                    )));
                }
                Ok(JoinPlan {
                    group_id,
                    group_type,
                    group_exists: false,
                })
            }
        }
    }

    /// Validates a join on the side that owns the group.
    pub fn prepare_server_join(
        &self,
        os: OsAccountId,
        group_id: &str,
        peer_udid: &str,
    ) -> Result<GroupEntry, GroupError> {
        let group = self.load_group(os, group_id)?;
        self.ensure_room_for_peer(&group, Some(peer_udid))?;
        Ok(group)
    }

    /// Validates an unbind on the requesting side. The caller must be able
    /// to edit the group and the peer must be a member.
    pub fn prepare_unbind(
        &self,
        os: OsAccountId,
        app_id: &str,
        params: &Value,
    ) -> Result<UnbindPlan, GroupError> {
        let group_id = params::required_str(params, fields::GROUP_ID)?;
        let peer_udid = params::required_str(params, fields::DELETE_ID)?;
        let group = self.load_group(os, group_id)?;
        if !Self::can_edit(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "delete group members"));
        }
        if peer_udid == self.local.udid {
            return Err(GroupError::InvalidParams(
                "cannot unbind the local device".into(),
            ));
        }
        let peer = self
            .store
            .get_device(os, group_id, peer_udid)?
            .ok_or_else(|| GroupError::NotFound(format!("device {peer_udid} in group {group_id}")))?;

        Ok(UnbindPlan {
            group,
            peer,
            is_force: params::optional_bool(params, fields::IS_FORCE_DELETE),
            ignore_channel: params::optional_bool(params, fields::IS_IGNORE_CHANNEL),
        })
    }

    /// Looks up a peer that must already be trusted in `group_id`.
    pub fn find_trusted_peer(
        &self,
        os: OsAccountId,
        group_id: &str,
        peer_udid: &str,
    ) -> Result<(GroupEntry, DeviceEntry), GroupError> {
        let group = self.load_group(os, group_id)?;
        let peer = self
            .store
            .get_device(os, group_id, peer_udid)?
            .filter(|d| !d.is_local)
            .ok_or_else(|| GroupError::NotFound(format!("device {peer_udid} in group {group_id}")))?;
        Ok((group, peer))
    }

    /// Picks the group to authenticate `peer_udid` in: the named one, or the
    /// first group readable by `app_id` that trusts the peer.
    pub fn prepare_auth(
        &self,
        os: OsAccountId,
        app_id: &str,
        peer_udid: &str,
        group_id: Option<&str>,
    ) -> Result<(GroupEntry, DeviceEntry), GroupError> {
        if let Some(group_id) = group_id {
            let (group, peer) = self.find_trusted_peer(os, group_id, peer_udid)?;
            if !Self::can_read(&group, app_id) {
                return Err(GroupError::not_authorized(app_id, "authenticate in the group"));
            }
            return Ok((group, peer));
        }

        for device in self.store.query_devices(os, &DeviceQuery::by_udid(peer_udid))? {
            if device.is_local {
                continue;
            }
            if let Some(group) = self.store.get_group(os, &device.group_id)? {
                if Self::can_read(&group, app_id) {
                    return Ok((group, device));
                }
            }
        }
        Err(GroupError::NotFound(format!(
            "no readable group trusts device {peer_udid}"
        )))
    }

    /// Records a finished bind: creates the group and local record if this
    /// device did not have them, then upserts the peer and saves.
    ///
    /// A failure to register the local identity key after the records are
    /// written is logged and does not fail the commit.
    pub fn commit_bind(&self, commit: &BindCommit) -> Result<Vec<TrustEvent>, GroupError> {
        let os = commit.group.os_account_id;
        let mut events = Vec::new();

        let group = match self.store.get_group(os, &commit.group.group_id)? {
            Some(existing) => existing,
            None => {
                self.store.add_group(&commit.group)?;
                self.add_local_device(&commit.group)?;
                if let Err(e) = self.register_local_key(&commit.group) {
                    tracing::warn!(group_id = %commit.group.group_id, error = %e, "bound without local key registration");
                }
                events.push(TrustEvent::GroupCreated {
                    group_info: commit.group.to_info().to_string(),
                });
                commit.group.clone()
            }
        };

        self.ensure_room_for_peer(&group, Some(&commit.peer.udid))?;
        self.store.add_trusted_device(&commit.peer)?;
        self.store.save(os)?;
        tracing::info!(group_id = %group.group_id, peer = %commit.peer.udid, "peer bound");

        events.push(TrustEvent::DeviceBound {
            peer_udid: commit.peer.udid.clone(),
            group_info: group.to_info().to_string(),
        });
        events.push(TrustEvent::TrustedDeviceNumChanged {
            cur_num: self.trusted_device_count(os)?,
        });
        Ok(events)
    }

    /// Records a finished unbind: removes the peer record and saves, then
    /// deletes the peer's key material. Key deletion failures are logged only.
    pub fn commit_unbind(
        &self,
        group: &GroupEntry,
        peer: &DeviceEntry,
    ) -> Result<Vec<TrustEvent>, GroupError> {
        let os = group.os_account_id;
        self.store
            .delete_trusted_device(os, &group.group_id, &peer.udid)?;
        self.store.save(os)?;
        tracing::info!(group_id = %group.group_id, peer = %peer.udid, "peer unbound");

        self.delete_peer_key(group, &peer.auth_id, peer.user_type);
        let mut events = self.removal_events(os, group, &peer.udid)?;
        events.push(TrustEvent::TrustedDeviceNumChanged {
            cur_num: self.trusted_device_count(os)?,
        });
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use bindery_types::{DeviceType, ErrorCode, Limits};
    use serde_json::json;

    fn peer(group_id: &str, udid: &str) -> DeviceEntry {
        DeviceEntry::new(OS, group_id, udid, DeviceType::Accessory)
    }

    fn created(mgr: &GroupManager) -> GroupEntry {
        let (id, _) = mgr
            .create_group(OS, "owner", &json!({ "groupName": "home", "groupType": 256 }))
            .expect("group");
        mgr.store().get_group(OS, &id).unwrap().expect("stored")
    }

    #[test]
    fn commit_bind_creates_missing_group_first() {
        let mgr = manager();
        let group = GroupEntry::new(OS, "REMOTE", "remote", GroupType::PeerToPeer, "owner");
        let events = mgr
            .commit_bind(&BindCommit {
                group: group.clone(),
                peer: peer("REMOTE", "PEER"),
            })
            .expect("commit");

        assert!(matches!(events[0], TrustEvent::GroupCreated { .. }));
        assert!(matches!(events[1], TrustEvent::DeviceBound { .. }));
        assert_eq!(events[2], TrustEvent::TrustedDeviceNumChanged { cur_num: 1 });
        assert!(mgr.store().get_device(OS, "REMOTE", LOCAL_UDID).unwrap().is_some());
        assert!(mgr.store().get_device(OS, "REMOTE", "PEER").unwrap().is_some());
    }

    #[test]
    fn rebind_replaces_record_even_when_full() {
        let mgr = manager_with_limits(Limits {
            max_devices_per_group: 2,
            ..Limits::default()
        });
        let group = created(&mgr);
        let commit = BindCommit {
            group: group.clone(),
            peer: peer(&group.group_id, "PEER"),
        };
        mgr.commit_bind(&commit).expect("first bind");
        mgr.commit_bind(&commit).expect("rebind fits");

        let err = mgr
            .commit_bind(&BindCommit {
                group: group.clone(),
                peer: peer(&group.group_id, "OTHER"),
            })
            .expect_err("group full");
        assert_eq!(err.code(), ErrorCode::BeyondLimit);
    }

    #[test]
    fn unbind_of_absent_peer_is_not_found_and_changes_nothing() {
        let mgr = manager();
        let group = created(&mgr);
        let params = json!({ "groupId": group.group_id, "deleteId": "GHOST" });
        let before = mgr.store().device_count(OS, &group.group_id).unwrap();

        let err = mgr
            .prepare_unbind(OS, "owner", &params)
            .expect_err("absent peer");
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(mgr.store().device_count(OS, &group.group_id).unwrap(), before);
    }

    #[test]
    fn unbind_requires_editor_and_remote_peer() {
        let mgr = manager();
        let group = created(&mgr);
        let params = json!({ "groupId": group.group_id, "deleteId": LOCAL_UDID });
        assert_eq!(
            mgr.prepare_unbind(OS, "owner", &params).unwrap_err().code(),
            ErrorCode::InvalidInput
        );
        let params = json!({ "groupId": group.group_id, "deleteId": "PEER" });
        assert_eq!(
            mgr.prepare_unbind(OS, "stranger", &params).unwrap_err().code(),
            ErrorCode::NotAuthorized
        );
    }

    #[test]
    fn commit_unbind_reports_last_group() {
        let mgr = manager();
        let group = created(&mgr);
        let record = peer(&group.group_id, "PEER");
        mgr.commit_bind(&BindCommit {
            group: group.clone(),
            peer: record.clone(),
        })
        .expect("bind");

        let plan = mgr
            .prepare_unbind(
                OS,
                "owner",
                &json!({ "groupId": group.group_id, "deleteId": "PEER", "isForceDelete": true }),
            )
            .expect("plan");
        assert!(plan.is_force);
        assert!(!plan.ignore_channel);

        let events = mgr.commit_unbind(&plan.group, &plan.peer).expect("unbind");
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "device_unbound",
                "device_not_trusted",
                "last_group_deleted",
                "trusted_device_num_changed"
            ]
        );
    }

    #[test]
    fn join_checks() {
        let mgr = manager();
        let err = mgr
            .prepare_join(OS, &json!({ "groupId": "G", "groupType": 256 }))
            .expect_err("pin required");
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let plan = mgr
            .prepare_join(OS, &json!({ "groupId": "G", "groupType": 256, "pinCode": "1" }))
            .expect("fresh join");
        assert!(!plan.group_exists);

        let group = created(&mgr);
        let plan = mgr
            .prepare_join(
                OS,
                &json!({ "groupId": group.group_id, "groupType": 256, "pinCode": "1" }),
            )
            .expect("known group");
        assert!(plan.group_exists);
    }

    #[test]
    fn auth_needs_trusted_peer() {
        let mgr = manager();
        let group = created(&mgr);
        assert_eq!(
            mgr.prepare_auth(OS, "owner", "PEER", None).unwrap_err().code(),
            ErrorCode::NotFound
        );
        mgr.commit_bind(&BindCommit {
            group: group.clone(),
            peer: peer(&group.group_id, "PEER"),
        })
        .expect("bind");
        let (found, device) = mgr.prepare_auth(OS, "owner", "PEER", None).expect("auth");
        assert_eq!(found.group_id, group.group_id);
        assert_eq!(device.udid, "PEER");
        assert!(mgr
            .prepare_auth(OS, "owner", "PEER", Some(&group.group_id))
            .is_ok());
    }
}
