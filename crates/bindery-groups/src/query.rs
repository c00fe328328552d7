//! Read-only, access-checked queries.

use bindery_db::{DeviceQuery, GroupQuery};
use bindery_types::{GroupType, OsAccountId};
use serde_json::Value;

use crate::{GroupError, GroupManager};

impl GroupManager {
    /// Whether `app_id` may read the group. Fails if the group is absent.
    pub fn check_access_to_group(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<bool, GroupError> {
        let group = self.load_group(os, group_id)?;
        Ok(Self::can_read(&group, app_id))
    }

    pub fn get_group_info_by_id(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Value, GroupError> {
        let group = self.load_group(os, group_id)?;
        if !Self::can_read(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "read the group"));
        }
        Ok(group.to_info())
    }

    /// Groups matching `query` that `app_id` may read.
    pub fn get_group_info(
        &self,
        os: OsAccountId,
        app_id: &str,
        query: &GroupQuery,
    ) -> Result<Vec<Value>, GroupError> {
        Ok(self
            .store
            .query_groups(os, query)?
            .iter()
            .filter(|g| Self::can_read(g, app_id))
            .map(|g| g.to_info())
            .collect())
    }

    pub fn get_joined_groups(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_type: GroupType,
    ) -> Result<Vec<Value>, GroupError> {
        self.get_group_info(os, app_id, &GroupQuery::by_type(group_type))
    }

    /// Readable groups in which `peer_udid` is trusted.
    pub fn get_related_groups(
        &self,
        os: OsAccountId,
        app_id: &str,
        peer_udid: &str,
    ) -> Result<Vec<Value>, GroupError> {
        let mut related = Vec::new();
        for device in self.store.query_devices(os, &DeviceQuery::by_udid(peer_udid))? {
            if let Some(group) = self.store.get_group(os, &device.group_id)? {
                if Self::can_read(&group, app_id) {
                    related.push(group.to_info());
                }
            }
        }
        Ok(related)
    }

    pub fn get_device_info_by_id(
        &self,
        os: OsAccountId,
        app_id: &str,
        peer_udid: &str,
        group_id: &str,
    ) -> Result<Value, GroupError> {
        let group = self.load_group(os, group_id)?;
        if !Self::can_read(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "read the group"));
        }
        self.store
            .get_device(os, group_id, peer_udid)?
            .map(|d| d.to_info())
            .ok_or_else(|| GroupError::NotFound(format!("device {peer_udid} in group {group_id}")))
    }

    pub fn get_trusted_devices(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Vec<Value>, GroupError> {
        let group = self.load_group(os, group_id)?;
        if !Self::can_read(&group, app_id) {
            return Err(GroupError::not_authorized(app_id, "read the group"));
        }
        Ok(self
            .store
            .query_devices(os, &DeviceQuery::in_group(group_id))?
            .iter()
            .map(|d| d.to_info())
            .collect())
    }

    /// False when the group is absent or unreadable by `app_id`.
    pub fn is_device_in_group(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        udid: &str,
    ) -> Result<bool, GroupError> {
        let Some(group) = self.store.get_group(os, group_id)? else {
            return Ok(false);
        };
        if !Self::can_read(&group, app_id) {
            return Ok(false);
        }
        Ok(self.store.get_device(os, group_id, udid)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use bindery_db::{DeviceEntry, GroupQuery};
    use bindery_types::{DeviceType, ErrorCode, GroupType};
    use serde_json::json;

    #[test]
    fn private_groups_hide_from_strangers() {
        let mgr = manager();
        let (private_id, _) = mgr
            .create_group(
                OS,
                "owner",
                &json!({ "groupName": "secret", "groupType": 256, "groupVisibility": 0 }),
            )
            .expect("private group");
        let (public_id, _) = mgr
            .create_group(OS, "owner", &json!({ "groupName": "open", "groupType": 256 }))
            .expect("public group");

        assert!(!mgr.check_access_to_group(OS, "stranger", &private_id).unwrap());
        assert!(mgr.check_access_to_group(OS, "stranger", &public_id).unwrap());
        assert_eq!(
            mgr.get_group_info_by_id(OS, "stranger", &private_id)
                .expect_err("hidden")
                .code(),
            ErrorCode::NotAuthorized
        );

        let visible = mgr
            .get_joined_groups(OS, "stranger", GroupType::PeerToPeer)
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0]["groupId"], public_id.as_str());

        mgr.add_group_friend(OS, "owner", &private_id, "stranger")
            .expect("befriend");
        assert_eq!(
            mgr.get_group_info(OS, "stranger", &GroupQuery::default())
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn device_queries() {
        let mgr = manager();
        let (id, _) = mgr
            .create_group(OS, "owner", &json!({ "groupName": "home", "groupType": 256 }))
            .expect("group");
        mgr.store()
            .add_trusted_device(&DeviceEntry::new(OS, &id, "PEER", DeviceType::Accessory))
            .unwrap();

        assert_eq!(mgr.get_trusted_devices(OS, "owner", &id).unwrap().len(), 2);
        assert!(mgr.is_device_in_group(OS, "owner", &id, "PEER").unwrap());
        assert!(!mgr.is_device_in_group(OS, "owner", "NOPE", "PEER").unwrap());
        assert_eq!(
            mgr.get_device_info_by_id(OS, "owner", "PEER", &id).unwrap()["authId"],
            "PEER"
        );
        assert_eq!(
            mgr.get_device_info_by_id(OS, "owner", "GHOST", &id)
                .expect_err("absent")
                .code(),
            ErrorCode::NotFound
        );
        assert_eq!(mgr.get_related_groups(OS, "owner", "PEER").unwrap().len(), 1);
        assert_eq!(mgr.trusted_device_count(OS).unwrap(), 1);
    }
}
