//! In-memory trust store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use bindery_types::OsAccountId;

use crate::store::{DeviceEntry, DeviceQuery, GroupEntry, GroupQuery, StoreError, TrustStore};

type GroupKey = (OsAccountId, String);
type DeviceKey = (OsAccountId, String, String);

#[derive(Default)]
struct Tables {
    groups: BTreeMap<GroupKey, GroupEntry>,
    devices: BTreeMap<DeviceKey, DeviceEntry>,
    saves: HashMap<OsAccountId, u64>,
}

/// A [`TrustStore`] kept entirely in process memory.
///
/// Ordered maps keep query results stable, matching the SQLite store's
/// primary-key ordering.
#[derive(Default)]
pub struct MemoryTrustStore {
    tables: RwLock<Tables>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls recorded for an account.
    pub fn save_count(&self, os_account_id: OsAccountId) -> u64 {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.saves.get(&os_account_id).copied().unwrap_or(0)
    }
}

impl TrustStore for MemoryTrustStore {
    fn add_group(&self, group: &GroupEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let key = (group.os_account_id, group.group_id.clone());
        if tables.groups.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("group {}", group.group_id)));
        }
        tables.groups.insert(key, group.clone());
        Ok(())
    }

    fn update_group(&self, group: &GroupEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let key = (group.os_account_id, group.group_id.clone());
        match tables.groups.get_mut(&key) {
            Some(existing) => {
                *existing = group.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("group {}", group.group_id))),
        }
    }

    fn delete_group(&self, os_account_id: OsAccountId, group_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables
            .groups
            .remove(&(os_account_id, group_id.to_string()))
            .is_none()
        {
            return Err(StoreError::NotFound(format!("group {group_id}")));
        }
        tables
            .devices
            .retain(|(os, gid, _), _| !(*os == os_account_id && gid == group_id));
        Ok(())
    }

    fn get_group(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
    ) -> Result<Option<GroupEntry>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .groups
            .get(&(os_account_id, group_id.to_string()))
            .cloned())
    }

    fn query_groups(
        &self,
        os_account_id: OsAccountId,
        query: &GroupQuery,
    ) -> Result<Vec<GroupEntry>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .groups
            .values()
            .filter(|g| g.os_account_id == os_account_id && query.matches(g))
            .cloned()
            .collect())
    }

    fn add_trusted_device(&self, device: &DeviceEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if !tables
            .groups
            .contains_key(&(device.os_account_id, device.group_id.clone()))
        {
            return Err(StoreError::NotFound(format!("group {}", device.group_id)));
        }
        let mut record = device.clone();
        record.updated_at = chrono::Utc::now().to_rfc3339();
        tables.devices.insert(
            (
                device.os_account_id,
                device.group_id.clone(),
                device.udid.clone(),
            ),
            record,
        );
        Ok(())
    }

    fn delete_trusted_device(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
        udid: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .devices
            .remove(&(os_account_id, group_id.to_string(), udid.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("device {udid} in group {group_id}")))
    }

    fn query_devices(
        &self,
        os_account_id: OsAccountId,
        query: &DeviceQuery,
    ) -> Result<Vec<DeviceEntry>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .devices
            .values()
            .filter(|d| d.os_account_id == os_account_id && query.matches(d))
            .cloned()
            .collect())
    }

    fn save(&self, os_account_id: OsAccountId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        *tables.saves.entry(os_account_id).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bindery_types::{DeviceType, GroupType};

    fn group(id: &str) -> GroupEntry {
        GroupEntry::new(100, id, "name", GroupType::PeerToPeer, "app")
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let store = MemoryTrustStore::new();
        store.add_group(&group("G1")).unwrap();
        let err = store.add_group(&group("G1")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn device_requires_group_and_upserts() {
        let store = MemoryTrustStore::new();
        let mut device = DeviceEntry::new(100, "G1", "D1", DeviceType::Accessory);
        assert!(matches!(
            store.add_trusted_device(&device),
            Err(StoreError::NotFound(_))
        ));

        store.add_group(&group("G1")).unwrap();
        store.add_trusted_device(&device).unwrap();
        device.user_type = DeviceType::Controller;
        store.add_trusted_device(&device).unwrap();

        let devices = store
            .query_devices(100, &DeviceQuery::in_group("G1"))
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].user_type, DeviceType::Controller);
        assert!(!devices[0].updated_at.is_empty());
    }

    #[test]
    fn delete_group_cascades_within_account_only() {
        let store = MemoryTrustStore::new();
        store.add_group(&group("G1")).unwrap();
        let mut other = group("G1");
        other.os_account_id = 101;
        store.add_group(&other).unwrap();
        store
            .add_trusted_device(&DeviceEntry::new(100, "G1", "D1", DeviceType::Accessory))
            .unwrap();
        store
            .add_trusted_device(&DeviceEntry::new(101, "G1", "D1", DeviceType::Accessory))
            .unwrap();

        store.delete_group(100, "G1").unwrap();

        assert_eq!(store.device_count(100, "G1").unwrap(), 0);
        assert_eq!(store.device_count(101, "G1").unwrap(), 1);
        assert!(matches!(
            store.delete_group(100, "G1"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn save_is_counted_per_account() {
        let store = MemoryTrustStore::new();
        store.save(100).unwrap();
        store.save(100).unwrap();
        assert_eq!(store.save_count(100), 2);
        assert_eq!(store.save_count(101), 0);
    }
}
