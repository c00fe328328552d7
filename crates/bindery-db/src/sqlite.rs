//! SQLite-backed trust store.

use bindery_types::{DeviceType, GroupType, GroupVisibility, OsAccountId};
use rusqlite::{params, OptionalExtension, Row};

use crate::pool::{open_migrated_pool, DbPool, DbRuntimeSettings, PoolError};
use crate::store::{DeviceEntry, DeviceQuery, GroupEntry, GroupQuery, StoreError, TrustStore};

const GROUP_COLUMNS: &str = "os_account_id, group_id, group_name, group_type, owner, visibility,
     expire_time, user_id, shared_user_id, managers, friends";

const DEVICE_COLUMNS: &str =
    "os_account_id, group_id, udid, auth_id, user_type, service_type, is_local, updated_at";

/// A [`TrustStore`] persisted in SQLite.
///
/// Every mutation commits immediately; [`TrustStore::save`] records a
/// checkpoint timestamp for the account.
#[derive(Clone)]
pub struct SqliteTrustStore {
    pool: DbPool,
}

impl SqliteTrustStore {
    /// Wraps an existing pool whose schema is already migrated.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `path` and migrates it.
    pub fn open(path: &str, settings: DbRuntimeSettings) -> Result<Self, PoolError> {
        let (pool, _) = open_migrated_pool(path, settings)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Timestamp of the last `save` for an account, if any.
    pub fn last_saved_at(&self, os_account_id: OsAccountId) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT saved_at FROM save_checkpoints WHERE os_account_id = ?1",
                [os_account_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn corrupt(column: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Integer,
        Box::new(StoreError::Corrupt(what)),
    )
}

fn parse_list(column: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn map_row_to_group(row: &Row) -> rusqlite::Result<GroupEntry> {
    let group_type: i32 = row.get(3)?;
    let visibility: i32 = row.get(5)?;
    let managers: String = row.get(9)?;
    let friends: String = row.get(10)?;

    Ok(GroupEntry {
        os_account_id: row.get(0)?,
        group_id: row.get(1)?,
        group_name: row.get(2)?,
        group_type: GroupType::from_i32(group_type)
            .ok_or_else(|| corrupt(3, format!("group type {group_type}")))?,
        owner: row.get(4)?,
        visibility: GroupVisibility::from_i32(visibility)
            .ok_or_else(|| corrupt(5, format!("visibility {visibility}")))?,
        expire_time: row.get(6)?,
        user_id: row.get(7)?,
        shared_user_id: row.get(8)?,
        managers: parse_list(9, &managers)?,
        friends: parse_list(10, &friends)?,
    })
}

fn map_row_to_device(row: &Row) -> rusqlite::Result<DeviceEntry> {
    let user_type: i32 = row.get(4)?;
    Ok(DeviceEntry {
        os_account_id: row.get(0)?,
        group_id: row.get(1)?,
        udid: row.get(2)?,
        auth_id: row.get(3)?,
        user_type: DeviceType::from_i32(user_type)
            .ok_or_else(|| corrupt(4, format!("user type {user_type}")))?,
        service_type: row.get(5)?,
        is_local: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl TrustStore for SqliteTrustStore {
    fn add_group(&self, group: &GroupEntry) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let managers = serde_json::to_string(&group.managers)?;
        let friends = serde_json::to_string(&group.friends)?;

        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO trust_groups ({GROUP_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                group.os_account_id,
                group.group_id,
                group.group_name,
                group.group_type.as_i32(),
                group.owner,
                group.visibility.as_i32(),
                group.expire_time,
                group.user_id,
                group.shared_user_id,
                managers,
                friends,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(format!("group {}", group.group_id)));
        }
        Ok(())
    }

    fn update_group(&self, group: &GroupEntry) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let managers = serde_json::to_string(&group.managers)?;
        let friends = serde_json::to_string(&group.friends)?;

        let updated = conn.execute(
            "UPDATE trust_groups SET
                group_name = ?3, group_type = ?4, owner = ?5, visibility = ?6,
                expire_time = ?7, user_id = ?8, shared_user_id = ?9,
                managers = ?10, friends = ?11
             WHERE os_account_id = ?1 AND group_id = ?2",
            params![
                group.os_account_id,
                group.group_id,
                group.group_name,
                group.group_type.as_i32(),
                group.owner,
                group.visibility.as_i32(),
                group.expire_time,
                group.user_id,
                group.shared_user_id,
                managers,
                friends,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("group {}", group.group_id)));
        }
        Ok(())
    }

    fn delete_group(&self, os_account_id: OsAccountId, group_id: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM trust_groups WHERE os_account_id = ?1 AND group_id = ?2",
            params![os_account_id, group_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("group {group_id}")));
        }
        Ok(())
    }

    fn get_group(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
    ) -> Result<Option<GroupEntry>, StoreError> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {GROUP_COLUMNS} FROM trust_groups
                     WHERE os_account_id = ?1 AND group_id = ?2"
                ),
                params![os_account_id, group_id],
                map_row_to_group,
            )
            .optional()?)
    }

    fn query_groups(
        &self,
        os_account_id: OsAccountId,
        query: &GroupQuery,
    ) -> Result<Vec<GroupEntry>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM trust_groups
             WHERE os_account_id = ?1 ORDER BY group_id ASC"
        ))?;

        let rows = stmt.query_map([os_account_id], map_row_to_group)?;
        let mut groups = Vec::new();
        for row in rows {
            let group = row?;
            if query.matches(&group) {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    fn add_trusted_device(&self, device: &DeviceEntry) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let group_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM trust_groups WHERE os_account_id = ?1 AND group_id = ?2)",
            params![device.os_account_id, device.group_id],
            |row| row.get(0),
        )?;
        if !group_exists {
            return Err(StoreError::NotFound(format!("group {}", device.group_id)));
        }

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO trusted_devices ({DEVICE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                device.os_account_id,
                device.group_id,
                device.udid,
                device.auth_id,
                device.user_type.as_i32(),
                device.service_type,
                device.is_local,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_trusted_device(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
        udid: &str,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM trusted_devices
             WHERE os_account_id = ?1 AND group_id = ?2 AND udid = ?3",
            params![os_account_id, group_id, udid],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!(
                "device {udid} in group {group_id}"
            )));
        }
        Ok(())
    }

    fn query_devices(
        &self,
        os_account_id: OsAccountId,
        query: &DeviceQuery,
    ) -> Result<Vec<DeviceEntry>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM trusted_devices
             WHERE os_account_id = ?1 ORDER BY group_id ASC, udid ASC"
        ))?;

        let rows = stmt.query_map([os_account_id], map_row_to_device)?;
        let mut devices = Vec::new();
        for row in rows {
            let device = row?;
            if query.matches(&device) {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    fn save(&self, os_account_id: OsAccountId) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO save_checkpoints (os_account_id, saved_at) VALUES (?1, ?2)
             ON CONFLICT(os_account_id) DO UPDATE SET saved_at = excluded.saved_at",
            params![os_account_id, chrono::Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(os_account_id, "trust store checkpoint recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MEMORY_PATH;

    fn store() -> SqliteTrustStore {
        SqliteTrustStore::open(MEMORY_PATH, DbRuntimeSettings::default())
            .expect("in-memory store should open")
    }

    #[test]
    fn group_round_trips_role_lists() {
        let store = store();
        let mut group = GroupEntry::new(100, "G1", "home", GroupType::PeerToPeer, "owner");
        group.managers = vec!["mgr".into()];
        group.friends = vec!["f1".into(), "f2".into()];
        group.visibility = GroupVisibility::Private;
        group.expire_time = 30;
        store.add_group(&group).expect("add should succeed");

        let loaded = store
            .get_group(100, "G1")
            .expect("get should succeed")
            .expect("group should exist");
        assert_eq!(loaded, group);
    }

    #[test]
    fn add_group_twice_reports_already_exists() {
        let store = store();
        let group = GroupEntry::new(100, "G1", "home", GroupType::PeerToPeer, "owner");
        store.add_group(&group).expect("first add should succeed");
        let err = store.add_group(&group).expect_err("second add should fail");
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn update_missing_group_is_not_found() {
        let store = store();
        let group = GroupEntry::new(100, "G1", "home", GroupType::PeerToPeer, "owner");
        let err = store.update_group(&group).expect_err("update should fail");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn corrupt_group_type_surfaces_as_error() {
        let store = store();
        let conn = store.pool().get().expect("should get connection");
        conn.execute(
            "INSERT INTO trust_groups (os_account_id, group_id, group_name, group_type, owner)
             VALUES (100, 'BAD', 'x', 9999, 'app')",
            [],
        )
        .expect("raw insert should succeed");
        drop(conn);

        assert!(store.get_group(100, "BAD").is_err());
    }

    #[test]
    fn save_records_checkpoint() {
        let store = store();
        assert_eq!(store.last_saved_at(100).expect("query"), None);
        store.save(100).expect("save should succeed");
        assert!(store.last_saved_at(100).expect("query").is_some());
    }
}
