//! Trust store interface and record types.

use bindery_types::{
    fields, DeviceType, ErrorCode, GroupType, GroupVisibility, OsAccountId, EXPIRE_NEVER,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors that can occur during trust store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Maps this error onto the shared error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::DuplicateRequest,
            _ => ErrorCode::StorageFailure,
        }
    }
}

/// A persisted group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub os_account_id: OsAccountId,
    /// Derived identifier, unique per OS account.
    pub group_id: String,
    pub group_name: String,
    pub group_type: GroupType,
    /// App id of the owning application.
    pub owner: String,
    pub visibility: GroupVisibility,
    /// Days until expiry, or [`EXPIRE_NEVER`].
    pub expire_time: i32,
    /// Account id for account-based groups.
    pub user_id: Option<String>,
    /// Second account id for cross-account groups.
    pub shared_user_id: Option<String>,
    /// App ids allowed to edit the group.
    pub managers: Vec<String>,
    /// App ids allowed to read the group.
    pub friends: Vec<String>,
}

impl GroupEntry {
    /// Creates a group entry with default visibility, expiry and no roles.
    pub fn new(
        os_account_id: OsAccountId,
        group_id: impl Into<String>,
        group_name: impl Into<String>,
        group_type: GroupType,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            os_account_id,
            group_id: group_id.into(),
            group_name: group_name.into(),
            group_type,
            owner: owner.into(),
            visibility: GroupVisibility::Public,
            expire_time: EXPIRE_NEVER,
            user_id: None,
            shared_user_id: None,
            managers: Vec::new(),
            friends: Vec::new(),
        }
    }

    pub fn is_owner(&self, app_id: &str) -> bool {
        self.owner == app_id
    }

    pub fn is_manager(&self, app_id: &str) -> bool {
        self.managers.iter().any(|m| m == app_id)
    }

    pub fn is_friend(&self, app_id: &str) -> bool {
        self.friends.iter().any(|f| f == app_id)
    }

    /// Renders the group as the JSON document handed to applications.
    pub fn to_info(&self) -> Value {
        let mut info = Map::new();
        info.insert(fields::GROUP_ID.into(), json!(self.group_id));
        info.insert(fields::GROUP_NAME.into(), json!(self.group_name));
        info.insert(fields::GROUP_OWNER.into(), json!(self.owner));
        info.insert(fields::GROUP_TYPE.into(), json!(self.group_type.as_i32()));
        info.insert(
            fields::GROUP_VISIBILITY.into(),
            json!(self.visibility.as_i32()),
        );
        info.insert(fields::EXPIRE_TIME.into(), json!(self.expire_time));
        if let Some(user_id) = &self.user_id {
            info.insert(fields::USER_ID.into(), json!(user_id));
        }
        if let Some(shared) = &self.shared_user_id {
            info.insert(fields::SHARED_USER_ID.into(), json!(shared));
        }
        Value::Object(info)
    }
}

/// A device trusted within a group.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub os_account_id: OsAccountId,
    pub group_id: String,
    pub udid: String,
    /// Authentication identifier, defaults to the UDID.
    pub auth_id: String,
    pub user_type: DeviceType,
    /// Group-scoped service type tag.
    pub service_type: String,
    /// Whether this record describes the local device.
    pub is_local: bool,
    /// Last modification time (RFC 3339). Set by the store on write.
    pub updated_at: String,
}

impl DeviceEntry {
    /// Creates a device entry whose auth id and service type take their
    /// defaults (the UDID and the group id).
    pub fn new(
        os_account_id: OsAccountId,
        group_id: impl Into<String>,
        udid: impl Into<String>,
        user_type: DeviceType,
    ) -> Self {
        let group_id = group_id.into();
        let udid = udid.into();
        Self {
            os_account_id,
            auth_id: udid.clone(),
            service_type: group_id.clone(),
            group_id,
            udid,
            user_type,
            is_local: false,
            updated_at: String::new(),
        }
    }

    /// Renders the device as the JSON document handed to applications.
    pub fn to_info(&self) -> Value {
        json!({
            fields::GROUP_ID: self.group_id,
            "udid": self.udid,
            fields::AUTH_ID: self.auth_id,
            fields::USER_TYPE: self.user_type.as_i32(),
            fields::SERVICE_TYPE: self.service_type,
        })
    }
}

/// Filter for group queries. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupQuery {
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub owner: Option<String>,
    pub group_type: Option<GroupType>,
    pub visibility: Option<GroupVisibility>,
    pub user_id: Option<String>,
}

impl GroupQuery {
    pub fn by_type(group_type: GroupType) -> Self {
        Self {
            group_type: Some(group_type),
            ..Self::default()
        }
    }

    pub fn matches(&self, group: &GroupEntry) -> bool {
        self.group_id.as_ref().map_or(true, |v| *v == group.group_id)
            && self.group_name.as_ref().map_or(true, |v| *v == group.group_name)
            && self.owner.as_ref().map_or(true, |v| *v == group.owner)
            && self.group_type.map_or(true, |v| v == group.group_type)
            && self.visibility.map_or(true, |v| v == group.visibility)
            && self
                .user_id
                .as_ref()
                .map_or(true, |v| group.user_id.as_deref() == Some(v.as_str()))
    }
}

/// Filter for device queries. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceQuery {
    pub group_id: Option<String>,
    pub udid: Option<String>,
    pub auth_id: Option<String>,
}

impl DeviceQuery {
    pub fn in_group(group_id: &str) -> Self {
        Self {
            group_id: Some(group_id.to_string()),
            ..Self::default()
        }
    }

    pub fn by_udid(udid: &str) -> Self {
        Self {
            udid: Some(udid.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, device: &DeviceEntry) -> bool {
        self.group_id.as_ref().map_or(true, |v| *v == device.group_id)
            && self.udid.as_ref().map_or(true, |v| *v == device.udid)
            && self.auth_id.as_ref().map_or(true, |v| *v == device.auth_id)
    }
}

/// Persistent set of groups and trusted devices.
///
/// Implementations must be safe to share across threads. The session worker
/// is the only writer in a running service, but queries and tests may read
/// concurrently.
pub trait TrustStore: Send + Sync {
    /// Inserts a new group.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the id is taken.
    fn add_group(&self, group: &GroupEntry) -> Result<(), StoreError>;

    /// Replaces an existing group's attributes and role lists.
    fn update_group(&self, group: &GroupEntry) -> Result<(), StoreError>;

    /// Deletes a group and every device record in it.
    fn delete_group(&self, os_account_id: OsAccountId, group_id: &str) -> Result<(), StoreError>;

    fn get_group(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
    ) -> Result<Option<GroupEntry>, StoreError>;

    fn query_groups(
        &self,
        os_account_id: OsAccountId,
        query: &GroupQuery,
    ) -> Result<Vec<GroupEntry>, StoreError>;

    /// Inserts or replaces the record for `(group_id, udid)`.
    ///
    /// Fails with [`StoreError::NotFound`] if the group does not exist.
    fn add_trusted_device(&self, device: &DeviceEntry) -> Result<(), StoreError>;

    /// Removes one device record.
    ///
    /// Fails with [`StoreError::NotFound`] if the record does not exist.
    fn delete_trusted_device(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
        udid: &str,
    ) -> Result<(), StoreError>;

    fn query_devices(
        &self,
        os_account_id: OsAccountId,
        query: &DeviceQuery,
    ) -> Result<Vec<DeviceEntry>, StoreError>;

    /// Makes every mutation so far for the account durable.
    fn save(&self, os_account_id: OsAccountId) -> Result<(), StoreError>;

    fn group_exists(&self, os_account_id: OsAccountId, group_id: &str) -> Result<bool, StoreError> {
        Ok(self.get_group(os_account_id, group_id)?.is_some())
    }

    fn get_device(
        &self,
        os_account_id: OsAccountId,
        group_id: &str,
        udid: &str,
    ) -> Result<Option<DeviceEntry>, StoreError> {
        let query = DeviceQuery {
            group_id: Some(group_id.to_string()),
            udid: Some(udid.to_string()),
            auth_id: None,
        };
        Ok(self.query_devices(os_account_id, &query)?.into_iter().next())
    }

    fn group_count(&self, os_account_id: OsAccountId) -> Result<usize, StoreError> {
        Ok(self
            .query_groups(os_account_id, &GroupQuery::default())?
            .len())
    }

    fn device_count(&self, os_account_id: OsAccountId, group_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .query_devices(os_account_id, &DeviceQuery::in_group(group_id))?
            .len())
    }
}
