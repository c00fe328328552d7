//! Bind sessions: joining a group and removing a member from one.
//!
//! The full variant only binds peer-to-peer groups. The lite variant binds
//! any group type; each lite message names the identity or credential module
//! that handles it, defaulting to the one for the group's type.

mod client;
mod server;

pub(crate) use client::{JoinClient, UnbindClient};
pub(crate) use server::{JoinServer, UnbindServer};

use bindery_db::DeviceEntry;
use bindery_groups::{module_type_for, params};
use bindery_modules::ModuleType;
use bindery_types::{fields, DeviceType, GroupType, OsAccountId};
use serde_json::{json, Map, Value};

use crate::envelope::Envelope;
use crate::SessionError;

fn envelope(is_lite: bool, unbind: bool) -> Envelope {
    if is_lite {
        Envelope::Lite { unbind }
    } else {
        Envelope::Full
    }
}

/// Module a bind starts with. A lite request or opening may name one;
/// otherwise the group type decides.
fn bind_module(
    group_type: GroupType,
    is_lite: bool,
    request: &Value,
) -> Result<ModuleType, SessionError> {
    if !is_lite {
        if group_type.is_account_based() {
            return Err(SessionError::NotSupported("full-variant bind of account groups"));
        }
        return Ok(module_type_for(group_type));
    }
    match params::optional_i64(request, fields::MODULE_TYPE)? {
        None => Ok(module_type_for(group_type)),
        Some(t) => i32::try_from(t)
            .ok()
            .and_then(ModuleType::from_i32)
            .ok_or_else(|| SessionError::InvalidParams(format!("unknown module type {t}"))),
    }
}

fn group_fields(msg: &mut Map<String, Value>, group_id: &str, group_type: GroupType) {
    msg.insert(fields::GROUP_ID.into(), json!(group_id));
    msg.insert(fields::GROUP_TYPE.into(), json!(group_type.as_i32()));
}

/// The device type a message's sender declared.
fn sender_type(msg: &Value) -> Result<DeviceType, SessionError> {
    msg.get(fields::USER_TYPE)
        .and_then(Value::as_i64)
        .and_then(|t| i32::try_from(t).ok())
        .and_then(DeviceType::from_i32)
        .ok_or_else(|| SessionError::Malformed("missing or invalid userType".into()))
}

/// Trust record for a peer that just finished a bind.
fn peer_record(
    os: OsAccountId,
    group_id: &str,
    udid: &str,
    user_type: DeviceType,
    own: &Value,
) -> DeviceEntry {
    let mut entry = DeviceEntry::new(os, group_id, udid, user_type);
    if let Some(auth_id) = own
        .get(fields::PEER_AUTH_ID)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        entry.auth_id = auth_id.to_string();
    }
    entry
}
