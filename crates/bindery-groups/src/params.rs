//! Typed access to JSON request parameters.

use bindery_types::{DeviceType, GroupType, GroupVisibility, EXPIRE_NEVER, MAX_EXPIRE_DAYS};
use serde_json::Value;

use crate::GroupError;

/// Returns a required non-empty string field.
pub fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, GroupError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GroupError::InvalidParams(format!("missing {field}")))
}

/// Returns an optional non-empty string field.
pub fn optional_str<'a>(params: &'a Value, field: &str) -> Option<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Returns an optional integer field; present but non-integer is an error.
pub fn optional_i64(params: &Value, field: &str) -> Result<Option<i64>, GroupError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| GroupError::InvalidParams(format!("{field} must be an integer"))),
    }
}

pub fn optional_bool(params: &Value, field: &str) -> bool {
    params.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn to_i32(field: &str, value: i64) -> Result<i32, GroupError> {
    i32::try_from(value).map_err(|_| GroupError::InvalidParams(format!("{field} out of range")))
}

/// Parses a group type code, rejecting unknown and compiled-out types.
pub fn group_type(value: i64) -> Result<GroupType, GroupError> {
    let code = to_i32("groupType", value)?;
    let group_type = GroupType::from_i32(code)
        .ok_or_else(|| GroupError::InvalidParams(format!("unknown group type {code}")))?;
    if group_type.is_account_based() && !cfg!(feature = "account-groups") {
        return Err(GroupError::NotSupported(group_type.label()));
    }
    Ok(group_type)
}

pub fn required_group_type(params: &Value, field: &str) -> Result<GroupType, GroupError> {
    let value = optional_i64(params, field)?
        .ok_or_else(|| GroupError::InvalidParams(format!("missing {field}")))?;
    group_type(value)
}

/// Visibility defaults to public.
pub fn visibility(params: &Value, field: &str) -> Result<GroupVisibility, GroupError> {
    match optional_i64(params, field)? {
        None => Ok(GroupVisibility::Public),
        Some(v) => GroupVisibility::from_i32(to_i32(field, v)?)
            .ok_or_else(|| GroupError::InvalidParams(format!("invalid visibility {v}"))),
    }
}

/// Expiry defaults to never; otherwise it must be 1..=90 days.
pub fn expire_time(params: &Value, field: &str) -> Result<i32, GroupError> {
    match optional_i64(params, field)? {
        None => Ok(EXPIRE_NEVER),
        Some(v) => {
            let days = to_i32(field, v)?;
            if days == EXPIRE_NEVER || (1..=MAX_EXPIRE_DAYS).contains(&days) {
                Ok(days)
            } else {
                Err(GroupError::InvalidParams(format!("invalid expire time {days}")))
            }
        }
    }
}

/// Device type, or `default` when absent.
pub fn user_type(params: &Value, field: &str, default: DeviceType) -> Result<DeviceType, GroupError> {
    match optional_i64(params, field)? {
        None => Ok(default),
        Some(v) => DeviceType::from_i32(to_i32(field, v)?)
            .ok_or_else(|| GroupError::InvalidParams(format!("invalid user type {v}"))),
    }
}
