//! Deterministic identifier derivation for bindery.
//!
//! Group ids are never chosen by users. They are one-way digests of the
//! inputs that define the group, so every device computing the id of the
//! same group arrives at the same string, and two applications using the
//! same group name end up with different groups.
//!
//! Every multi-part digest length-prefixes its parts, so `("ab", "c")` and
//! `("a", "bc")` hash differently.

use bindery_types::DeviceType;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced by identifier derivation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// A required input was empty.
    #[error("{0} cannot be empty")]
    Empty(&'static str),
}

/// Derives the id of a peer-to-peer group.
///
/// Formula: `groupId = SHA256(len(groupName) || groupName || len(appId) || appId)`,
/// rendered as upper-case hex.
///
/// # Errors
///
/// Returns [`IdentityError::Empty`] if either input is empty.
pub fn derive_peer_to_peer_group_id(group_name: &str, app_id: &str) -> Result<String, IdentityError> {
    require("group name", group_name)?;
    require("app id", app_id)?;
    Ok(digest_parts(&[group_name.as_bytes(), app_id.as_bytes()]))
}

/// Derives the id of an identical-account group from the account's user id.
///
/// # Errors
///
/// Returns [`IdentityError::Empty`] if `user_id` is empty.
pub fn derive_account_group_id(user_id: &str) -> Result<String, IdentityError> {
    require("user id", user_id)?;
    Ok(digest_parts(&[user_id.as_bytes()]))
}

/// Derives the id of a cross-account group shared between two accounts.
///
/// # Errors
///
/// Returns [`IdentityError::Empty`] if either user id is empty.
pub fn derive_across_account_group_id(
    user_id: &str,
    shared_user_id: &str,
) -> Result<String, IdentityError> {
    require("user id", user_id)?;
    require("shared user id", shared_user_id)?;
    Ok(digest_parts(&[user_id.as_bytes(), shared_user_id.as_bytes()]))
}

/// Derives the alias under which an authenticator module stores identity
/// key material for `(package, service type, auth id, device type)`.
///
/// # Errors
///
/// Returns [`IdentityError::Empty`] if the package, service type, or auth id
/// is empty.
pub fn derive_key_alias(
    pkg_name: &str,
    service_type: &str,
    auth_id: &[u8],
    user_type: DeviceType,
) -> Result<String, IdentityError> {
    require("package name", pkg_name)?;
    require("service type", service_type)?;
    if auth_id.is_empty() {
        return Err(IdentityError::Empty("auth id"));
    }
    let role = user_type.as_i32().to_be_bytes();
    Ok(digest_parts(&[
        pkg_name.as_bytes(),
        service_type.as_bytes(),
        auth_id,
        &role,
    ]))
}

fn require(what: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty(what));
    }
    Ok(())
}

fn digest_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hex::encode_upper(hasher.finalize())
}
