use bindery_types::{DeviceType, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Package name under which group identity keys are registered.
pub const GROUP_KEY_PACKAGE: &str = "bindery.groups";

/// Identifier of a task inside one module.
pub type TaskId = i32;

/// Kind of authenticator module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ModuleType {
    /// Device-identity keys exchanged at pairing time.
    Identity = 0x0001,
    /// Account credentials.
    Credential = 0x0010,
}

impl ModuleType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0x0001 => Some(Self::Identity),
            0x0010 => Some(Self::Credential),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Credential => "CREDENTIAL",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors raised by the dispatcher or reported by a module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("no module registered for {0}")]
    NotFound(ModuleType),
    #[error("module {0} is already registered")]
    AlreadyRegistered(ModuleType),
    #[error("module {module} does not support {operation}")]
    Unsupported {
        module: ModuleType,
        operation: &'static str,
    },
    #[error("invalid module parameters: {0}")]
    InvalidParams(String),
    #[error("message was already consumed")]
    Duplicate,
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("incompatible protocol version: peer {peer}, local {local}")]
    VersionMismatch { peer: String, local: String },
    /// A module-reported failure.
    #[error("module task failed: {0}")]
    Failed(String),
}

impl ModuleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::TaskNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyRegistered(_) => ErrorCode::DuplicateRequest,
            Self::Unsupported { .. } => ErrorCode::NotSupported,
            Self::InvalidParams(_) => ErrorCode::InvalidInput,
            Self::Duplicate => ErrorCode::DuplicateRequest,
            Self::VersionMismatch { .. } | Self::Failed(_) => ErrorCode::ProtocolError,
        }
    }
}

/// Externally observable status of a task after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// More messages are expected.
    Continue,
    /// The handshake is complete on this side.
    Finish,
}

/// Result of one task step.
///
/// `out` is owned by the module. For full-variant tasks it may carry
/// `payload` (to send), `sessionKey`, `peerAuthId`, and `peerUserType`; for
/// lite tasks it carries `sendToPeer` and `sendToSelf`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub status: TaskStatus,
    pub out: Value,
}

impl TaskOutput {
    pub fn is_finished(&self) -> bool {
        self.status == TaskStatus::Finish
    }
}

/// Inputs addressing one identity key inside a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityParams {
    pub pkg_name: String,
    pub service_type: String,
    pub auth_id: Vec<u8>,
    /// Raw device role code, validated before use.
    pub user_type: i32,
}

impl IdentityParams {
    pub fn new(
        pkg_name: impl Into<String>,
        service_type: impl Into<String>,
        auth_id: impl Into<Vec<u8>>,
        user_type: DeviceType,
    ) -> Self {
        Self {
            pkg_name: pkg_name.into(),
            service_type: service_type.into(),
            auth_id: auth_id.into(),
            user_type: user_type.as_i32(),
        }
    }

    /// Identity key params for a device inside a group.
    pub fn for_group(group_id: &str, auth_id: &str, user_type: DeviceType) -> Self {
        Self::new(GROUP_KEY_PACKAGE, group_id, auth_id.as_bytes(), user_type)
    }

    /// Checks every field and returns the derived key alias.
    pub fn validate(&self) -> Result<String, ModuleError> {
        if self.pkg_name.is_empty() {
            return Err(ModuleError::InvalidParams("empty package name".into()));
        }
        if self.service_type.is_empty() {
            return Err(ModuleError::InvalidParams("empty service type".into()));
        }
        if self.auth_id.is_empty() {
            return Err(ModuleError::InvalidParams("empty auth id".into()));
        }
        let user_type = DeviceType::from_i32(self.user_type).ok_or_else(|| {
            ModuleError::InvalidParams(format!("invalid user type {}", self.user_type))
        })?;
        bindery_identity::derive_key_alias(
            &self.pkg_name,
            &self.service_type,
            &self.auth_id,
            user_type,
        )
        .map_err(|e| ModuleError::InvalidParams(e.to_string()))
    }
}
