//! Shared types, error codes, and wire constants for bindery.
//!
//! This crate provides the vocabulary every other bindery crate speaks:
//! group and device classifications, operation codes, the confirmation
//! decisions exchanged during a bind, the integer error taxonomy carried on
//! the wire, and the callback traits through which the engine reports
//! progress to the application that requested an operation.
//!
//! Nothing here performs I/O. Keeping these definitions in a leaf crate lets
//! the storage, channel, module, and session crates agree on types without
//! depending on one another.

use serde::{Deserialize, Serialize};

mod callback;
mod error;
mod event;
pub mod fields;
mod limits;

pub use callback::{DataChangeListener, DeviceAuthCallback};
pub use error::{ErrorCode, ErrorKind};
pub use event::TrustEvent;
pub use limits::Limits;

/// Process-wide request identifier. One live session per value.
pub type RequestId = i64;

/// OS account scope for trust records.
pub type OsAccountId = i32;

/// Channel id used for the direct-callback channel, which has no real id.
pub const DEFAULT_CHANNEL_ID: i64 = -1;

/// Upper bound (in days) for a group expiry.
pub const MAX_EXPIRE_DAYS: i32 = 90;

/// Expiry value meaning "never expires".
pub const EXPIRE_NEVER: i32 = -1;

/// Kind of trust domain a group represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum GroupType {
    /// Devices logged into the same account.
    IdenticalAccount = 1,
    /// Devices paired directly with each other.
    PeerToPeer = 256,
    /// Devices of two different accounts that authorised each other.
    AcrossAccount = 1282,
}

impl GroupType {
    /// Returns the numeric code for this group type.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Attempts to convert a numeric code to a `GroupType`.
    ///
    /// Returns `None` if the code does not correspond to a known type.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::IdenticalAccount),
            256 => Some(Self::PeerToPeer),
            1282 => Some(Self::AcrossAccount),
            _ => None,
        }
    }

    /// Returns the string label for this group type.
    pub fn label(self) -> &'static str {
        match self {
            Self::IdenticalAccount => "IDENTICAL_ACCOUNT",
            Self::PeerToPeer => "PEER_TO_PEER",
            Self::AcrossAccount => "ACROSS_ACCOUNT",
        }
    }

    /// Whether membership is derived from an account rather than a pairing.
    pub fn is_account_based(self) -> bool {
        !matches!(self, Self::PeerToPeer)
    }
}

/// Whether a group is readable by applications that hold no role in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum GroupVisibility {
    /// Any application may query the group.
    Public = -1,
    /// Only the owner, managers, and friends may query the group.
    Private = 0,
}

impl GroupVisibility {
    /// Returns the numeric code for this visibility.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Attempts to convert a numeric code to a `GroupVisibility`.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Public),
            0 => Some(Self::Private),
            _ => None,
        }
    }
}

/// Role a device plays inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceType {
    /// A device that is controlled by others (a lamp, a watch).
    Accessory = 0,
    /// A device that controls accessories (a phone).
    Controller = 1,
    /// A device acting on behalf of another one.
    Proxy = 2,
}

impl DeviceType {
    /// Returns the numeric code for this device type.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Attempts to convert a numeric code to a `DeviceType`.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Accessory),
            1 => Some(Self::Controller),
            2 => Some(Self::Proxy),
            _ => None,
        }
    }

    /// Returns the string label for this device type.
    pub fn label(self) -> &'static str {
        match self {
            Self::Accessory => "ACCESSORY",
            Self::Controller => "CONTROLLER",
            Self::Proxy => "PROXY",
        }
    }
}

/// Operation a request performs. Carried on the wire as `operationCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum OperationCode {
    GroupCreate = 0,
    GroupDisband = 1,
    MemberInvite = 2,
    MemberJoin = 3,
    MemberDelete = 4,
    AccountBind = 5,
    Authenticate = 6,
    KeyAgreement = 7,
}

impl OperationCode {
    /// Returns the numeric code for this operation.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Attempts to convert a numeric code to an `OperationCode`.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::GroupCreate),
            1 => Some(Self::GroupDisband),
            2 => Some(Self::MemberInvite),
            3 => Some(Self::MemberJoin),
            4 => Some(Self::MemberDelete),
            5 => Some(Self::AccountBind),
            6 => Some(Self::Authenticate),
            7 => Some(Self::KeyAgreement),
            _ => None,
        }
    }

    /// Returns the string label for this operation.
    pub fn label(self) -> &'static str {
        match self {
            Self::GroupCreate => "GROUP_CREATE",
            Self::GroupDisband => "GROUP_DISBAND",
            Self::MemberInvite => "MEMBER_INVITE",
            Self::MemberJoin => "MEMBER_JOIN",
            Self::MemberDelete => "MEMBER_DELETE",
            Self::AccountBind => "ACCOUNT_BIND",
            Self::Authenticate => "AUTHENTICATE",
            Self::KeyAgreement => "KEY_AGREEMENT",
        }
    }

    /// Whether this operation adds a device to a group's trust set.
    pub fn is_bind(self) -> bool {
        matches!(self, Self::MemberInvite | Self::MemberJoin | Self::AccountBind)
    }

    /// Whether this operation removes a device from a group's trust set.
    pub fn is_unbind(self) -> bool {
        matches!(self, Self::MemberDelete)
    }
}

/// A user's answer to an inbound bind request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmDecision {
    Rejected,
    Accepted,
    /// The user has not decided yet; the request stays pending.
    Waiting,
}

impl ConfirmDecision {
    /// Returns the wire code for this decision.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Rejected => 0x8000_0005,
            Self::Accepted => 0x8000_0006,
            Self::Waiting => 0x8000_0007,
        }
    }

    /// Attempts to convert a wire code to a `ConfirmDecision`.
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0x8000_0005 => Some(Self::Rejected),
            0x8000_0006 => Some(Self::Accepted),
            0x8000_0007 => Some(Self::Waiting),
            _ => None,
        }
    }
}

/// Kind of wire message, carried as `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// First message of a handshake; may create a server session.
    Opening,
    /// Any later handshake message.
    Step,
    /// Best-effort failure notice.
    Error,
}

impl MessageKind {
    /// Returns the wire code for this message kind.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Opening => 1,
            Self::Step => 2,
            Self::Error => 0x8080,
        }
    }

    /// Attempts to convert a wire code to a `MessageKind`.
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Opening),
            2 => Some(Self::Step),
            0x8080 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Identity of the device this process runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDevice {
    /// Unique device identifier.
    pub udid: String,
    /// Role of this device when it joins groups.
    pub user_type: DeviceType,
    /// Network-level identifier used by the proximity transport, if any.
    pub conn_device_id: Option<String>,
}

impl LocalDevice {
    /// Creates a local device description.
    pub fn new(udid: impl Into<String>, user_type: DeviceType) -> Self {
        Self {
            udid: udid.into(),
            user_type,
            conn_device_id: None,
        }
    }

    /// Generates a random upper-case UDID for hosts without a stable one.
    pub fn generated_udid() -> String {
        uuid::Uuid::new_v4().simple().to_string().to_ascii_uppercase()
    }
}
