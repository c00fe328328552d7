//! Protocol version marker negotiated between peers.

use bindery_types::fields;
use serde_json::{json, Value};
use std::fmt;

use crate::ModuleError;

/// A `major.minor.patch` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.').map(|p| p.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next()??;
        let patch = parts.next()??;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The version this build speaks and the oldest it still accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub current: Version,
    pub min: Version,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LOCAL
    }
}

impl ProtocolVersion {
    pub const LOCAL: ProtocolVersion = ProtocolVersion {
        current: Version::new(2, 1, 0),
        min: Version::new(1, 0, 0),
    };

    pub fn to_value(self) -> Value {
        json!({
            fields::CURRENT_VERSION: self.current.to_string(),
            fields::MIN_VERSION: self.min.to_string(),
        })
    }

    /// Reads the marker from a message. Messages without one are treated as
    /// coming from a peer at the oldest supported version.
    pub fn from_message(message: &Value) -> Result<Self, ModuleError> {
        let Some(marker) = message.get(fields::VERSION) else {
            return Ok(Self {
                current: Self::LOCAL.min,
                min: Self::LOCAL.min,
            });
        };
        let read = |field: &str| {
            marker
                .get(field)
                .and_then(Value::as_str)
                .and_then(Version::parse)
                .ok_or_else(|| {
                    ModuleError::InvalidParams(format!("malformed version field {field}"))
                })
        };
        Ok(Self {
            current: read(fields::CURRENT_VERSION)?,
            min: read(fields::MIN_VERSION)?,
        })
    }

    /// Adds this marker to an outbound document. Non-objects are left alone.
    pub fn stamp(self, out: &mut Value) {
        if let Some(map) = out.as_object_mut() {
            map.insert(fields::VERSION.to_string(), self.to_value());
        }
    }

    /// Whether two ends can talk: each one's current version must reach the
    /// other's minimum.
    pub fn is_compatible_with(self, peer: ProtocolVersion) -> bool {
        peer.current >= self.min && self.current >= peer.min
    }

    /// Fails with [`ModuleError::VersionMismatch`] if the message's sender
    /// cannot talk to this build.
    pub fn check_peer(self, message: &Value) -> Result<(), ModuleError> {
        let peer = Self::from_message(message)?;
        if self.is_compatible_with(peer) {
            Ok(())
        } else {
            Err(ModuleError::VersionMismatch {
                peer: peer.current.to_string(),
                local: self.current.to_string(),
            })
        }
    }
}
