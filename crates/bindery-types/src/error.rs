//! Integer error taxonomy shared by every bindery crate.
//!
//! Each crate keeps its own `thiserror` enum for rich local context, and maps
//! it onto an [`ErrorCode`] when the error crosses a boundary: an `on_error`
//! callback, a `groupErrorMsg` field in an error notice, or a synchronous
//! return from a public entry point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed or missing required fields.
    InvalidInput,
    /// Group, device, session, or module absent.
    NotFound,
    /// Role or permission check failed.
    NotAuthorized,
    /// Module or group type disabled at build time.
    NotSupported,
    /// Channel open or send failed.
    TransportFailure,
    /// Repeated opening message or second session for a live request.
    DuplicateRequest,
    /// Peer-reported failure or failed module task.
    ProtocolError,
    /// Trust store mutation failed.
    StorageFailure,
}

/// Error code carried on the wire and delivered to `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidInput = 1001,
    NotFound = 1002,
    NotAuthorized = 1003,
    NotSupported = 1004,
    TransportFailure = 1005,
    DuplicateRequest = 1006,
    ProtocolError = 1007,
    StorageFailure = 1008,
    /// The receiving user rejected the bind request.
    RequestRejected = 1009,
    /// A group-count or device-count ceiling would be exceeded.
    BeyondLimit = 1010,
    /// The worker queue is full.
    Busy = 1011,
}

impl ErrorCode {
    /// Returns the numeric code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Converts a wire code back into an `ErrorCode`.
    ///
    /// Unknown codes from a peer are reported as [`ErrorCode::ProtocolError`]
    /// rather than rejected, since the peer may run a newer version.
    pub fn from_wire(code: i64) -> Self {
        match code {
            1001 => Self::InvalidInput,
            1002 => Self::NotFound,
            1003 => Self::NotAuthorized,
            1004 => Self::NotSupported,
            1005 => Self::TransportFailure,
            1006 => Self::DuplicateRequest,
            1007 => Self::ProtocolError,
            1008 => Self::StorageFailure,
            1009 => Self::RequestRejected,
            1010 => Self::BeyondLimit,
            1011 => Self::Busy,
            _ => Self::ProtocolError,
        }
    }

    /// Returns the taxonomy bucket this code belongs to.
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::InvalidInput => ErrorKind::InvalidInput,
            Self::NotFound => ErrorKind::NotFound,
            Self::NotAuthorized | Self::BeyondLimit => ErrorKind::NotAuthorized,
            Self::NotSupported => ErrorKind::NotSupported,
            Self::TransportFailure | Self::Busy => ErrorKind::TransportFailure,
            Self::DuplicateRequest => ErrorKind::DuplicateRequest,
            Self::ProtocolError | Self::RequestRejected => ErrorKind::ProtocolError,
            Self::StorageFailure => ErrorKind::StorageFailure,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for code in [
            ErrorCode::InvalidInput,
            ErrorCode::NotFound,
            ErrorCode::NotAuthorized,
            ErrorCode::NotSupported,
            ErrorCode::TransportFailure,
            ErrorCode::DuplicateRequest,
            ErrorCode::ProtocolError,
            ErrorCode::StorageFailure,
            ErrorCode::RequestRejected,
            ErrorCode::BeyondLimit,
            ErrorCode::Busy,
        ] {
            assert_eq!(ErrorCode::from_wire(code.as_i32() as i64), code);
        }
    }

    #[test]
    fn unknown_peer_code_is_protocol_error() {
        assert_eq!(ErrorCode::from_wire(42), ErrorCode::ProtocolError);
    }

    #[test]
    fn limit_errors_are_authorization_failures() {
        assert_eq!(ErrorCode::BeyondLimit.kind(), ErrorKind::NotAuthorized);
        assert_eq!(ErrorCode::RequestRejected.kind(), ErrorKind::ProtocolError);
    }
}
