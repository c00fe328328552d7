use bindery_channels::ChannelError;
use bindery_groups::GroupError;
use bindery_modules::ModuleError;
use bindery_types::{ErrorCode, RequestId};
use thiserror::Error;

/// Errors that can occur while creating or driving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session for request {0} already exists")]
    AlreadyExists(RequestId),
    #[error("no session for request {0}")]
    NotFound(RequestId),
    #[error("no callback registered for the requesting app")]
    NoCallback,
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{0} is not supported")]
    NotSupported(&'static str),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unexpected {event} while {state}")]
    UnexpectedEvent {
        state: &'static str,
        event: &'static str,
    },
    /// The peer sent an error notice.
    #[error("peer reported {0}")]
    PeerReported(ErrorCode),
    #[error("the request was rejected")]
    Rejected,
    #[error("the channel closed before the handshake finished")]
    ChannelClosed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Group(#[from] GroupError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyExists(_) => ErrorCode::DuplicateRequest,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::NoCallback | Self::InvalidParams(_) => ErrorCode::InvalidInput,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::Malformed(_) | Self::UnexpectedEvent { .. } => ErrorCode::ProtocolError,
            Self::PeerReported(code) => *code,
            Self::Rejected => ErrorCode::RequestRejected,
            Self::ChannelClosed => ErrorCode::TransportFailure,
            Self::Channel(e) => e.code(),
            Self::Module(e) => e.code(),
            Self::Group(e) => e.code(),
        }
    }

    /// Whether this failure must not be echoed to the peer as an error notice.
    ///
    /// Echoing a peer's own notice back would loop, and a closed channel has
    /// nowhere to send to.
    pub fn suppresses_notice(&self) -> bool {
        matches!(self, Self::PeerReported(_) | Self::ChannelClosed)
    }
}
