//! Inputs to and outputs from a session step.
//!
//! A session never calls a callback, a channel, or a listener itself. Each
//! step returns the [`Effect`]s it wants performed and the registry's driver
//! carries them out in order.

use bindery_types::TrustEvent;
use serde_json::Value;

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session was just created.
    Start,
    /// The session's channel is usable.
    ChannelOpened { channel_id: i64 },
    /// A decoded wire message from the peer.
    Message(Value),
    /// The local user's answer to a confirmation request.
    Confirmed(Value),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ChannelOpened { .. } => "channel_opened",
            Self::Message(_) => "message",
            Self::Confirmed(_) => "confirmed",
        }
    }
}

/// Work a session step asks the driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the session's channel.
    OpenChannel,
    /// Encode and send a message to the peer.
    Send(Value),
    /// Ask the local application to confirm the request.
    RequestConfirmation(Value),
    /// Commit the handshake outcome. Carries the module's self-facing output.
    Complete(Value),
    /// Deliver a negotiated session key.
    SessionKey(Vec<u8>),
    /// Fan out a trust store change.
    Trust(TrustEvent),
    /// Tell the transport the handshake succeeded.
    NotifyPeerResult,
    /// Report success to the local application. Ends the session.
    Finish(Value),
}

/// Result of driving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session is waiting for more input.
    Continue,
    /// The session finished and was destroyed.
    Finish,
    /// The session failed; the caller and peer were already notified and the
    /// session was destroyed.
    ErrorHandled,
}

/// Concrete session variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    ClientAuth,
    ServerAuth,
    ClientBind,
    ServerBind,
    ClientKeyAgree,
    ServerKeyAgree,
}

impl SessionKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::ClientAuth => "client_auth",
            Self::ServerAuth => "server_auth",
            Self::ClientBind => "client_bind",
            Self::ServerBind => "server_bind",
            Self::ClientKeyAgree => "client_key_agree",
            Self::ServerKeyAgree => "server_key_agree",
        }
    }

    pub fn is_client(self) -> bool {
        matches!(
            self,
            Self::ClientAuth | Self::ClientBind | Self::ClientKeyAgree
        )
    }
}
