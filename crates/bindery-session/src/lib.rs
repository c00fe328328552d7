//! Session layer for bindery.
//!
//! A session is one authentication handshake between this device and a
//! peer, keyed by the application's request id. Three variants exist (bind,
//! auth, key agreement), each with a client side that starts the exchange
//! and a server side created by the peer's opening message.
//!
//! Sessions never perform I/O themselves. Each step returns [`Effect`]s that
//! the [`SessionRegistry`] carries out: channel sends, confirmation requests,
//! trust store commits, and caller notifications. The registry is owned by a
//! single worker, which is what serializes every session operation.

mod auth;
mod bind;
mod effect;
mod envelope;
mod error;
mod key_agree;
pub mod message;
mod registry;
mod session;

use std::sync::Arc;

use bindery_channels::ChannelManager;
use bindery_groups::GroupManager;
use bindery_modules::ModuleDispatcher;
use bindery_types::{DataChangeListener, LocalDevice};

pub use effect::{Effect, SessionEvent, SessionKind, SessionStatus};
pub use envelope::is_lite_message;
pub use error::SessionError;
pub use registry::{InboundChannel, SessionOrigin, SessionRegistry};
pub use session::{Session, SessionState};

/// Shared services a session needs while it runs.
#[derive(Clone)]
pub struct SessionContext {
    pub modules: Arc<ModuleDispatcher>,
    pub channels: Arc<ChannelManager>,
    pub groups: Arc<GroupManager>,
    /// Receives trust store changes as sessions commit them.
    pub listener: Arc<dyn DataChangeListener>,
}

impl SessionContext {
    pub fn local(&self) -> &LocalDevice {
        self.groups.local_device()
    }
}
