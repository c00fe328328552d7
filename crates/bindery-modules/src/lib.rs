//! Authenticator module dispatch for bindery.
//!
//! Cryptographic handshake logic lives in pluggable [`AuthModule`]s, one per
//! [`ModuleType`]. Sessions never call a module directly; they go through
//! the [`ModuleDispatcher`], which validates inputs, routes each call to the
//! registered module, and stamps the protocol [`version::ProtocolVersion`]
//! marker on successful task output so peers can agree on message shapes.
//!
//! A task is opaque to everything outside its module. Callers see only a
//! [`TaskId`] and the [`TaskStatus`] each step reports.
//!
//! [`reference::ReferenceModule`] is a non-cryptographic module used by the
//! daemon's demo mode and by tests. It binds the handshake to a shared secret
//! through SHA-256 transcripts but offers no real security.

mod dispatcher;
pub mod reference;
mod types;
pub mod version;

#[cfg(test)]
mod tests;

use serde_json::Value;

pub use dispatcher::ModuleDispatcher;
pub use types::*;

/// A pluggable authenticator.
///
/// Implementations are shared across threads. Task state is owned by the
/// module and addressed by the id returned from [`AuthModule::create_task`].
pub trait AuthModule: Send + Sync {
    fn module_type(&self) -> ModuleType;

    /// Fails with [`ModuleError::Duplicate`] if `message` is an opening
    /// message this module already consumed.
    fn check_repeatable(&self, message: &Value) -> Result<(), ModuleError>;

    /// Creates a task from session-supplied parameters.
    fn create_task(&self, params: &Value) -> Result<TaskId, ModuleError>;

    /// Feeds one input to a task. The first call for a client task takes
    /// `Value::Null` and produces the opening payload.
    fn process_task(&self, task_id: TaskId, input: &Value) -> Result<TaskOutput, ModuleError>;

    /// Releases a task. Unknown ids are ignored.
    fn destroy_task(&self, task_id: TaskId);

    // Modules without key storage keep the defaults below, which report the
    // operation as unsupported.

    /// Generates and stores the local identity key for `alias`.
    fn register_local_identity(&self, _alias: &str) -> Result<(), ModuleError> {
        Err(unsupported(self.module_type(), "register_local_identity"))
    }

    fn unregister_local_identity(&self, _alias: &str) -> Result<(), ModuleError> {
        Err(unsupported(self.module_type(), "unregister_local_identity"))
    }

    /// Deletes key material learned from a peer.
    fn delete_peer_identity(&self, _alias: &str) -> Result<(), ModuleError> {
        Err(unsupported(self.module_type(), "delete_peer_identity"))
    }

    fn export_public_key(&self, _alias: &str) -> Result<Vec<u8>, ModuleError> {
        Err(unsupported(self.module_type(), "export_public_key"))
    }
}

fn unsupported(module: ModuleType, operation: &'static str) -> ModuleError {
    ModuleError::Unsupported { module, operation }
}
