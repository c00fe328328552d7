use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::version::ProtocolVersion;
use crate::{AuthModule, IdentityParams, ModuleError, ModuleType, TaskId, TaskOutput};

/// Registry of authenticator modules keyed by [`ModuleType`].
///
/// Modules are registered at startup. Lookups clone the module handle out of
/// the lock, so no module call ever runs while the registry is locked.
pub struct ModuleDispatcher {
    modules: RwLock<HashMap<ModuleType, Arc<dyn AuthModule>>>,
    version: ProtocolVersion,
}

impl Default for ModuleDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDispatcher {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            version: ProtocolVersion::LOCAL,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Registers a module under its own type.
    pub fn register(&self, module: Arc<dyn AuthModule>) -> Result<(), ModuleError> {
        let module_type = module.module_type();
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        if modules.contains_key(&module_type) {
            return Err(ModuleError::AlreadyRegistered(module_type));
        }
        modules.insert(module_type, module);
        tracing::info!(module = %module_type, "authenticator module registered");
        Ok(())
    }

    /// Drops every registered module. Used at service teardown.
    pub fn clear(&self) {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_registered(&self, module_type: ModuleType) -> bool {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&module_type)
    }

    fn module(&self, module_type: ModuleType) -> Result<Arc<dyn AuthModule>, ModuleError> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&module_type)
            .cloned()
            .ok_or(ModuleError::NotFound(module_type))
    }

    pub fn check_repeatable(
        &self,
        message: &Value,
        module_type: ModuleType,
    ) -> Result<(), ModuleError> {
        self.module(module_type)?.check_repeatable(message)
    }

    /// Fails if the sender of `message` speaks an incompatible version.
    pub fn check_peer_version(&self, message: &Value) -> Result<(), ModuleError> {
        self.version.check_peer(message)
    }

    pub fn create_task(&self, params: &Value, module_type: ModuleType) -> Result<TaskId, ModuleError> {
        if !params.is_object() {
            return Err(ModuleError::InvalidParams(
                "task parameters must be an object".into(),
            ));
        }
        let task_id = self.module(module_type)?.create_task(params)?;
        tracing::debug!(module = %module_type, task_id, "task created");
        Ok(task_id)
    }

    /// Advances a task and stamps the version marker on its output.
    pub fn process_task(
        &self,
        task_id: TaskId,
        input: &Value,
        module_type: ModuleType,
    ) -> Result<TaskOutput, ModuleError> {
        let mut output = self.module(module_type)?.process_task(task_id, input)?;
        self.version.stamp(&mut output.out);
        Ok(output)
    }

    pub fn destroy_task(&self, task_id: TaskId, module_type: ModuleType) {
        match self.module(module_type) {
            Ok(module) => module.destroy_task(task_id),
            Err(e) => tracing::warn!(task_id, error = %e, "cannot destroy task"),
        }
    }

    pub fn register_local_identity(
        &self,
        params: &IdentityParams,
        module_type: ModuleType,
    ) -> Result<(), ModuleError> {
        let alias = params.validate()?;
        self.module(module_type)?.register_local_identity(&alias)
    }

    pub fn unregister_local_identity(
        &self,
        params: &IdentityParams,
        module_type: ModuleType,
    ) -> Result<(), ModuleError> {
        let alias = params.validate()?;
        self.module(module_type)?.unregister_local_identity(&alias)
    }

    pub fn delete_peer_identity(
        &self,
        params: &IdentityParams,
        module_type: ModuleType,
    ) -> Result<(), ModuleError> {
        let alias = params.validate()?;
        self.module(module_type)?.delete_peer_identity(&alias)
    }

    pub fn export_public_key(
        &self,
        params: &IdentityParams,
        module_type: ModuleType,
    ) -> Result<Vec<u8>, ModuleError> {
        let alias = params.validate()?;
        self.module(module_type)?.export_public_key(&alias)
    }
}
