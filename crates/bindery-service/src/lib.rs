//! Device group trust service.
//!
//! [`DeviceAuthService`] ties the trust store, the group operation layer,
//! the channel manager, the authenticator modules, and the session registry
//! together. All session state lives on a single worker (see [`worker`]);
//! the public entry points in [`api`] only validate input and enqueue work.

pub mod api;
pub mod config;
pub mod error;
pub mod router;
mod worker;

use std::sync::{Arc, Mutex};

use bindery_channels::{ChannelManager, ChannelProvider};
use bindery_db::{SqliteTrustStore, TrustStore};
use bindery_groups::GroupManager;
use bindery_modules::reference::ReferenceModule;
use bindery_modules::{AuthModule, ModuleDispatcher, ModuleType};
use bindery_session::{SessionContext, SessionRegistry};
use bindery_types::{
    DataChangeListener, DeviceAuthCallback, Limits, LocalDevice, OsAccountId,
};
use tokio::task::JoinHandle;

pub use config::{load_config, Config, ConfigError};
pub use error::ServiceError;
pub use router::{CallbackRouter, ListenerRouter};

use worker::{Worker, WorkerHandle};

/// Everything needed to start a service besides configuration files.
pub struct ServiceOptions {
    pub store: Arc<dyn TrustStore>,
    pub local: LocalDevice,
    pub limits: Limits,
    /// Capacity of the worker queue.
    pub queue_capacity: usize,
    /// Backs the proximity-network channel kind when set.
    pub channel_provider: Option<Arc<dyn ChannelProvider>>,
    /// Account used for inbound data, which names none.
    pub default_os: OsAccountId,
}

impl ServiceOptions {
    pub fn new(store: Arc<dyn TrustStore>, local: LocalDevice) -> Self {
        let defaults = config::ServiceConfig::default();
        Self {
            store,
            local,
            limits: defaults.limits(),
            queue_capacity: defaults.queue_capacity,
            channel_provider: None,
            default_os: defaults.default_os_account,
        }
    }
}

/// A running device trust service.
pub struct DeviceAuthService {
    worker: WorkerHandle,
    worker_task: Mutex<Option<JoinHandle<()>>>,
    modules: Arc<ModuleDispatcher>,
    channels: Arc<ChannelManager>,
    groups: Arc<GroupManager>,
    callbacks: Arc<CallbackRouter>,
    listeners: Arc<ListenerRouter>,
    default_os: OsAccountId,
}

impl DeviceAuthService {
    /// Starts a service with no authenticator modules registered.
    ///
    /// Spawns the session worker, so this must run inside a tokio runtime.
    pub fn start(options: ServiceOptions) -> Result<Self, ServiceError> {
        if options.queue_capacity == 0 {
            return Err(ServiceError::InvalidParams(
                "queue capacity must be positive".into(),
            ));
        }
        let modules = Arc::new(ModuleDispatcher::new());
        let channels = Arc::new(ChannelManager::new(options.channel_provider));
        let groups = Arc::new(GroupManager::new(
            options.store,
            Arc::clone(&modules),
            options.local,
            options.limits,
        ));
        let callbacks = Arc::new(CallbackRouter::default());
        let listeners = Arc::new(ListenerRouter::default());

        let registry = SessionRegistry::new(SessionContext {
            modules: Arc::clone(&modules),
            channels: Arc::clone(&channels),
            groups: Arc::clone(&groups),
            listener: Arc::clone(&listeners) as Arc<dyn DataChangeListener>,
        });
        let worker = Worker {
            registry,
            callbacks: Arc::clone(&callbacks),
            default_os: options.default_os,
        };
        let (handle, task) = WorkerHandle::spawn(worker, options.queue_capacity);

        tracing::info!(
            udid = %groups.local_device().udid,
            user_type = groups.local_device().user_type.label(),
            queue_capacity = options.queue_capacity,
            "device auth service started"
        );

        Ok(Self {
            worker: handle,
            worker_task: Mutex::new(Some(task)),
            modules,
            channels,
            groups,
            callbacks,
            listeners,
            default_os: options.default_os,
        })
    }

    /// Opens the configured trust store and starts the service.
    pub fn open(config: &Config) -> Result<Self, ServiceError> {
        let store = SqliteTrustStore::open(&config.database.path, config.database.runtime_settings())?;
        tracing::info!(path = %config.database.path, "trust store opened");

        let mut options = ServiceOptions::new(Arc::new(store), config.device.local_device());
        options.limits = config.service.limits();
        options.queue_capacity = config.service.queue_capacity;
        options.default_os = config.service.default_os_account;

        let service = Self::start(options)?;
        if config.modules.enable_reference {
            for module_type in [ModuleType::Identity, ModuleType::Credential] {
                service.register_module(Arc::new(ReferenceModule::new(module_type)))?;
            }
        }
        Ok(service)
    }

    /// Registers an authenticator module. One per module type.
    pub fn register_module(&self, module: Arc<dyn AuthModule>) -> Result<(), ServiceError> {
        Ok(self.modules.register(module)?)
    }

    pub fn modules(&self) -> &Arc<ModuleDispatcher> {
        &self.modules
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    pub fn local_device(&self) -> &LocalDevice {
        self.groups.local_device()
    }

    /// Registers or replaces the callback that follows `app_id`'s requests.
    pub fn register_callback(
        &self,
        app_id: &str,
        callback: Arc<dyn DeviceAuthCallback>,
    ) -> Result<(), ServiceError> {
        self.callbacks.register(app_id, callback)
    }

    pub fn unregister_callback(&self, app_id: &str) {
        self.callbacks.unregister(app_id);
    }

    pub fn register_data_change_listener(
        &self,
        app_id: &str,
        listener: Arc<dyn DataChangeListener>,
    ) -> Result<(), ServiceError> {
        self.listeners.register(app_id, listener)
    }

    pub fn unregister_data_change_listener(&self, app_id: &str) {
        self.listeners.unregister(app_id);
    }

    fn os_account(&self, os: OsAccountId) -> OsAccountId {
        if os < 0 {
            self.default_os
        } else {
            os
        }
    }

    /// Stops the worker, destroying every live session. Requests queued
    /// before the call still run. Idempotent.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
        let task = self
            .worker_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "session worker join failed");
            }
        }
        self.modules.clear();
        tracing::info!("device auth service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bindery_db::MemoryTrustStore;
    use bindery_types::DeviceType;

    fn options() -> ServiceOptions {
        ServiceOptions::new(
            Arc::new(MemoryTrustStore::new()),
            LocalDevice::new("UDID-S", DeviceType::Controller),
        )
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let mut opts = options();
        opts.queue_capacity = 0;
        assert!(matches!(
            DeviceAuthService::start(opts),
            Err(ServiceError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn open_with_memory_database_registers_reference_modules() {
        let mut config = Config::default();
        config.database.path = bindery_db::MEMORY_PATH.to_string();
        config.device.udid = "UDID-CFG".to_string();

        let service = DeviceAuthService::open(&config).expect("open");
        assert_eq!(service.local_device().udid, "UDID-CFG");
        assert!(service.modules().is_registered(ModuleType::Identity));
        assert!(service.modules().is_registered(ModuleType::Credential));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_module_registration_fails() {
        let service = DeviceAuthService::start(options()).expect("start");
        service
            .register_module(Arc::new(ReferenceModule::new(ModuleType::Identity)))
            .expect("first");
        let err = service
            .register_module(Arc::new(ReferenceModule::new(ModuleType::Identity)))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Module(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_reports_busy() {
        let mut opts = options();
        opts.queue_capacity = 1;
        let service = DeviceAuthService::start(opts).expect("start");

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        service
            .worker
            .post(move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .expect("post blocker");
        started_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("worker picked up the blocker");
        service.worker.post(|_| {}).expect("fill the queue");

        let err = service.on_channel_closed(1).unwrap_err();
        assert!(matches!(err, ServiceError::Busy));
        assert_eq!(err.code(), bindery_types::ErrorCode::Busy);

        release_tx.send(()).expect("release");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn negative_account_means_default() {
        let service = DeviceAuthService::start(options()).expect("start");
        assert_eq!(service.os_account(-1), 100);
        assert_eq!(service.os_account(3), 3);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let service = DeviceAuthService::start(options()).expect("start");
        service.shutdown().await;
        service.shutdown().await;
    }
}
