use bindery_db::PoolError;
use bindery_groups::GroupError;
use bindery_modules::ModuleError;
use bindery_session::SessionError;
use bindery_types::ErrorCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned synchronously by service entry points.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    /// The worker queue is full.
    #[error("the service is busy")]
    Busy,
    #[error("the service has shut down")]
    ShutDown,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParams(_) | Self::Config(_) => ErrorCode::InvalidInput,
            Self::Busy | Self::ShutDown => ErrorCode::Busy,
            Self::Pool(_) => ErrorCode::StorageFailure,
            Self::Module(e) => e.code(),
            Self::Group(e) => e.code(),
            Self::Session(e) => e.code(),
        }
    }
}

/// Parses a JSON parameter document. It must be an object.
pub(crate) fn parse_params(params: &str) -> Result<serde_json::Value, ServiceError> {
    let value: serde_json::Value = serde_json::from_str(params)
        .map_err(|e| ServiceError::InvalidParams(format!("params are not JSON: {e}")))?;
    if !value.is_object() {
        return Err(ServiceError::InvalidParams("params must be a JSON object".into()));
    }
    Ok(value)
}
