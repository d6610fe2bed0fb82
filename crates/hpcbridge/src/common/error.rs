use thiserror::Error;

use crate::common::error::HpcError::GenericError;
use crate::recovery::RecoveryError;
use crate::remote::RemoteError;
use crate::scheduler::BackendError;
use crate::staging::StagingError;

#[derive(Debug, Error)]
pub enum HpcError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    RemoteError(#[from] RemoteError),
    #[error(transparent)]
    BackendError(#[from] BackendError),
    #[error(transparent)]
    StagingError(#[from] StagingError),
    #[error(transparent)]
    RecoveryError(#[from] RecoveryError),
    #[error("Resource `{resource}`: {message}")]
    PluginCapabilityMissing { resource: String, message: String },
    #[error("Invalid job definition: {0}")]
    InvalidJobDefinition(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl HpcError {
    /// Errors that must terminate the whole run instead of a single job.
    pub fn is_fatal(&self) -> bool {
        match self {
            HpcError::PluginCapabilityMissing { .. } | HpcError::RecoveryError(_) => true,
            HpcError::BackendError(error) => error.is_capability_missing(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for HpcError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<toml::de::Error> for HpcError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<String> for HpcError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
