//! Error types for the inference runtime.
//!
//! Each failure class of the runtime has its own type so callers can decide
//! per class whether to retry, skip, degrade or surface the error.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::plugin::ModelKey;
use crate::resources::DevicePreference;

/// A candidate plugin directory that could not be turned into a descriptor.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("malformed plugin at {path}: {reason}")]
    MalformedPlugin { path: PathBuf, reason: String },

    #[error("models root {path} is not readable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DiscoveryError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedPlugin {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// No device can satisfy an allocation request.
#[derive(Debug, Clone, Error)]
#[error("no device matching {preference} has {requested_mb} MiB free (largest free block: {largest_free_mb} MiB)")]
pub struct ResourceExhausted {
    pub preference: DevicePreference,
    pub requested_mb: u64,
    pub largest_free_mb: u64,
}

/// Errors raised by plugin code.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("weights not found at {0}")]
    WeightsNotFound(PathBuf),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Coarse classification of a [`LoadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    WeightsMissing,
    AllocationDenied,
    PluginException,
    ShuttingDown,
}

/// Turning a descriptor into a live instance failed. Any allocation granted
/// before the failure has already been released.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("weights for {key} missing at {path}")]
    WeightsMissing { key: ModelKey, path: PathBuf },

    #[error("allocation denied for {key}: {source}")]
    AllocationDenied {
        key: ModelKey,
        #[source]
        source: ResourceExhausted,
    },

    #[error("plugin for {key} failed to load: {reason}")]
    PluginException { key: ModelKey, reason: String },

    #[error("{key} loaded after shutdown began and was discarded")]
    ShuttingDown { key: ModelKey },
}

impl LoadError {
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            LoadError::WeightsMissing { .. } => LoadErrorKind::WeightsMissing,
            LoadError::AllocationDenied { .. } => LoadErrorKind::AllocationDenied,
            LoadError::PluginException { .. } => LoadErrorKind::PluginException,
            LoadError::ShuttingDown { .. } => LoadErrorKind::ShuttingDown,
        }
    }

    pub fn key(&self) -> &ModelKey {
        match self {
            LoadError::WeightsMissing { key, .. }
            | LoadError::AllocationDenied { key, .. }
            | LoadError::PluginException { key, .. }
            | LoadError::ShuttingDown { key } => key,
        }
    }
}

/// Registry lookups.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("model {model_id} (version {}) is not loaded", .version.as_deref().unwrap_or("default"))]
    NotFound {
        model_id: String,
        version: Option<String>,
    },

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("registry is closed")]
    Closed,
}

/// Request rejected before the model was touched.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid metadata: {0}")]
    Metadata(#[from] validator::ValidationErrors),

    #[error("invalid frame: {0}")]
    Frame(String),
}

/// The breaker for a model is open; no inference was attempted.
#[derive(Debug, Clone, Error)]
#[error("circuit open for {key}")]
pub struct CircuitOpenError {
    pub key: ModelKey,
    pub retry_after: Option<DateTime<Utc>>,
}

/// Plugin-side inference failure. Never escapes the dispatcher; it is turned
/// into a degraded result.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{stage} failed: {source}")]
    Plugin {
        stage: &'static str,
        #[source]
        source: PluginError,
    },

    #[error("plugin panicked: {0}")]
    Panicked(String),

    #[error("malformed plugin output: {0}")]
    MalformedOutput(String),
}

/// Client-visible failures of [`crate::dispatcher::InferenceDispatcher::infer`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    NotFound(#[from] RegistryError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
}

/// Admin operations on [`crate::shared_state::RuntimeState`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{model_id}@{version} was not discovered under the models root")]
    NotDiscovered { model_id: String, version: String },

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("runtime is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ModelKey {
        ModelKey::new("fall_detection", semver::Version::new(1, 0, 0))
    }

    #[test]
    fn test_load_error_kind() {
        let err = LoadError::WeightsMissing {
            key: key(),
            path: PathBuf::from("/models/fall_detection/1.0.0/weights"),
        };
        assert_eq!(err.kind(), LoadErrorKind::WeightsMissing);
        assert_eq!(err.key(), &key());
    }

    #[test]
    fn test_not_found_message_without_version() {
        let err = RegistryError::NotFound {
            model_id: "fall_detection".to_string(),
            version: None,
        };
        assert_eq!(err.to_string(), "model fall_detection (version default) is not loaded");
    }

    #[test]
    fn test_runtime_error_wraps_load_error() {
        let err: RuntimeError = LoadError::PluginException {
            key: key(),
            reason: "boom".into(),
        }
        .into();
        assert!(matches!(err, RuntimeError::Load(_)));
        assert_eq!(err.to_string(), "plugin for fall_detection@1.0.0 failed to load: boom");
    }

    #[test]
    fn test_dispatch_error_is_transparent() {
        let err: DispatchError = CircuitOpenError { key: key(), retry_after: None }.into();
        assert_eq!(err.to_string(), "circuit open for fall_detection@1.0.0");
    }
}
