// inference-runtime/src/lib.rs

pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health_reporter;
pub mod metrics;
pub mod model_runtime;
pub mod plugin;
pub mod resources;
pub mod shared_state;
pub mod telemetry;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

// Public API exports
pub use circuit_breaker::{BreakerConfig, BreakerRegistry, BreakerState};
pub use config::Config;
pub use dispatcher::{DetectionResult, InferenceDispatcher, InferenceMetadata, ResultStatus};
pub use error::{
    CircuitOpenError, DiscoveryError, DispatchError, InferenceError, LoadError, PluginError, RegistryError,
    ResourceExhausted, RuntimeError, ValidationError,
};
pub use health_reporter::{BackendRegistry, HealthReporter, HttpBackendClient};
pub use model_runtime::{ModelDiscovery, ModelLoader, ModelRegistry, ModelStatus};
pub use plugin::{Frame, ModelHandle, ModelPlugin, PluginCatalog, PluginDescriptor};
pub use resources::ResourceManager;
pub use shared_state::RuntimeState;

#[cfg(feature = "cli")]
pub use server::run_server;
