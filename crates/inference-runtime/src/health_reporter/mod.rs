//! Health and capability reporting to the backend registry.

pub mod backend_client;
pub mod reporter;

pub use backend_client::{
    BackendRegistry, HealthSnapshot, HttpBackendClient, ModelCapability, Readiness,
};
pub use reporter::{backoff_delay, HealthReporter, HealthSource, ReporterConfig};
