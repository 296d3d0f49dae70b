//! Model lifecycle: discovery on disk, loading onto devices, and the
//! registry that shares live instances between concurrent inferences.
//!
//! Write path: [`ModelDiscovery`] -> [`ModelLoader`] -> [`ModelRegistry`].
//! Read path: the dispatcher leases instances from the registry.

pub mod discovery;
pub mod fair_lock;
pub mod instance;
pub mod loader;
pub mod registry;

pub use discovery::{DiscoveryReport, ModelDiscovery, RejectedCandidate};
pub use fair_lock::{FairReadGuard, FairRwLock, FairWriteGuard};
pub use instance::{HealthStatus, ModelInstance, ModelStatus, ModelStatusReport, PluginWork};
pub use loader::ModelLoader;
pub use registry::{ModelLease, ModelRegistry, RegisterOutcome};
