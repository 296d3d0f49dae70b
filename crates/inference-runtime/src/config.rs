// inference-runtime/src/config.rs

use anyhow::{Context, Result};
use semver::Version;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::circuit_breaker::BreakerConfig;
use crate::health_reporter::ReporterConfig;
use crate::plugin::PluginDescriptor;
use crate::resources::{self, DeviceId, DeviceSpec};

/// GPU inventory source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuDevices {
    /// Ask NVML.
    Auto,
    /// CPU only.
    None,
    Explicit(Vec<DeviceSpec>),
}

/// `model_id` or `model_id@version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelector {
    pub model_id: String,
    pub version: Option<Version>,
}

impl ModelSelector {
    pub fn matches(&self, descriptor: &PluginDescriptor) -> bool {
        self.model_id == descriptor.model_id
            && self.version.as_ref().map_or(true, |v| *v == descriptor.version)
    }
}

impl FromStr for ModelSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('@') {
            Some((id, version)) => Ok(Self {
                model_id: id.to_string(),
                version: Some(
                    Version::parse(version)
                        .with_context(|| format!("invalid version in selector '{}'", s))?,
                ),
            }),
            None => Ok(Self {
                model_id: s.to_string(),
                version: None,
            }),
        }
    }
}

/// Which discovered models are loaded at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Autoload {
    All,
    None,
    Only(Vec<ModelSelector>),
}

impl Autoload {
    pub fn includes(&self, descriptor: &PluginDescriptor) -> bool {
        match self {
            Autoload::All => true,
            Autoload::None => false,
            Autoload::Only(selectors) => selectors.iter().any(|s| s.matches(descriptor)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub models_root: PathBuf,
    pub runtime_id: String,
    pub backend_url: Option<String>,
    pub api_host: String,
    pub api_port: u16,
    pub gpu_devices: GpuDevices,
    /// `None` sizes the CPU pool from available RAM.
    pub cpu_memory_mb: Option<u64>,
    pub breaker: BreakerConfig,
    /// `None` keeps breaker state in memory only.
    pub breaker_db_path: Option<PathBuf>,
    pub health_interval_seconds: u64,
    pub reporter_max_attempts: u32,
    pub reporter_initial_backoff_ms: u64,
    pub reporter_max_backoff_ms: u64,
    pub inference_timeout_ms: u64,
    pub max_concurrent_inferences: usize,
    pub idle_after_seconds: u64,
    pub camera_idle_seconds: u64,
    pub autoload: Autoload,
    pub required_models: Vec<String>,
    pub default_versions: HashMap<String, Version>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_root: PathBuf::from("./models"),
            runtime_id: default_runtime_id(),
            backend_url: None,
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            gpu_devices: GpuDevices::Auto,
            cpu_memory_mb: None,
            breaker: BreakerConfig::default(),
            breaker_db_path: Some(PathBuf::from("./data/breakers.db")),
            health_interval_seconds: 30,
            reporter_max_attempts: 5,
            reporter_initial_backoff_ms: 500,
            reporter_max_backoff_ms: 30_000,
            inference_timeout_ms: 5_000,
            max_concurrent_inferences: Self::auto_detect_concurrency(),
            idle_after_seconds: 300,
            camera_idle_seconds: 120,
            autoload: Autoload::All,
            required_models: Vec::new(),
            default_versions: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let gpu_devices = parse_gpu_devices(&env_or("GPU_DEVICES", "auto"))?;

        let cpu_memory_mb = match env_or("CPU_MEMORY_MB", "auto").as_str() {
            "auto" => None,
            value => Some(parse_value::<u64>("CPU_MEMORY_MB", value)?),
        };

        let max_concurrent_inferences = match env_or("MAX_CONCURRENT_INFERENCES", "auto").as_str() {
            "auto" => Self::auto_detect_concurrency(),
            value => parse_value::<usize>("MAX_CONCURRENT_INFERENCES", value)?.max(1),
        };

        let breaker = BreakerConfig {
            failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", "5")?,
            window: Duration::from_secs(env_parse("BREAKER_WINDOW_SECONDS", "60")?),
            cooldown: Duration::from_secs(env_parse("BREAKER_COOLDOWN_SECONDS", "30")?),
            max_cooldown: Duration::from_secs(env_parse("BREAKER_MAX_COOLDOWN_SECONDS", "600")?),
            half_open_trials: env_parse("BREAKER_HALF_OPEN_TRIALS", "1")?,
        };

        let breaker_db_path = match env::var("BREAKER_DB_PATH") {
            Ok(path) if path.trim().is_empty() => None,
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => defaults.breaker_db_path.clone(),
        };

        let backend_url = env::var("BACKEND_URL")
            .ok()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let config = Self {
            models_root: PathBuf::from(env_or("MODELS_ROOT", "./models")),
            runtime_id: env::var("RUNTIME_ID").unwrap_or(defaults.runtime_id),
            backend_url,
            api_host: env_or("API_HOST", "127.0.0.1"),
            api_port: env_parse("API_PORT", "8000")?,
            gpu_devices,
            cpu_memory_mb,
            breaker,
            breaker_db_path,
            health_interval_seconds: env_parse("HEALTH_INTERVAL_SECONDS", "30")?,
            reporter_max_attempts: env_parse("REPORTER_MAX_ATTEMPTS", "5")?,
            reporter_initial_backoff_ms: env_parse("REPORTER_INITIAL_BACKOFF_MS", "500")?,
            reporter_max_backoff_ms: env_parse("REPORTER_MAX_BACKOFF_MS", "30000")?,
            inference_timeout_ms: env_parse("INFERENCE_TIMEOUT_MS", "5000")?,
            max_concurrent_inferences,
            idle_after_seconds: env_parse("IDLE_AFTER_SECONDS", "300")?,
            camera_idle_seconds: env_parse("CAMERA_IDLE_SECONDS", "120")?,
            autoload: parse_autoload(&env_or("AUTOLOAD", "all"))?,
            required_models: parse_list(&env_or("REQUIRED_MODELS", "")),
            default_versions: parse_default_versions(&env_or("DEFAULT_VERSIONS", ""))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would leave the runtime unable to serve.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(anyhow::anyhow!("BREAKER_FAILURE_THRESHOLD must be at least 1"));
        }
        if self.breaker.half_open_trials == 0 {
            return Err(anyhow::anyhow!("BREAKER_HALF_OPEN_TRIALS must be at least 1"));
        }
        if self.breaker.max_cooldown < self.breaker.cooldown {
            return Err(anyhow::anyhow!(
                "BREAKER_MAX_COOLDOWN_SECONDS ({:?}) is shorter than BREAKER_COOLDOWN_SECONDS ({:?})",
                self.breaker.max_cooldown,
                self.breaker.cooldown
            ));
        }
        if self.inference_timeout_ms == 0 {
            return Err(anyhow::anyhow!("INFERENCE_TIMEOUT_MS must be positive"));
        }
        Ok(())
    }

    fn auto_detect_concurrency() -> usize {
        let num_cpus = num_cpus::get();
        let concurrency = (num_cpus * 2).clamp(2, 64);
        info!("Auto‑detected CPU cores: {} (inference concurrency {})", num_cpus, concurrency);
        concurrency
    }

    /// Full device inventory: configured or detected GPUs plus the CPU pool.
    pub fn device_inventory(&self) -> Vec<DeviceSpec> {
        let mut devices = match &self.gpu_devices {
            GpuDevices::Auto => resources::detect_gpus(),
            GpuDevices::None => Vec::new(),
            GpuDevices::Explicit(specs) => specs.clone(),
        };
        let cpu_mb = self
            .cpu_memory_mb
            .unwrap_or_else(resources::detect_cpu_memory_mb);
        devices.push(DeviceSpec {
            id: DeviceId::Cpu,
            total_mb: cpu_mb,
        });
        devices
    }

    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            interval: Duration::from_secs(self.health_interval_seconds.max(1)),
            max_attempts: self.reporter_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.reporter_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reporter_max_backoff_ms),
        }
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Runtime ID: {}", self.runtime_id);
        info!("- Models Root: {}", self.models_root.display());
        info!("- GPU Devices: {:?}", self.gpu_devices);
        info!("- CPU Memory: {}", self.cpu_memory_mb.map(|mb| format!("{} MiB", mb)).unwrap_or_else(|| "auto".into()));
        info!("- Breaker: {:?}", self.breaker);
        info!("- Breaker Store: {}", self.breaker_db_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "in-memory".into()));
        info!("- Inference Timeout: {}ms", self.inference_timeout_ms);
        info!("- Max Concurrent Inferences: {}", self.max_concurrent_inferences);
        info!("- Autoload: {:?}", self.autoload);
        info!("- Required Models: {:?}", self.required_models);
        info!("- Default Versions: {:?}", self.default_versions);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Backend URL: {}", self.backend_url.as_deref().unwrap_or("(reporting disabled)"));
        info!("- Health Interval: {}s", self.health_interval_seconds);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn default_runtime_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("runtime-{}", &id[..8])
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, value, e))
}

fn env_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_value(key, &env_or(key, default))
}

/// `auto`, `none`, or `index:MiB[,index:MiB...]`.
pub fn parse_gpu_devices(value: &str) -> Result<GpuDevices> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(GpuDevices::Auto),
        "none" | "" => Ok(GpuDevices::None),
        list => {
            let mut specs = Vec::new();
            for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let (index, mb) = item
                    .split_once(':')
                    .with_context(|| format!("GPU device '{}' must be index:MiB", item))?;
                specs.push(DeviceSpec {
                    id: DeviceId::Gpu(parse_value("GPU_DEVICES index", index)?),
                    total_mb: parse_value("GPU_DEVICES capacity", mb)?,
                });
            }
            Ok(GpuDevices::Explicit(specs))
        }
    }
}

pub fn parse_autoload(value: &str) -> Result<Autoload> {
    match value.trim().to_ascii_lowercase().as_str() {
        "all" | "" => Ok(Autoload::All),
        "none" => Ok(Autoload::None),
        _ => Ok(Autoload::Only(
            parse_list(value)
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<_>>>()?,
        )),
    }
}

/// `model_id=version[,model_id=version...]`.
pub fn parse_default_versions(value: &str) -> Result<HashMap<String, Version>> {
    let mut defaults = HashMap::new();
    for item in parse_list(value) {
        let (id, version) = item
            .split_once('=')
            .with_context(|| format!("default version '{}' must be model_id=version", item))?;
        let version = Version::parse(version.trim())
            .with_context(|| format!("invalid default version for {}", id))?;
        defaults.insert(id.trim().to_string(), version);
    }
    Ok(defaults)
}

pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
