//! Static metadata describing one model/version on disk.

use std::fmt;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::resources::DevicePreference;

/// Name of the optional manifest inside a version directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Default weights location relative to the version directory.
pub const DEFAULT_WEIGHTS: &str = "weights";

/// Registry key: stable model id plus semantic version.
///
/// Ordering is model id first, then semantic version ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub model_id: String,
    pub version: Version,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, version: Version) -> Self {
        Self {
            model_id: model_id.into(),
            version,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_id, self.version)
    }
}

/// Resolved paths of the four stage entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints {
    pub loader: PathBuf,
    pub preprocess: PathBuf,
    pub inference: PathBuf,
    pub postprocess: PathBuf,
}

impl EntryPoints {
    /// File stems every plugin directory must provide.
    pub const REQUIRED: [&'static str; 4] = ["loader", "preprocess", "inference", "postprocess"];
}

/// Declared resource needs of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub device: DevicePreference,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            memory_mb: 0,
            device: DevicePreference::Any,
        }
    }
}

/// Optional `plugin.json` manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub plugin: Option<String>,
    pub weights: Option<PathBuf>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Everything known about one discovered model version. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub model_id: String,
    pub version: Version,
    pub root: PathBuf,
    pub entry_points: EntryPoints,
    pub weights_path: PathBuf,
    pub requirements: ResourceRequirements,
    /// Name of the implementation in the plugin catalog.
    pub plugin: String,
    pub event_types: Vec<String>,
    pub description: Option<String>,
    pub params: serde_json::Value,
}

impl PluginDescriptor {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.model_id.clone(), self.version.clone())
    }

    /// Build a descriptor from a version directory, its entry points and an
    /// optional manifest.
    pub fn from_parts(
        model_id: &str,
        version: Version,
        root: &Path,
        entry_points: EntryPoints,
        manifest: PluginManifest,
    ) -> Self {
        let weights_path = match manifest.weights {
            Some(p) if p.is_absolute() => p,
            Some(p) => root.join(p),
            None => root.join(DEFAULT_WEIGHTS),
        };

        Self {
            model_id: model_id.to_string(),
            version,
            root: root.to_path_buf(),
            entry_points,
            weights_path,
            requirements: manifest.resources,
            plugin: manifest.plugin.unwrap_or_else(|| model_id.to_string()),
            event_types: manifest.event_types,
            description: manifest.description,
            params: manifest.params,
        }
    }
}

/// Model ids are stable machine names.
pub fn is_valid_model_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_key_orders_by_semver() {
        let a = ModelKey::new("fall_detection", Version::parse("1.2.0").unwrap());
        let b = ModelKey::new("fall_detection", Version::parse("1.10.0").unwrap());
        let c = ModelKey::new("zone_intrusion", Version::parse("0.1.0").unwrap());
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.to_string(), "fall_detection@1.10.0");
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: PluginManifest = serde_json::from_str("{}").unwrap();
        assert!(manifest.plugin.is_none());
        assert_eq!(manifest.resources.memory_mb, 0);
        assert_eq!(manifest.resources.device, DevicePreference::Any);
    }

    #[test]
    fn test_manifest_rejects_unknown_fields() {
        let parsed = serde_json::from_str::<PluginManifest>(r#"{"plugn": "typo"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_weights_path_resolution() {
        let root = Path::new("/models/fall_detection/1.0.0");
        let entry_points = EntryPoints {
            loader: root.join("loader.py"),
            preprocess: root.join("preprocess.py"),
            inference: root.join("inference.py"),
            postprocess: root.join("postprocess.py"),
        };
        let manifest = PluginManifest {
            weights: Some(PathBuf::from("weights/best.onnx")),
            ..Default::default()
        };
        let d = PluginDescriptor::from_parts(
            "fall_detection",
            Version::new(1, 0, 0),
            root,
            entry_points,
            manifest,
        );
        assert_eq!(d.weights_path, root.join("weights/best.onnx"));
        assert_eq!(d.plugin, "fall_detection");
    }

    #[test]
    fn test_model_id_validation() {
        assert!(is_valid_model_id("fall_detection"));
        assert!(is_valid_model_id("ppe-v2"));
        assert!(!is_valid_model_id("Fall Detection"));
        assert!(!is_valid_model_id(""));
        assert!(!is_valid_model_id("../etc"));
    }
}
