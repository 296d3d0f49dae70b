//! Model Discovery
//!
//! Scans `<root>/<model_id>/<version>/` for plugin directories. Each version
//! directory must carry the four entry point files (matched by file stem,
//! any extension) and may carry a `plugin.json` manifest. Broken candidates
//! are skipped and reported; they never abort the scan.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::DiscoveryError;
use crate::plugin::descriptor::{is_valid_model_id, MANIFEST_FILE};
use crate::plugin::{EntryPoints, PluginDescriptor, PluginManifest};

/// A candidate directory that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedCandidate {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub descriptors: Vec<PluginDescriptor>,
    pub rejected: Vec<RejectedCandidate>,
}

#[derive(Debug, Clone)]
pub struct ModelDiscovery {
    root: PathBuf,
}

impl ModelDiscovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Valid descriptors ordered by model id, then version ascending.
    pub fn discover(&self) -> Result<Vec<PluginDescriptor>, DiscoveryError> {
        Ok(self.discover_with_report()?.descriptors)
    }

    pub fn discover_with_report(&self) -> Result<DiscoveryReport, DiscoveryError> {
        fs::read_dir(&self.root).map_err(|source| DiscoveryError::RootUnreadable {
            path: self.root.clone(),
            source,
        })?;

        let mut report = DiscoveryReport::default();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", self.root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            match build_descriptor(entry.path()) {
                Ok(descriptor) => {
                    debug!(
                        model_id = %descriptor.model_id,
                        version = %descriptor.version,
                        "Discovered plugin at {}",
                        descriptor.root.display()
                    );
                    report.descriptors.push(descriptor);
                }
                Err(DiscoveryError::MalformedPlugin { path, reason }) => {
                    warn!("Skipping malformed plugin at {}: {}", path.display(), reason);
                    report.rejected.push(RejectedCandidate { path, reason });
                }
                Err(e) => return Err(e),
            }
        }

        report
            .descriptors
            .sort_by(|a, b| (&a.model_id, &a.version).cmp(&(&b.model_id, &b.version)));
        info!(
            "Discovered {} plugins under {} ({} rejected)",
            report.descriptors.len(),
            self.root.display(),
            report.rejected.len()
        );
        Ok(report)
    }
}

fn build_descriptor(dir: &Path) -> Result<PluginDescriptor, DiscoveryError> {
    let file_name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let version_name = file_name(dir);
    let model_id = dir.parent().map(file_name).unwrap_or_default();

    if !is_valid_model_id(&model_id) {
        return Err(DiscoveryError::malformed(
            dir,
            format!("invalid model id '{}'", model_id),
        ));
    }
    let version = Version::parse(&version_name).map_err(|e| {
        DiscoveryError::malformed(dir, format!("invalid version '{}': {}", version_name, e))
    })?;

    let entry_points = find_entry_points(dir)?;

    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest = if manifest_path.is_file() {
        let raw = fs::read_to_string(&manifest_path)
            .map_err(|e| DiscoveryError::malformed(dir, format!("cannot read {}: {}", MANIFEST_FILE, e)))?;
        serde_json::from_str::<PluginManifest>(&raw)
            .map_err(|e| DiscoveryError::malformed(dir, format!("invalid {}: {}", MANIFEST_FILE, e)))?
    } else {
        PluginManifest::default()
    };

    if manifest.event_types.iter().any(|t| t.trim().is_empty()) {
        return Err(DiscoveryError::malformed(dir, "empty event type in manifest"));
    }

    Ok(PluginDescriptor::from_parts(
        &model_id,
        version,
        dir,
        entry_points,
        manifest,
    ))
}

fn find_entry_points(dir: &Path) -> Result<EntryPoints, DiscoveryError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| DiscoveryError::malformed(dir, format!("unreadable: {}", e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    // First file per stem wins, in name order.
    let mut by_stem: HashMap<String, PathBuf> = HashMap::new();
    for path in files {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            by_stem.entry(stem.to_string()).or_insert(path);
        }
    }

    let missing: Vec<&str> = EntryPoints::REQUIRED
        .iter()
        .copied()
        .filter(|stem| !by_stem.contains_key(*stem))
        .collect();
    if !missing.is_empty() {
        return Err(DiscoveryError::malformed(
            dir,
            format!("missing entry points: {}", missing.join(", ")),
        ));
    }

    let mut take = |stem: &str| by_stem.remove(stem).unwrap_or_default();
    Ok(EntryPoints {
        loader: take("loader"),
        preprocess: take("preprocess"),
        inference: take("inference"),
        postprocess: take("postprocess"),
    })
}
