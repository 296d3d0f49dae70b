//! Model plugins
//!
//! A plugin is a versioned model implementation exposing four stages
//! (load, preprocess, infer, postprocess). Descriptors are discovered on
//! disk; implementations are Rust trait objects looked up in a
//! [`PluginCatalog`] by the descriptor's plugin name.

pub mod builtin;
pub mod catalog;
pub mod contract;
pub mod descriptor;

pub use builtin::FrameStatsPlugin;
pub use catalog::PluginCatalog;
pub use contract::{BoundingBox, Detection, Frame, ModelHandle, ModelPlugin, RawOutput, Tensor};
pub use descriptor::{
    EntryPoints, ModelKey, PluginDescriptor, PluginManifest, ResourceRequirements,
};

#[cfg(test)]
pub(crate) mod test_support {
    //! Controllable plugin used across the crate's unit tests.

    use std::ops::Deref;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::PluginError;
    use crate::resources::DevicePreference;

    pub fn descriptor_for(model_id: &str, version: &str) -> PluginDescriptor {
        let root = PathBuf::from(format!("/models/{}/{}", model_id, version));
        PluginDescriptor {
            model_id: model_id.to_string(),
            version: semver::Version::parse(version).unwrap(),
            entry_points: EntryPoints {
                loader: root.join("loader.py"),
                preprocess: root.join("preprocess.py"),
                inference: root.join("inference.py"),
                postprocess: root.join("postprocess.py"),
            },
            weights_path: root.join("weights"),
            root,
            requirements: ResourceRequirements {
                memory_mb: 1024,
                device: DevicePreference::Gpu,
            },
            plugin: model_id.to_string(),
            event_types: vec!["fall".to_string()],
            description: None,
            params: serde_json::Value::Null,
        }
    }

    /// Flags a test flips at runtime; shared between a plugin and its handles.
    #[derive(Default)]
    pub struct Script {
        pub loads: AtomicUsize,
        pub inferences: AtomicUsize,
        /// Inferences whose plugin call ran to the end.
        pub completed: AtomicUsize,
        pub unloads: AtomicUsize,
        pub fail_load: AtomicBool,
        pub panic_load: AtomicBool,
        pub fail_infer: AtomicBool,
        pub panic_infer: AtomicBool,
        pub malformed_output: AtomicBool,
        pub infer_delay_ms: AtomicUsize,
        pub load_delay_ms: AtomicUsize,
    }

    #[derive(Default)]
    pub struct ScriptedPlugin {
        script: Arc<Script>,
    }

    impl ScriptedPlugin {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn inference_count(&self) -> usize {
            self.script.inferences.load(Ordering::SeqCst)
        }
    }

    impl Deref for ScriptedPlugin {
        type Target = Script;

        fn deref(&self) -> &Script {
            &self.script
        }
    }

    impl ModelPlugin for ScriptedPlugin {
        fn load(
            &self,
            weights_path: &Path,
            _descriptor: &PluginDescriptor,
        ) -> Result<Box<dyn ModelHandle>, PluginError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let delay = self.load_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay as u64));
            }
            if self.panic_load.load(Ordering::SeqCst) {
                panic!("scripted load panic");
            }
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(PluginError::WeightsNotFound(weights_path.to_path_buf()));
            }
            Ok(Box::new(ScriptedHandle {
                script: Arc::clone(&self.script),
            }))
        }
    }

    struct ScriptedHandle {
        script: Arc<Script>,
    }

    impl ModelHandle for ScriptedHandle {
        fn preprocess(&self, frame: &Frame) -> Result<Tensor, PluginError> {
            Ok(Tensor::new(vec![frame.data.len()], vec![0.0; frame.data.len()]))
        }

        fn infer(&self, _input: &Tensor) -> Result<RawOutput, PluginError> {
            let script = &self.script;
            script.inferences.fetch_add(1, Ordering::SeqCst);
            let delay = script.infer_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay as u64));
            }
            script.completed.fetch_add(1, Ordering::SeqCst);
            if script.panic_infer.load(Ordering::SeqCst) {
                panic!("scripted inference panic");
            }
            if script.fail_infer.load(Ordering::SeqCst) {
                return Err(PluginError::failed("scripted failure"));
            }
            Ok(serde_json::json!({ "score": 0.9 }))
        }

        fn postprocess(&self, raw: RawOutput) -> Result<Detection, PluginError> {
            let confidence = if self.script.malformed_output.load(Ordering::SeqCst) {
                7.5
            } else {
                raw["score"].as_f64().unwrap_or_default() as f32
            };
            Ok(Detection {
                event_type: "fall".to_string(),
                confidence,
                bounding_boxes: vec![BoundingBox::full_frame()],
                metadata: serde_json::Map::new(),
            })
        }

        fn unload(&self) {
            self.script.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }
}
