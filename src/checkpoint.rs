//! Output layout and adapter checkpoint artifacts
//!
//! ```text
//! <output>/
//!   config.json
//!   samples/sample-<step>.gif
//!   lora/spatial/<step>_<name>_spatial[_<member>].safetensors
//!   lora/temporal/<step>_<name>_temporal.safetensors
//! ```
//!
//! Artifacts are written from a CPU snapshot of the adapter weights.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::adapters::{AdapterError, InjectedAdapters};
use crate::config::TrainingConfig;
use crate::lora::AdapterRole;

const UNET_PREFIX: &str = "unet.";

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Safetensors error at {path}: {message}")]
    Safetensors { path: String, message: String },

    #[error("Failed to serialize config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

// =============================================================================
// Output layout
// =============================================================================

/// Directory structure of one training run
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.root.join("samples")
    }

    pub fn lora_dir(&self, role: AdapterRole) -> PathBuf {
        self.root.join("lora").join(role.as_str())
    }

    pub fn sample_path(&self, step: usize) -> PathBuf {
        self.samples_dir().join(format!("sample-{step}.gif"))
    }

    /// Create every directory of the layout
    pub fn create(&self) -> Result<(), CheckpointError> {
        for dir in [
            self.root.clone(),
            self.samples_dir(),
            self.lora_dir(AdapterRole::Spatial),
            self.lora_dir(AdapterRole::Temporal),
        ] {
            std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }
        Ok(())
    }

    /// Persist the run configuration as `config.json`
    pub fn write_config(&self, config: &TrainingConfig) -> Result<PathBuf, CheckpointError> {
        let path = self.root.join("config.json");
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&path, json).map_err(io_error(&path))?;
        Ok(path)
    }
}

// =============================================================================
// Artifacts
// =============================================================================

/// Key naming of a saved artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    /// `unet.<sublayer>.lora_down.weight`
    Unet,
    /// `<sublayer>.lora_down.weight`, loadable as a motion module LoRA
    MotionModule,
}

impl KeyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFormat::Unet => "unet",
            KeyFormat::MotionModule => "motion_module",
        }
    }

    fn key(&self, name: &str) -> String {
        match self {
            KeyFormat::Unet => format!("{UNET_PREFIX}{name}"),
            KeyFormat::MotionModule => name.to_string(),
        }
    }
}

/// Writes and reads role-specific adapter artifacts
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    layout: OutputLayout,
    lora_name: String,
    rank: usize,
    alpha: f64,
    motion_lora_format: bool,
}

impl CheckpointManager {
    pub fn new(layout: OutputLayout, config: &TrainingConfig) -> Self {
        Self {
            layout,
            lora_name: config.lora_name.clone(),
            rank: config.lora_rank,
            alpha: config.lora_alpha(),
            motion_lora_format: config.use_motion_lora_format,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Spatial artifacts always use the prefixed format
    pub fn key_format(&self, role: AdapterRole) -> KeyFormat {
        match role {
            AdapterRole::Temporal if self.motion_lora_format => KeyFormat::MotionModule,
            _ => KeyFormat::Unet,
        }
    }

    pub fn artifact_path(&self, role: AdapterRole, member: usize, ensemble_size: usize, step: usize) -> PathBuf {
        let member = if ensemble_size > 1 {
            format!("_{member}")
        } else {
            String::new()
        };
        self.layout
            .lora_dir(role)
            .join(format!("{step}_{}_{role}{member}.safetensors", self.lora_name))
    }

    /// Snapshot every member of `adapters` at `step`
    pub fn save(&self, adapters: &InjectedAdapters, step: usize) -> Result<Vec<PathBuf>, CheckpointError> {
        let role = adapters.role();
        let format = self.key_format(role);
        let dir = self.layout.lora_dir(role);
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let mut written = Vec::with_capacity(adapters.ensemble_size());
        for member in 0..adapters.ensemble_size() {
            let tensors: Vec<(String, Tensor)> = adapters
                .state_dict(member)?
                .into_iter()
                .map(|(name, tensor)| (format.key(&name), tensor))
                .collect();

            let metadata = HashMap::from([
                ("role".to_string(), role.as_str().to_string()),
                ("member".to_string(), member.to_string()),
                ("rank".to_string(), self.rank.to_string()),
                ("alpha".to_string(), self.alpha.to_string()),
                ("step".to_string(), step.to_string()),
                ("format".to_string(), format.as_str().to_string()),
            ]);

            let path = self.artifact_path(role, member, adapters.ensemble_size(), step);
            safetensors::tensor::serialize_to_file(tensors, Some(metadata), &path).map_err(|e| {
                CheckpointError::Safetensors {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
            })?;
            info!(role = %role, member, step, path = %path.display(), "Saved LoRA checkpoint");
            written.push(path);
        }
        Ok(written)
    }

    /// Tensors and metadata of an artifact, on CPU
    pub fn read(path: impl AsRef<Path>) -> Result<(HashMap<String, Tensor>, HashMap<String, String>), CheckpointError> {
        let path = path.as_ref();
        let buffer = std::fs::read(path).map_err(io_error(path))?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&buffer).map_err(|e| CheckpointError::Safetensors {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = candle_core::safetensors::load_buffer(&buffer, &Device::Cpu)?;
        Ok((tensors, metadata))
    }

    /// Load an artifact into one member of an injected adapter set.
    /// Accepts both key formats.
    pub fn load_adapter_weights(
        adapters: &InjectedAdapters,
        member: usize,
        path: impl AsRef<Path>,
    ) -> Result<usize, CheckpointError> {
        let (tensors, _) = Self::read(path)?;
        let tensors: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(key, tensor)| match key.strip_prefix(UNET_PREFIX) {
                Some(name) => (name.to_string(), tensor),
                None => (key, tensor),
            })
            .collect();
        Ok(adapters.load_state_dict(member, &tensors)?)
    }
}
