//! Configuration structures for motion LoRA training
//!
//! A single immutable [`TrainingConfig`] describes one training run. It can be
//! built in code (struct update syntax over [`Default`]) or loaded from JSON,
//! and is validated once before the trainer is constructed.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::lora::AdapterRole;

/// Sentinel used by the step/epoch cadence options to mean "not set".
pub const UNSET: i64 = -1;

/// Diffusion noise schedule configuration shared by the training and
/// inference schedulers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSchedulerConfig {
    /// Number of training timesteps (typically 1000)
    pub num_train_timesteps: usize,
    /// First beta of the schedule
    pub beta_start: f64,
    /// Last beta of the schedule
    pub beta_end: f64,
    /// Offset added to inference timesteps ("leading" spacing)
    pub steps_offset: usize,
    /// Whether the final DDIM step uses alpha_cumprod = 1
    pub set_alpha_to_one: bool,
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            steps_offset: 1,
            set_alpha_to_one: true,
        }
    }
}

/// Optimizer family used for every adapter role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Decoupled weight decay Adam
    AdamW,
    /// Sign-based low-memory optimizer
    Lion,
}

/// Optimizer hyper-parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub eps: f64,
    /// Lion only: learning rates are divided and weight decay multiplied by
    /// this factor. Empirically tuned, carried over as a default of 10.
    pub sign_compensation: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Lion,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 1e-2,
            eps: 1e-8,
            sign_compensation: 10.0,
        }
    }
}

impl OptimizerConfig {
    /// Effective (learning rate, weight decay) for a base learning rate,
    /// after applying the sign-optimizer compensation
    pub fn effective(&self, learning_rate: f64) -> (f64, f64) {
        match self.kind {
            OptimizerKind::AdamW => (learning_rate, self.weight_decay),
            OptimizerKind::Lion => (
                learning_rate / self.sign_compensation,
                self.weight_decay * self.sign_compensation,
            ),
        }
    }
}

/// Learning rate schedule shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleKind {
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LrScheduleConfig {
    pub kind: LrScheduleKind,
    pub warmup_steps: usize,
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self {
            kind: LrScheduleKind::Constant,
            warmup_steps: 0,
        }
    }
}

/// Periodic validation sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Prompt used for sampling; empty falls back to the training prompt
    pub prompt: String,
    /// Validation cadence in global steps
    pub steps: usize,
    /// Additional global steps that always trigger validation
    pub extra_steps: Vec<usize>,
    /// Spatial adapter scale used while sampling
    pub spatial_scale: f64,
    /// Sampling seed; `None` reuses the global training seed
    pub seed: Option<u64>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    /// Sampling resolution (height, width); `None` uses the clip resolution
    pub resolution: Option<(usize, usize)>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            steps: 25,
            extra_steps: vec![2, 25],
            spatial_scale: 0.5,
            seed: Some(44),
            num_inference_steps: 50,
            guidance_scale: 7.5,
            resolution: None,
        }
    }
}

/// Complete configuration of one motion LoRA training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Base name of the saved adapter artifacts
    pub lora_name: String,
    /// Training caption of the clip
    pub prompt: String,
    pub max_train_epoch: i64,
    pub max_train_steps: i64,
    pub checkpointing_steps: i64,
    pub checkpointing_epochs: i64,
    /// Temporal learning rate
    pub learning_rate: f64,
    pub learning_rate_spatial: f64,
    pub lora_rank: usize,
    /// LoRA alpha; `None` uses the rank (unit scaling)
    pub lora_alpha: Option<f64>,
    pub lora_dropout: f64,
    pub train_temporal_lora: bool,
    pub train_spatial_lora: bool,
    /// Number of spatial adapters trained round-robin
    pub spatial_lora_num: usize,
    pub target_spatial_modules: Vec<String>,
    pub target_temporal_modules: Vec<String>,
    /// Probability of masking the spatial role when temporal is active
    pub spatial_mask_probability: f64,
    /// Probability of training the spatial role on a flipped frame; <= 0 disables
    pub random_hflip_img: f64,
    pub use_offset_noise: bool,
    pub offset_noise_strength: f64,
    pub cfg_random_null_text_ratio: f64,
    pub use_text_augmenter: bool,
    pub optimizer: OptimizerConfig,
    pub lr_schedule: LrScheduleConfig,
    /// Enables dynamic loss scaling
    pub mixed_precision: bool,
    pub gradient_checkpointing: bool,
    pub seed: u64,
    pub validation: ValidationConfig,
    /// Write the temporal artifact with motion-module keys (no `unet.` prefix)
    pub use_motion_lora_format: bool,
    pub noise_scheduler: NoiseSchedulerConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lora_name: "motiondirectorlora".to_string(),
            prompt: String::new(),
            max_train_epoch: 300,
            max_train_steps: UNSET,
            checkpointing_steps: 100,
            checkpointing_epochs: UNSET,
            learning_rate: 5e-4,
            learning_rate_spatial: 1e-4,
            lora_rank: 32,
            lora_alpha: None,
            lora_dropout: 0.1,
            train_temporal_lora: true,
            train_spatial_lora: true,
            spatial_lora_num: 1,
            target_spatial_modules: vec!["Transformer3DModel".to_string()],
            target_temporal_modules: vec!["TemporalTransformerBlock".to_string()],
            spatial_mask_probability: 0.2,
            random_hflip_img: -1.0,
            use_offset_noise: false,
            offset_noise_strength: 0.1,
            cfg_random_null_text_ratio: 0.0,
            use_text_augmenter: false,
            optimizer: OptimizerConfig::default(),
            lr_schedule: LrScheduleConfig::default(),
            mixed_precision: true,
            gradient_checkpointing: true,
            seed: 33,
            validation: ValidationConfig::default(),
            use_motion_lora_format: true,
            noise_scheduler: NoiseSchedulerConfig::default(),
        }
    }
}

/// Step counts derived from the mutually exclusive step/epoch options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingBudget {
    pub max_train_steps: usize,
    pub checkpointing_steps: usize,
}

impl TrainingConfig {
    /// Load a configuration from a JSON file; missing fields use defaults
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Resolve the step budget. One clip per run means one step per epoch.
    pub fn resolve_budget(&self) -> Result<TrainingBudget, ConfigError> {
        let max_train_steps = exclusive(
            "max_train_steps",
            self.max_train_steps,
            "max_train_epoch",
            self.max_train_epoch,
        )?;
        let checkpointing_steps = exclusive(
            "checkpointing_steps",
            self.checkpointing_steps,
            "checkpointing_epochs",
            self.checkpointing_epochs,
        )?;
        Ok(TrainingBudget {
            max_train_steps: max_train_steps * STEPS_PER_EPOCH,
            checkpointing_steps: checkpointing_steps * STEPS_PER_EPOCH,
        })
    }

    /// Full validation; returns the resolved budget on success
    pub fn validate(&self) -> Result<TrainingBudget, ConfigError> {
        let budget = self.resolve_budget()?;

        if self.lora_rank == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lora_rank",
                reason: "must be > 0".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(ConfigError::InvalidValue {
                field: "lora_dropout",
                reason: format!("{} is outside [0, 1)", self.lora_dropout),
            });
        }
        if self.spatial_lora_num == 0 {
            return Err(ConfigError::InvalidValue {
                field: "spatial_lora_num",
                reason: "ensemble size must be >= 1".to_string(),
            });
        }
        for (field, p) in [
            ("spatial_mask_probability", self.spatial_mask_probability),
            ("cfg_random_null_text_ratio", self.cfg_random_null_text_ratio),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("probability {} is outside [0, 1]", p),
                });
            }
        }
        if self.random_hflip_img > 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "random_hflip_img",
                reason: format!("probability {} is greater than 1", self.random_hflip_img),
            });
        }
        if !self.train_temporal_lora && !self.train_spatial_lora {
            return Err(ConfigError::NoTrainableRole);
        }
        if self.validation.steps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "validation.steps",
                reason: "cadence must be > 0".to_string(),
            });
        }
        if self.optimizer.kind == OptimizerKind::Lion && self.optimizer.sign_compensation <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "optimizer.sign_compensation",
                reason: "must be > 0".to_string(),
            });
        }
        let nts = &self.noise_scheduler;
        if nts.num_train_timesteps < 2 || nts.beta_start <= 0.0 || nts.beta_end < nts.beta_start {
            return Err(ConfigError::InvalidValue {
                field: "noise_scheduler",
                reason: format!(
                    "need >= 2 timesteps and 0 < beta_start <= beta_end, got {} / {} / {}",
                    nts.num_train_timesteps, nts.beta_start, nts.beta_end
                ),
            });
        }

        Ok(budget)
    }

    /// LoRA scaling numerator; defaults to the rank
    pub fn lora_alpha(&self) -> f64 {
        self.lora_alpha.unwrap_or(self.lora_rank as f64)
    }

    /// Target sublayer block types of a role
    pub fn target_modules(&self, role: AdapterRole) -> &[String] {
        match role {
            AdapterRole::Spatial => &self.target_spatial_modules,
            AdapterRole::Temporal => &self.target_temporal_modules,
        }
    }

    /// Base learning rate of a role before optimizer compensation
    pub fn base_learning_rate(&self, role: AdapterRole) -> f64 {
        match role {
            AdapterRole::Spatial => self.learning_rate_spatial,
            AdapterRole::Temporal => self.learning_rate,
        }
    }

    /// Whether validation runs after `global_step`
    pub fn is_validation_step(&self, global_step: usize) -> bool {
        global_step % self.validation.steps == 0 || self.validation.extra_steps.contains(&global_step)
    }
}

const STEPS_PER_EPOCH: usize = 1;

fn exclusive(
    steps_field: &'static str,
    steps: i64,
    epochs_field: &'static str,
    epochs: i64,
) -> Result<usize, ConfigError> {
    match (steps == UNSET, epochs == UNSET) {
        (true, false) if epochs > 0 => Ok(epochs as usize),
        (false, true) if steps > 0 => Ok(steps as usize),
        (true, true) => Err(ConfigError::NeitherSet {
            first: steps_field,
            second: epochs_field,
        }),
        (false, false) => Err(ConfigError::BothSet {
            first: steps_field,
            second: epochs_field,
        }),
        _ => Err(ConfigError::InvalidValue {
            field: if steps == UNSET { epochs_field } else { steps_field },
            reason: "must be a positive count or -1".to_string(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{first} and {second} are mutually exclusive; set one of them to -1")]
    BothSet {
        first: &'static str,
        second: &'static str,
    },
    #[error("one of {first} and {second} must be set")]
    NeitherSet {
        first: &'static str,
        second: &'static str,
    },
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("both temporal and spatial training are disabled")]
    NoTrainableRole,
    #[error("Failed to read config: {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse JSON config: {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
