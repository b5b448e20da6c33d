//! Dual-objective motion LoRA training loop
//!
//! Every global step:
//! 1. draw the role masks (temporal masked only when disabled, spatial with
//!    probability `spatial_mask_probability` unless temporal is masked)
//! 2. draw the prompt (null-text / caption augmentation)
//! 3. encode the clip, sample one shared noise tensor and timestep per batch
//!    element, encode the prompt once
//! 4. spatial branch on a single frame (temporal adapters gated to 0, one
//!    spatial ensemble member gated to 1)
//! 5. temporal branch on the full clip (temporal adapters gated to 1),
//!    MSE plus the decentered consistency term
//! 6. scaled backward of each active loss, per-role optimizer steps, one
//!    scaler update, every learning rate schedule advanced
//! 7. checkpoint and validation on their own cadences
//!
//! [`MotionDirectorTrainer::train_step`] is the only caller of the scaler's
//! `step`/`update`, so the one-update-per-step invariant lives in one place.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, AdapterGate, AdapterManager, InjectedAdapters, ScaleTarget};
use crate::backbone::Backbone;
use crate::checkpoint::{CheckpointError, CheckpointManager, OutputLayout};
use crate::config::{ConfigError, TrainingBudget, TrainingConfig};
use crate::latent::{ClipSource, LatentCodec};
use crate::lora::{AdapterRole, LoraConfig};
use crate::loss::{loss_value, spatial_loss, temporal_loss};
use crate::optim::{GradScaler, LrSchedule, RoleOptimizer};
use crate::sampler::{SampleRequest, SamplerContext, VideoSampler, save_video_gif};
use crate::scheduler::TrainingSchedulers;
use crate::text::{PromptEncoder, PromptPolicy, TextEncoder, TextEncoderError};
use crate::utils::deterministic_rng::{Pcg32, TrainingRng};

/// Frame rate of saved validation GIFs
const SAMPLE_FPS: u32 = 8;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Text(#[from] TextEncoderError),

    #[error("non-finite {role} loss {value} at step {step}")]
    NumericInstability { role: AdapterRole, step: usize, value: f32 },

    #[error("{role} loss produced no adapter gradients at step {step}")]
    NoGradients { role: Role, step: usize },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Roles
// =============================================================================

/// One optimizer-owning training role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Spatial ensemble member
    Spatial(usize),
    Temporal,
}

impl Role {
    pub fn adapter_role(&self) -> AdapterRole {
        match self {
            Role::Spatial(_) => AdapterRole::Spatial,
            Role::Temporal => AdapterRole::Temporal,
        }
    }

    fn member(&self) -> usize {
        match self {
            Role::Spatial(member) => *member,
            Role::Temporal => 0,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Spatial(member) => write!(f, "spatial[{member}]"),
            Role::Temporal => f.write_str("temporal"),
        }
    }
}

/// Optimizer, schedule and parameter set of one role
struct RoleSlot {
    role: Role,
    vars: Vec<Var>,
    names: BTreeSet<String>,
    optimizer: RoleOptimizer,
    schedule: LrSchedule,
    optimizer_steps: usize,
}

impl RoleSlot {
    fn new(role: Role, adapters: &InjectedAdapters, config: &TrainingConfig, total_steps: usize) -> candle_core::Result<Self> {
        let member = role.member();
        let vars = adapters.member_vars(member);
        let names = adapters
            .params()
            .iter()
            .filter(|p| p.member == member)
            .map(|p| p.name.clone())
            .collect();
        let base_lr = config.base_learning_rate(role.adapter_role());
        let (lr, _) = config.optimizer.effective(base_lr);
        let schedule = LrSchedule::new(&config.lr_schedule, lr, total_steps);
        let mut optimizer = RoleOptimizer::new(vars.clone(), &config.optimizer, base_lr)?;
        optimizer.set_learning_rate(schedule.lr());
        Ok(Self {
            role,
            vars,
            names,
            optimizer,
            schedule,
            optimizer_steps: 0,
        })
    }

    fn has_grads(&self, grads: &GradStore) -> bool {
        self.vars.iter().any(|v| grads.get(v.as_tensor()).is_some())
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Role masks of one step; `true` means the role does not train
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskDecision {
    pub spatial: bool,
    pub temporal: bool,
}

impl MaskDecision {
    /// Temporal is masked only when disabled. Spatial is masked when
    /// disabled, or with `spatial_mask_probability` while temporal trains.
    pub fn draw(config: &TrainingConfig, rng: &mut TrainingRng) -> Self {
        let temporal = !config.train_temporal_lora;
        let coin = rng.chance(config.spatial_mask_probability);
        let spatial = !config.train_spatial_lora || (coin && !temporal);
        Self { spatial, temporal }
    }
}

#[derive(Debug, Clone)]
pub struct StepReport {
    /// Global step after this step completed
    pub step: usize,
    pub masks: MaskDecision,
    pub spatial_loss: Option<f32>,
    pub temporal_loss: Option<f32>,
    /// Ensemble member trained by the spatial branch
    pub spatial_member: Option<usize>,
    pub hflip: bool,
    /// Roles whose optimizer actually stepped
    pub stepped: Vec<Role>,
    pub temporal_lr: Option<f64>,
    pub spatial_lr: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub global_steps: usize,
    pub optimizer_steps: Vec<(Role, usize)>,
    pub schedule_steps: Vec<(Role, usize)>,
    pub scaler_updates: usize,
    pub history: Vec<StepReport>,
    /// Last validation clip [1, F, 3, H, W] in [0, 1]
    pub last_sample: Option<Tensor>,
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingSummary {
    pub fn optimizer_steps_of(&self, adapter_role: AdapterRole) -> usize {
        self.optimizer_steps
            .iter()
            .filter(|(role, _)| role.adapter_role() == adapter_role)
            .map(|(_, n)| n)
            .sum()
    }
}

// =============================================================================
// Trainer
// =============================================================================

/// Frozen collaborators of a run
pub struct TrainerComponents {
    pub backbone: Box<dyn Backbone>,
    pub codec: Box<dyn LatentCodec>,
    pub text_encoder: Box<dyn TextEncoder>,
    pub sampler: Box<dyn VideoSampler>,
}

pub struct MotionDirectorTrainer {
    config: TrainingConfig,
    budget: TrainingBudget,
    backbone: Box<dyn Backbone>,
    codec: Box<dyn LatentCodec>,
    prompts: PromptEncoder,
    sampler: Box<dyn VideoSampler>,
    schedulers: TrainingSchedulers,
    spatial: Option<InjectedAdapters>,
    temporal: Option<InjectedAdapters>,
    slots: Vec<RoleSlot>,
    scaler: GradScaler,
    rng: TrainingRng,
    policy: PromptPolicy,
    checkpoints: CheckpointManager,
    global_step: usize,
    spatial_turns: usize,
    history: Vec<StepReport>,
    saved: Vec<PathBuf>,
    last_sample: Option<Tensor>,
}

impl MotionDirectorTrainer {
    /// Validate the configuration and inject the adapters of every enabled role
    pub fn new(config: TrainingConfig, components: TrainerComponents, output_dir: impl AsRef<Path>) -> Result<Self, TrainError> {
        let budget = config.validate()?;
        let TrainerComponents {
            mut backbone,
            codec,
            text_encoder,
            sampler,
        } = components;

        let lora = LoraConfig {
            rank: config.lora_rank,
            alpha: config.lora_alpha(),
            dropout: config.lora_dropout as f32,
        };
        let mut init_rng = Pcg32::new(config.seed, 7);

        let temporal = if config.train_temporal_lora {
            // Dropout only applies to the spatial role
            let temporal_lora = LoraConfig { dropout: 0.0, ..lora };
            Some(AdapterManager::inject(
                backbone.as_mut(),
                &config.target_temporal_modules,
                &temporal_lora,
                AdapterRole::Temporal,
                1,
                &mut init_rng,
            )?)
        } else {
            None
        };
        let spatial = if config.train_spatial_lora {
            Some(AdapterManager::inject(
                backbone.as_mut(),
                &config.target_spatial_modules,
                &lora,
                AdapterRole::Spatial,
                config.spatial_lora_num,
                &mut init_rng,
            )?)
        } else {
            None
        };
        if let (Some(s), Some(t)) = (&spatial, &temporal) {
            AdapterManager::ensure_disjoint(s, t)?;
        }

        let mut slots = Vec::new();
        if let Some(t) = &temporal {
            slots.push(RoleSlot::new(Role::Temporal, t, &config, budget.max_train_steps)?);
        }
        if let Some(s) = &spatial {
            for member in 0..s.ensemble_size() {
                slots.push(RoleSlot::new(Role::Spatial(member), s, &config, budget.max_train_steps)?);
            }
        }
        for slot in &slots {
            for adapters in [&spatial, &temporal].into_iter().flatten() {
                AdapterManager::ensure_trainable(adapters, slot.role.adapter_role(), &slot.names)?;
            }
        }

        let policy = PromptPolicy {
            prompt: config.prompt.clone(),
            null_text_ratio: config.cfg_random_null_text_ratio,
            augment: config.use_text_augmenter,
        };
        let checkpoints = CheckpointManager::new(OutputLayout::new(output_dir.as_ref()), &config);
        let scaler = GradScaler::new(config.mixed_precision);

        info!(
            max_train_steps = budget.max_train_steps,
            checkpointing_steps = budget.checkpointing_steps,
            roles = slots.len(),
            optimizer = ?config.optimizer.kind,
            loss_scaling = scaler.is_enabled(),
            "Motion LoRA trainer ready"
        );

        Ok(Self {
            schedulers: TrainingSchedulers::new(&config.noise_scheduler),
            scaler,
            rng: TrainingRng::new(config.seed),
            prompts: PromptEncoder::new(text_encoder),
            config,
            budget,
            backbone,
            codec,
            sampler,
            spatial,
            temporal,
            slots,
            policy,
            checkpoints,
            global_step: 0,
            spatial_turns: 0,
            history: Vec::new(),
            saved: Vec::new(),
            last_sample: None,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn budget(&self) -> TrainingBudget {
        self.budget
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn backbone_mut(&mut self) -> &mut dyn Backbone {
        self.backbone.as_mut()
    }

    pub fn adapters(&self, role: AdapterRole) -> Option<&InjectedAdapters> {
        match role {
            AdapterRole::Spatial => self.spatial.as_ref(),
            AdapterRole::Temporal => self.temporal.as_ref(),
        }
    }

    pub fn roles(&self) -> Vec<Role> {
        self.slots.iter().map(|s| s.role).collect()
    }

    /// Trainable parameter names of a role
    pub fn trainable_names(&self, role: Role) -> Option<&BTreeSet<String>> {
        self.slots.iter().find(|s| s.role == role).map(|s| &s.names)
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// Run until the step budget is exhausted
    pub fn run(&mut self, clip: &ClipSource) -> Result<TrainingSummary, TrainError> {
        let layout = self.checkpoints.layout().clone();
        layout.create()?;
        layout.write_config(&self.config)?;

        self.backbone.set_train(true)?;
        self.backbone.set_gradient_checkpointing(self.config.gradient_checkpointing);

        info!(
            frames = clip.num_frames()?,
            batch = clip.batch_size()?,
            output = %layout.root().display(),
            "Starting motion LoRA training"
        );

        while self.global_step < self.budget.max_train_steps {
            self.train_step(clip)?;
        }

        debug!(
            cached_prompts = self.prompts.cache_size(),
            cache_hits = self.prompts.cache_hits(),
            "Prompt cache"
        );
        Ok(self.summary())
    }

    pub fn summary(&self) -> TrainingSummary {
        TrainingSummary {
            global_steps: self.global_step,
            optimizer_steps: self.slots.iter().map(|s| (s.role, s.optimizer_steps)).collect(),
            schedule_steps: self.slots.iter().map(|s| (s.role, s.schedule.current_step())).collect(),
            scaler_updates: self.scaler.updates(),
            history: self.history.clone(),
            last_sample: self.last_sample.clone(),
            checkpoints: self.saved.clone(),
        }
    }

    fn gate(&mut self, role: AdapterRole, value: f64) -> candle_core::Result<()> {
        if self.adapters(role).is_some() {
            AdapterGate::set_scale(self.backbone.as_mut(), ScaleTarget::Role(role), value)?;
        }
        Ok(())
    }

    fn check_finite(&self, role: AdapterRole, loss: &Tensor) -> Result<f32, TrainError> {
        let value = loss_value(loss)?;
        if !value.is_finite() {
            return Err(TrainError::NumericInstability {
                role,
                step: self.global_step,
                value,
            });
        }
        Ok(value)
    }

    /// One full optimization step over both roles
    pub fn train_step(&mut self, clip: &ClipSource) -> Result<StepReport, TrainError> {
        // Gradients are fresh per backward pass; nothing carries over from
        // the previous step.
        let masks = MaskDecision::draw(&self.config, &mut self.rng);
        let prompt = self.policy.draw(&mut self.rng);

        let latents = clip.latents(self.codec.as_ref())?;
        let (batch, _, frames, _, _) = latents.dims5()?;
        let device = latents.device().clone();
        let offset = self.config.use_offset_noise.then_some(self.config.offset_noise_strength);
        let noise = self.rng.sample_noise(&latents, offset)?;

        let timesteps = self.rng.timesteps(batch, self.schedulers.num_train_timesteps());
        let timestep_tensor = Tensor::from_vec(
            timesteps.iter().map(|&t| t as u32).collect::<Vec<_>>(),
            batch,
            &device,
        )?;
        let text = self.prompts.encode(&prompt, batch)?;

        // ---- spatial branch ----
        let mut spatial_member = None;
        let mut hflip = false;
        let loss_spatial = if masks.spatial {
            self.gate(AdapterRole::Spatial, 0.0)?;
            None
        } else {
            let ensemble = self.spatial.as_ref().map_or(1, |s| s.ensemble_size());
            let member = self.spatial_turns % ensemble;
            self.spatial_turns += 1;
            spatial_member = Some(member);

            self.gate(AdapterRole::Temporal, 0.0)?;
            if ensemble == 1 {
                self.gate(AdapterRole::Spatial, 1.0)?;
            } else {
                self.gate(AdapterRole::Spatial, 0.0)?;
                AdapterGate::set_scale(
                    self.backbone.as_mut(),
                    ScaleTarget::Member {
                        role: AdapterRole::Spatial,
                        index: member,
                        ensemble_size: ensemble,
                    },
                    1.0,
                )?;
            }

            let frame = self.rng.index(frames);
            hflip = self.rng.chance(self.config.random_hflip_img);
            let (input, target) = if hflip {
                let flipped = clip.flipped_frame_latents(self.codec.as_ref(), frame)?;
                let fresh = self.rng.sample_noise(&flipped, None)?;
                let noisy = self.schedulers.spatial.add_noise(&flipped, &fresh, &timesteps)?;
                (noisy, fresh)
            } else {
                let noisy = self.schedulers.spatial.add_noise(&latents, &noise, &timesteps)?;
                (noisy.narrow(2, frame, 1)?, noise.narrow(2, frame, 1)?)
            };
            let pred = self.backbone.forward(&input, &timestep_tensor, &text)?;
            let loss = spatial_loss(&pred, &target)?;
            debug!(member, frame, hflip, "Spatial branch");
            Some(loss)
        };

        // ---- temporal branch ----
        let loss_temporal = if masks.temporal {
            self.gate(AdapterRole::Temporal, 0.0)?;
            None
        } else {
            self.gate(AdapterRole::Temporal, 1.0)?;
            let noisy = self.schedulers.temporal.add_noise(&latents, &noise, &timesteps)?;
            let pred = self.backbone.forward(&noisy, &timestep_tensor, &text)?;
            let pivot = self.rng.index(frames);
            Some(temporal_loss(&pred, &noise, pivot)?)
        };

        let spatial_value = loss_spatial
            .as_ref()
            .map(|l| self.check_finite(AdapterRole::Spatial, l))
            .transpose()?;
        let temporal_value = loss_temporal
            .as_ref()
            .map(|l| self.check_finite(AdapterRole::Temporal, l))
            .transpose()?;

        // ---- backward: both gradient sets before any parameter moves ----
        let mut spatial_grads = loss_spatial.as_ref().map(|l| self.scaler.backward(l)).transpose()?;
        let mut temporal_grads = loss_temporal.as_ref().map(|l| self.scaler.backward(l)).transpose()?;

        let mut stepped = Vec::new();
        for slot in self.slots.iter_mut() {
            let grads = match slot.role {
                Role::Temporal => temporal_grads.as_mut(),
                Role::Spatial(member) if spatial_member == Some(member) => spatial_grads.as_mut(),
                Role::Spatial(_) => None,
            };
            let Some(grads) = grads else {
                continue;
            };
            if !slot.has_grads(grads) {
                warn!(role = %slot.role, step = self.global_step, "Loss is detached from the adapters");
                return Err(TrainError::NoGradients {
                    role: slot.role,
                    step: self.global_step,
                });
            }
            if self.scaler.step(&mut slot.optimizer, grads, &slot.vars)? {
                slot.optimizer_steps += 1;
                stepped.push(slot.role);
            } else {
                warn!(role = %slot.role, scale = self.scaler.scale(), "Gradient overflow, step skipped");
            }
        }
        self.scaler.update();

        let mut temporal_lr = None;
        let mut spatial_lr = None;
        for slot in self.slots.iter_mut() {
            let lr = slot.schedule.step();
            slot.optimizer.set_learning_rate(lr);
            match slot.role {
                Role::Temporal => temporal_lr = Some(lr),
                Role::Spatial(member) if spatial_member.unwrap_or(0) == member => spatial_lr = Some(lr),
                Role::Spatial(_) => {}
            }
        }

        self.global_step += 1;
        let report = StepReport {
            step: self.global_step,
            masks,
            spatial_loss: spatial_value,
            temporal_loss: temporal_value,
            spatial_member,
            hflip,
            stepped,
            temporal_lr,
            spatial_lr,
        };
        info!(
            step = report.step,
            temporal_loss = ?report.temporal_loss,
            spatial_loss = ?report.spatial_loss,
            temporal_lr = ?report.temporal_lr,
            spatial_lr = ?report.spatial_lr,
            "Training step"
        );
        self.history.push(report.clone());

        if self.global_step % self.budget.checkpointing_steps == 0 {
            self.save_checkpoints();
        }
        if self.config.is_validation_step(self.global_step) {
            self.validate(clip, &prompt)?;
        }

        Ok(report)
    }

    /// Persist every injected role; failures are logged and skipped
    pub fn save_checkpoints(&mut self) {
        for adapters in [self.temporal.as_ref(), self.spatial.as_ref()].into_iter().flatten() {
            match self.checkpoints.save(adapters, self.global_step) {
                Ok(paths) => self.saved.extend(paths),
                Err(e) => warn!(role = %adapters.role(), step = self.global_step, error = %e, "Checkpoint failed"),
            }
        }
    }

    /// Sample a validation clip at reduced spatial scale.
    ///
    /// Sampler and save failures are logged; adapter weights and optimizer
    /// state are never touched.
    fn validate(&mut self, clip: &ClipSource, step_prompt: &str) -> Result<(), TrainError> {
        let checkpointing = self.backbone.gradient_checkpointing();
        if checkpointing {
            self.backbone.set_gradient_checkpointing(false);
        }
        self.backbone.set_train(false)?;
        self.gate(AdapterRole::Spatial, self.config.validation.spatial_scale)?;
        self.gate(AdapterRole::Temporal, 1.0)?;

        let validation = &self.config.validation;
        let prompt = if validation.prompt.is_empty() {
            step_prompt.to_string()
        } else {
            validation.prompt.clone()
        };
        let (height, width) = match validation.resolution {
            Some(resolution) => resolution,
            None => clip.resolution(self.codec.as_ref())?,
        };
        let request = SampleRequest {
            prompt,
            negative_prompt: String::new(),
            seed: validation.seed.unwrap_or(self.config.seed),
            num_frames: clip.num_frames()?,
            height,
            width,
            num_inference_steps: validation.num_inference_steps,
            guidance_scale: validation.guidance_scale,
        };
        info!(step = self.global_step, prompt = %request.prompt, seed = request.seed, "Running validation");

        let ctx = SamplerContext {
            backbone: self.backbone.as_ref(),
            text_encoder: self.prompts.encoder(),
            codec: self.codec.as_ref(),
        };
        match self.sampler.generate(&ctx, &request) {
            Ok(sample) => {
                let path = self.checkpoints.layout().sample_path(self.global_step);
                match save_video_gif(&sample, &path, SAMPLE_FPS) {
                    Ok(()) => info!(path = %path.display(), "Saved samples"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to save sample"),
                }
                self.last_sample = Some(sample);
            }
            Err(e) => warn!(step = self.global_step, error = %e, "Validation sampling failed"),
        }

        self.backbone.set_train(true)?;
        if checkpointing {
            self.backbone.set_gradient_checkpointing(true);
        }
        Ok(())
    }

    /// Load a saved artifact into one role's adapters
    pub fn load_adapter_weights(&self, role: Role, path: impl AsRef<Path>) -> Result<usize, TrainError> {
        let adapters = self.adapters(role.adapter_role()).ok_or(AdapterError::NoMatchingSublayers {
            role: role.adapter_role(),
            targets: self.config.target_modules(role.adapter_role()).to_vec(),
        })?;
        Ok(CheckpointManager::load_adapter_weights(adapters, role.member(), path)?)
    }
}
