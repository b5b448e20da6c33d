//! Candle-Motion-Director: dual spatial/temporal LoRA motion fine-tuning
//! for text-to-video diffusion models on Candle.
//!
//! A reference clip is learned as two independent low-rank adapter sets on
//! a frozen spatio-temporal backbone: spatial adapters capture appearance
//! from single frames, temporal adapters capture motion from the full clip.

pub mod adapters;
pub mod backbone;
pub mod checkpoint;
pub mod common;
pub mod config;
pub mod latent;
pub mod lora;
pub mod loss;
pub mod models;
pub mod optim;
pub mod sampler;
pub mod scheduler;
pub mod text;
pub mod trainer;
pub mod utils;

pub use adapters::{AdapterError, AdapterGate, AdapterManager, InjectedAdapters, ScaleTarget};
pub use backbone::{Backbone, SublayerInfo};
pub use checkpoint::{CheckpointError, CheckpointManager, OutputLayout};
pub use config::{ConfigError, TrainingBudget, TrainingConfig};
pub use latent::{ClipSource, LatentCodec};
pub use lora::{AdaptableLinear, AdapterRole, LoraAdapter, LoraConfig};
pub use optim::{GradScaler, LrSchedule, RoleOptimizer};
pub use sampler::{DdimVideoSampler, SampleRequest, SamplerContext, SamplerError, VideoSampler};
pub use scheduler::{BetaSchedule, DdimScheduler, DdpmScheduler, TrainingSchedulers};
pub use text::{PromptEncoder, PromptPolicy, TextEncoder, TextEncoderError};
pub use trainer::{MotionDirectorTrainer, Role, StepReport, TrainError, TrainerComponents, TrainingSummary};
