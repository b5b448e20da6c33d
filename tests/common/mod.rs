//! Shared fixtures: tiny backbone, pooling codec, hashed text encoder

#![allow(dead_code)]

use candle_core::{DType, Device, Result, Tensor};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use candle_motion_director::{
    ClipSource, LatentCodec, SampleRequest, SamplerContext, SamplerError, TextEncoder, TextEncoderError,
    TrainerComponents, TrainingConfig, VideoSampler,
    config::UNSET,
    models::{SpatioTemporalConfig, SpatioTemporalTransformer},
    utils::deterministic_rng::Pcg32,
};

pub const TEXT_LEN: usize = 5;
pub const TEXT_DIM: usize = 8;

pub fn tiny_backbone_config() -> SpatioTemporalConfig {
    SpatioTemporalConfig {
        in_channels: 4,
        hidden_size: 16,
        num_layers: 1,
        num_heads: 2,
        cross_attention_dim: TEXT_DIM,
        ff_mult: 2,
    }
}

/// Frozen tiny backbone with deterministic weights
pub fn tiny_backbone(seed: u64) -> Result<SpatioTemporalTransformer> {
    let device = Device::Cpu;
    let config = tiny_backbone_config();
    let weights = SpatioTemporalTransformer::random_weights(&config, seed, &device)?;
    SpatioTemporalTransformer::from_weights(weights, &config, DType::F32, &device)
}

/// 2x average pooling; the 4th latent channel is the mean of the other three
pub struct PoolCodec;

impl LatentCodec for PoolCodec {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let pooled = pixels.avg_pool2d(2)?;
        let mean = pooled.mean_keepdim(1)?;
        Tensor::cat(&[pooled, mean], 1)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        latents.narrow(1, 0, 3)?.upsample_nearest2d(
            latents.dim(2)? * 2,
            latents.dim(3)? * 2,
        )
    }

    fn scaling_factor(&self) -> f64 {
        0.5
    }

    fn downsample_factor(&self) -> usize {
        2
    }
}

/// Deterministic pseudo-embedding seeded from the prompt text
pub struct HashTextEncoder;

impl TextEncoder for HashTextEncoder {
    fn encode(&self, prompt: &str) -> std::result::Result<Tensor, TextEncoderError> {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        let mut rng = Pcg32::new(hasher.finish(), 1);
        Ok(rng.randn((1, TEXT_LEN, TEXT_DIM), &Device::Cpu)?)
    }
}

/// One validation call as seen by the sampler
#[derive(Debug, Clone)]
pub struct SamplerCall {
    pub request: SampleRequest,
    pub gradient_checkpointing: bool,
}

/// Sampler returning a gray clip and recording its calls
pub struct RecordingSampler {
    pub calls: Rc<RefCell<Vec<SamplerCall>>>,
    pub fail: bool,
}

impl RecordingSampler {
    pub fn new() -> (Self, Rc<RefCell<Vec<SamplerCall>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
                fail: false,
            },
            calls,
        )
    }
}

impl VideoSampler for RecordingSampler {
    fn generate(&mut self, ctx: &SamplerContext<'_>, request: &SampleRequest) -> std::result::Result<Tensor, SamplerError> {
        self.calls.borrow_mut().push(SamplerCall {
            request: request.clone(),
            gradient_checkpointing: ctx.backbone.gradient_checkpointing(),
        });
        if self.fail {
            return Err(candle_core::Error::Msg("sampler unavailable".to_string()).into());
        }
        Ok(Tensor::full(
            0.5f32,
            (1, request.num_frames, 3, request.height, request.width),
            &Device::Cpu,
        )?)
    }
}

/// Small, fast run: rank 4, no validation or checkpoint unless overridden
pub fn tiny_config(max_train_steps: i64) -> TrainingConfig {
    let mut config = TrainingConfig {
        prompt: "A car is drifting on the road".to_string(),
        max_train_steps,
        max_train_epoch: UNSET,
        checkpointing_steps: 1000,
        lora_rank: 4,
        lora_dropout: 0.0,
        seed: 7,
        ..Default::default()
    };
    config.validation.steps = 1000;
    config.validation.extra_steps.clear();
    config.validation.num_inference_steps = 2;
    config
}

/// Reference clip [1, F, 3, H, W] in [-1, 1]
pub fn tiny_clip(frames: usize, height: usize, width: usize, seed: u64) -> Result<ClipSource> {
    let pixels = Pcg32::new(seed, 3)
        .randn((1, frames, 3, height, width), &Device::Cpu)?
        .clamp(-1f32, 1f32)?;
    Ok(ClipSource::Pixels(pixels))
}

pub fn components(sampler: Box<dyn VideoSampler>) -> Result<TrainerComponents> {
    Ok(TrainerComponents {
        backbone: Box::new(tiny_backbone(0)?),
        codec: Box::new(PoolCodec),
        text_encoder: Box::new(HashTextEncoder),
        sampler,
    })
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}
