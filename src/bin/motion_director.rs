//! Motion Director LoRA training
//!
//! Learns a motion (temporal LoRA) and appearance (spatial LoRA) pair from a
//! single reference clip given as a directory of frames.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin motion-director -- \
//!     --config configs/car_drifting.json \
//!     --frames ./clips/car_drifting \
//!     --prompt "A car is drifting on the road" \
//!     --output outputs/car_drifting
//! ```

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use candle_motion_director::{
    ClipSource, DdimVideoSampler, MotionDirectorTrainer, TrainerComponents, TrainingConfig,
    sampler::save_video_frames,
    models::{ClipPromptEncoder, SdVaeCodec, SdWeightFiles, SpatioTemporalConfig, SpatioTemporalTransformer},
};

/// Command line arguments for motion LoRA training
#[derive(Parser, Debug)]
#[command(author, version, about = "Train spatial/temporal motion LoRAs from one reference clip")]
struct Args {
    /// Training configuration (JSON); missing fields use defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory with the reference frames (png/jpg, sorted by name)
    #[arg(short, long)]
    frames: PathBuf,

    /// Training caption; overrides the config prompt
    #[arg(short, long)]
    prompt: Option<String>,

    /// Number of frames sampled evenly from the directory
    #[arg(long, default_value = "16")]
    num_frames: usize,

    /// Frame height (multiple of 8)
    #[arg(long, default_value = "384")]
    height: usize,

    /// Frame width (multiple of 8)
    #[arg(long, default_value = "384")]
    width: usize,

    /// Stable Diffusion 1.5 directory (diffusers layout); downloaded when absent
    #[arg(long)]
    sd_weights: Option<PathBuf>,

    /// Spatio-temporal backbone weights (safetensors)
    #[arg(long)]
    backbone_weights: Option<PathBuf>,

    /// Backbone architecture (JSON)
    #[arg(long)]
    backbone_config: Option<PathBuf>,

    /// Seed of the generated backbone weights when none are given
    #[arg(long, default_value = "0")]
    backbone_seed: u64,

    /// Output directory (config, samples, LoRA checkpoints)
    #[arg(short, long, default_value = "outputs/motion_director")]
    output: PathBuf,

    /// Overrides max_train_steps (and clears max_train_epoch)
    #[arg(long)]
    max_train_steps: Option<i64>,

    /// Also write the last validation sample as numbered PNG frames
    #[arg(long)]
    save_frames: bool,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_motion_director=info".parse()?)
                .add_directive("motion_director=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_json(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(prompt) = &args.prompt {
        config.prompt = prompt.clone();
    }
    if let Some(steps) = args.max_train_steps {
        config.max_train_steps = steps;
        config.max_train_epoch = candle_motion_director::config::UNSET;
    }
    info!("Prompt: {}", config.prompt);

    let device = if args.cpu {
        info!("Using CPU");
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                info!("Using CUDA device 0");
                device
            }
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };
    let dtype = DType::F32;

    let sd = match &args.sd_weights {
        Some(root) => {
            let files = SdWeightFiles::local(root);
            if !files.exists() {
                anyhow::bail!("Missing VAE, text encoder or tokenizer under {}", root.display());
            }
            files
        }
        None => SdWeightFiles::download().context("Failed to fetch Stable Diffusion 1.5 weights")?,
    };
    let codec = SdVaeCodec::load(&sd.vae, dtype, &device)?;
    let text_encoder = ClipPromptEncoder::load(&sd.text_encoder, &sd.tokenizer, dtype, &device)?;

    let backbone_config: SpatioTemporalConfig = match &args.backbone_config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => SpatioTemporalConfig::default(),
    };
    let weights = match &args.backbone_weights {
        Some(path) => {
            info!("Loading backbone weights from {}", path.display());
            candle_core::safetensors::load(path, &device)?
        }
        None => {
            warn!("No backbone weights given, generating seed {}", args.backbone_seed);
            SpatioTemporalTransformer::random_weights(&backbone_config, args.backbone_seed, &device)?
        }
    };
    let backbone = SpatioTemporalTransformer::from_weights(weights, &backbone_config, dtype, &device)?;

    let pixels = load_frames(&args.frames, args.num_frames, args.height, args.width, &device)?;
    let clip = ClipSource::Pixels(pixels);

    let components = TrainerComponents {
        backbone: Box::new(backbone),
        codec: Box::new(codec),
        text_encoder: Box::new(text_encoder),
        sampler: Box::new(DdimVideoSampler::new(&config.noise_scheduler, backbone_config.in_channels)),
    };
    let mut trainer = MotionDirectorTrainer::new(config, components, &args.output)?;
    let summary = trainer.run(&clip)?;

    if args.save_frames {
        match &summary.last_sample {
            Some(sample) => {
                let dir = args.output.join("samples").join("frames");
                save_video_frames(sample, &dir)?;
                info!("Saved sample frames to {}", dir.display());
            }
            None => warn!("No validation sample to save"),
        }
    }

    info!(
        "Finished {} steps, {} checkpoints written to {}",
        summary.global_steps,
        summary.checkpoints.len(),
        args.output.display()
    );
    Ok(())
}

/// Frames [1, F, 3, H, W] in [-1, 1], sampled evenly from `dir`
fn load_frames(dir: &Path, num_frames: usize, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        })
        .collect();
    paths.sort();
    if paths.len() < num_frames || num_frames == 0 {
        anyhow::bail!("Need {} frames, found {} in {}", num_frames, paths.len(), dir.display());
    }

    let stride = paths.len() / num_frames;
    let mut data = Vec::with_capacity(num_frames * 3 * height * width);
    for path in paths.iter().step_by(stride).take(num_frames) {
        let img = image::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .resize_exact(width as u32, height as u32, FilterType::Triangle)
            .to_rgb8();
        data.extend_from_slice(img.as_raw());
    }
    info!("Loaded {} frames at {}x{}", num_frames, width, height);

    // [F, H, W, 3] u8 -> [1, F, 3, H, W] in [-1, 1]
    let frames = Tensor::from_vec(data, (num_frames, height, width, 3), device)?
        .permute((0, 3, 1, 2))?
        .to_dtype(DType::F32)?
        .affine(2.0 / 255.0, -1.0)?
        .unsqueeze(0)?
        .contiguous()?;
    Ok(frames)
}
