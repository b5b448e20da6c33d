//! Validation sampling
//!
//! The trainer only depends on [`VideoSampler::generate`]. The bundled
//! [`DdimVideoSampler`] runs DDIM with classifier-free guidance against the
//! backbone currently being trained, then decodes through the latent codec.

use candle_core::{DType, IndexOp, Result, Tensor};
use image::{Delay, Frame, RgbImage, RgbaImage};
use std::path::Path;
use tracing::debug;

use crate::backbone::Backbone;
use crate::config::NoiseSchedulerConfig;
use crate::latent::{LatentCodec, decode_latents};
use crate::scheduler::{BetaSchedule, DdimScheduler};
use crate::text::{TextEncoder, TextEncoderError};
use crate::utils::deterministic_rng::Pcg32;

#[derive(Debug, Clone)]
pub struct SampleRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub num_frames: usize,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

/// Collaborators borrowed for one generation
pub struct SamplerContext<'a> {
    pub backbone: &'a dyn Backbone,
    pub text_encoder: &'a dyn TextEncoder,
    pub codec: &'a dyn LatentCodec,
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error(transparent)]
    Text(#[from] TextEncoderError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Failed to write sample {path}: {message}")]
    Save { path: String, message: String },
}

/// Full generative sampler
pub trait VideoSampler {
    /// Clip [1, F, 3, H, W] with values in [0, 1]
    fn generate(&mut self, ctx: &SamplerContext<'_>, request: &SampleRequest) -> std::result::Result<Tensor, SamplerError>;
}

/// DDIM (eta = 0) sampler with classifier-free guidance
#[derive(Debug, Clone)]
pub struct DdimVideoSampler {
    scheduler: DdimScheduler,
    latent_channels: usize,
}

impl DdimVideoSampler {
    /// Inference schedule uses the scaled-linear betas of the base model
    pub fn new(config: &NoiseSchedulerConfig, latent_channels: usize) -> Self {
        Self {
            scheduler: DdimScheduler::new(config, BetaSchedule::ScaledLinear),
            latent_channels,
        }
    }
}

impl VideoSampler for DdimVideoSampler {
    fn generate(&mut self, ctx: &SamplerContext<'_>, request: &SampleRequest) -> std::result::Result<Tensor, SamplerError> {
        let cond = ctx.text_encoder.encode(&request.prompt)?;
        let device = cond.device().clone();
        let guided = request.guidance_scale > 1.0;
        let context = if guided {
            let uncond = ctx.text_encoder.encode(&request.negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };

        let factor = ctx.codec.downsample_factor();
        let shape = (
            1,
            self.latent_channels,
            request.num_frames,
            request.height / factor,
            request.width / factor,
        );
        let mut latents = (Pcg32::new(request.seed, 54).randn(shape, &device)? * self.scheduler.init_noise_sigma())?;

        self.scheduler.set_timesteps(request.num_inference_steps)?;
        let timesteps = self.scheduler.timesteps().to_vec();
        for (i, &t) in timesteps.iter().enumerate() {
            let (input, batch) = if guided {
                (Tensor::cat(&[&latents, &latents], 0)?, 2)
            } else {
                (latents.clone(), 1)
            };
            let ts = Tensor::new(vec![t as u32; batch], &device)?;
            let eps = ctx.backbone.forward(&input, &ts, &context)?.detach();
            let eps = if guided {
                let uncond = eps.i(0..1)?;
                let cond = eps.i(1..2)?;
                (&uncond + ((cond - &uncond)? * request.guidance_scale)?)?
            } else {
                eps
            };
            latents = self.scheduler.step(&eps, t, &latents)?.detach();
            debug!(step = i, timestep = t, "Sampling");
        }

        let pixels = decode_latents(ctx.codec, &latents.to_dtype(DType::F32)?)?;
        Ok(((pixels / 2.0)? + 0.5)?.clamp(0f32, 1f32)?.detach())
    }
}

fn frame_image(frames: &Tensor, b: usize, f: usize) -> Result<RgbImage> {
    let (_, _, _, height, width) = frames.dims5()?;
    let frame = (frames.i((b, f))?.to_dtype(DType::F32)? * 255.0)?.to_dtype(DType::U8)?;
    let data: Vec<u8> = frame.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| candle_core::Error::Msg("Failed to create image".to_string()))
}

/// Save frames [B, F, 3, H, W] in [0, 1] as `frame_XXXX.png` (batch 0)
pub fn save_video_frames(frames: &Tensor, output_dir: impl AsRef<Path>) -> std::result::Result<(), SamplerError> {
    let dir = output_dir.as_ref();
    let save_error = |message: String| SamplerError::Save {
        path: dir.display().to_string(),
        message,
    };
    std::fs::create_dir_all(dir).map_err(|e| save_error(e.to_string()))?;
    for f in 0..frames.dim(1)? {
        frame_image(frames, 0, f)?
            .save(dir.join(format!("frame_{f:04}.png")))
            .map_err(|e| save_error(e.to_string()))?;
    }
    Ok(())
}

/// Save frames [B, F, 3, H, W] in [0, 1] as an animated GIF (batch 0)
pub fn save_video_gif(frames: &Tensor, path: impl AsRef<Path>, fps: u32) -> std::result::Result<(), SamplerError> {
    let path = path.as_ref();
    let save_error = |message: String| SamplerError::Save {
        path: path.display().to_string(),
        message,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| save_error(e.to_string()))?;
    }
    let file = std::fs::File::create(path).map_err(|e| save_error(e.to_string()))?;
    let mut encoder = image::codecs::gif::GifEncoder::new(file);
    encoder
        .set_repeat(image::codecs::gif::Repeat::Infinite)
        .map_err(|e| save_error(e.to_string()))?;
    let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
    for f in 0..frames.dim(1)? {
        let rgba: RgbaImage = image::DynamicImage::ImageRgb8(frame_image(frames, 0, f)?).to_rgba8();
        encoder
            .encode_frame(Frame::from_parts(rgba, 0, 0, delay))
            .map_err(|e| save_error(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_save_gif_and_frames() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let frames = Tensor::rand(0f32, 1., (1, 3, 3, 8, 8), &Device::Cpu)?;
        let gif = dir.path().join("samples").join("sample-2.gif");
        save_video_gif(&frames, &gif, 8)?;
        assert!(gif.is_file());

        save_video_frames(&frames, dir.path().join("frames"))?;
        assert!(dir.path().join("frames").join("frame_0002.png").is_file());
        Ok(())
    }
}
