//! Latent Encoder Bridge
//!
//! Pixel clips are [B, F, C, H, W] in [-1, 1]; latents are
//! [B, C, F, h, w] multiplied by the codec's scaling factor. Frames are
//! folded into the batch dimension for the per-image codec.

use candle_core::{D, Result, Tensor};

/// Stable Diffusion VAE latent scaling factor
pub const SD_LATENT_SCALE: f64 = 0.18215;

/// Per-image variational codec
pub trait LatentCodec {
    /// Sample latents for pixels [N, 3, H, W]; unscaled
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;

    /// Pixels [N, 3, H, W] in [-1, 1] for unscaled latents [N, C, h, w]
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    fn scaling_factor(&self) -> f64 {
        SD_LATENT_SCALE
    }

    /// Spatial downsampling between pixels and latents
    fn downsample_factor(&self) -> usize {
        8
    }
}

/// Training input: raw frames or pre-encoded latents
#[derive(Debug, Clone)]
pub enum ClipSource {
    /// [B, F, C, H, W] in [-1, 1]
    Pixels(Tensor),
    /// [B, C, F, h, w], already scaled
    Latents(Tensor),
}

impl ClipSource {
    pub fn batch_size(&self) -> Result<usize> {
        match self {
            ClipSource::Pixels(t) | ClipSource::Latents(t) => t.dim(0),
        }
    }

    pub fn num_frames(&self) -> Result<usize> {
        match self {
            ClipSource::Pixels(t) => t.dim(1),
            ClipSource::Latents(t) => t.dim(2),
        }
    }

    /// Pixel (height, width) of the clip
    pub fn resolution(&self, codec: &dyn LatentCodec) -> Result<(usize, usize)> {
        match self {
            ClipSource::Pixels(t) => {
                let (_, _, _, h, w) = t.dims5()?;
                Ok((h, w))
            }
            ClipSource::Latents(t) => {
                let (_, _, _, h, w) = t.dims5()?;
                let factor = codec.downsample_factor();
                Ok((h * factor, w * factor))
            }
        }
    }

    /// Scaled latents of the whole clip; pre-encoded input passes through
    pub fn latents(&self, codec: &dyn LatentCodec) -> Result<Tensor> {
        match self {
            ClipSource::Pixels(pixels) => encode_clip(codec, pixels),
            ClipSource::Latents(latents) => Ok(latents.clone()),
        }
    }

    /// Scaled latents [B, C, 1, h, w] of one horizontally flipped frame
    pub fn flipped_frame_latents(&self, codec: &dyn LatentCodec, frame: usize) -> Result<Tensor> {
        match self {
            ClipSource::Pixels(pixels) => {
                let frame = hflip(&pixels.narrow(1, frame, 1)?)?;
                encode_clip(codec, &frame)
            }
            ClipSource::Latents(latents) => hflip(&latents.narrow(2, frame, 1)?),
        }
    }
}

/// Encode [B, F, C, H, W] pixels to scaled [B, C, F, h, w] latents
pub fn encode_clip(codec: &dyn LatentCodec, pixels: &Tensor) -> Result<Tensor> {
    let (b, f, c, h, w) = pixels.dims5()?;
    let latents = codec.encode(&pixels.reshape((b * f, c, h, w))?)?.detach();
    let (_, lc, lh, lw) = latents.dims4()?;
    let latents = latents.reshape((b, f, lc, lh, lw))?.permute((0, 2, 1, 3, 4))?.contiguous()?;
    latents * codec.scaling_factor()
}

/// Decode scaled [B, C, F, h, w] latents to [B, F, 3, H, W] pixels
pub fn decode_latents(codec: &dyn LatentCodec, latents: &Tensor) -> Result<Tensor> {
    let (b, c, f, h, w) = latents.dims5()?;
    let latents = (latents / codec.scaling_factor())?
        .permute((0, 2, 1, 3, 4))?
        .reshape((b * f, c, h, w))?;
    let pixels = codec.decode(&latents)?;
    let (_, pc, ph, pw) = pixels.dims4()?;
    pixels.reshape((b, f, pc, ph, pw))
}

/// Reverse the last (width) dimension
pub fn hflip(x: &Tensor) -> Result<Tensor> {
    let w = x.dim(D::Minus1)?;
    let indices: Vec<u32> = (0..w as u32).rev().collect();
    let indices = Tensor::from_vec(indices, w, x.device())?;
    x.index_select(&indices, x.rank() - 1)
}
