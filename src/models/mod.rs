//! Bundled model implementations
//!
//! - `spatio_temporal`: trainable-by-adapter video denoising backbone
//! - `stable_diffusion`: frozen SD 1.5 VAE and CLIP text encoder

pub mod spatio_temporal;
pub mod stable_diffusion;

pub use spatio_temporal::{SPATIAL_BLOCK_TYPE, SpatioTemporalConfig, SpatioTemporalTransformer, TEMPORAL_BLOCK_TYPE};
pub use stable_diffusion::{ClipPromptEncoder, SdVaeCodec, SdWeightFiles, WeightError};
