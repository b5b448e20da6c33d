//! Stable Diffusion 1.5 collaborators
//!
//! - [`SdVaeCodec`]: `AutoEncoderKL` as a [`LatentCodec`]
//! - [`ClipPromptEncoder`]: CLIP tokenizer + text transformer as a [`TextEncoder`]
//! - [`SdWeightFiles`]: local or Hugging Face Hub resolution of the weights

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{clip, vae};
use hf_hub::{
    Repo, RepoType,
    api::sync::{Api, ApiError},
};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::info;

use crate::latent::{LatentCodec, SD_LATENT_SCALE};
use crate::text::{TextEncoder, TextEncoderError};

pub const SD15_REPO: &str = "runwayml/stable-diffusion-v1-5";
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// CLIP context length
const MAX_TOKENS: usize = 77;
/// `<|endoftext|>`, also used for padding
const PAD_TOKEN: u32 = 49407;

// =============================================================================
// Weight files
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WeightError {
    #[error("Hugging Face Hub unavailable: {0}")]
    Hub(#[source] ApiError),

    #[error("failed to fetch {file} from {repo}: {source}")]
    Fetch {
        repo: &'static str,
        file: &'static str,
        #[source]
        source: ApiError,
    },
}

/// Resolved weight files of the frozen collaborators
#[derive(Debug, Clone)]
pub struct SdWeightFiles {
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
    pub tokenizer: PathBuf,
}

impl SdWeightFiles {
    /// Diffusers layout under `root`
    pub fn local(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            vae: root.join("vae").join("diffusion_pytorch_model.safetensors"),
            text_encoder: root.join("text_encoder").join("model.safetensors"),
            tokenizer: root.join("tokenizer").join("tokenizer.json"),
        }
    }

    /// Download (or reuse the hub cache of) the SD 1.5 VAE and text encoder
    pub fn download() -> std::result::Result<Self, WeightError> {
        let api = Api::new().map_err(WeightError::Hub)?;
        let fetch = |repo: &'static str, file: &'static str| {
            api.repo(Repo::new(repo.to_string(), RepoType::Model))
                .get(file)
                .map_err(|source| WeightError::Fetch { repo, file, source })
        };
        Ok(Self {
            vae: fetch(SD15_REPO, "vae/diffusion_pytorch_model.safetensors")?,
            text_encoder: fetch(SD15_REPO, "text_encoder/model.safetensors")?,
            tokenizer: fetch(CLIP_TOKENIZER_REPO, "tokenizer.json")?,
        })
    }

    pub fn exists(&self) -> bool {
        self.vae.exists() && self.text_encoder.exists() && self.tokenizer.exists()
    }
}

fn mmap_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    // SAFETY: the weight file is not modified while mapped.
    unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
}

// =============================================================================
// VAE
// =============================================================================

/// SD 1.5 `AutoEncoderKL`
pub struct SdVaeCodec {
    vae: vae::AutoEncoderKL,
    dtype: DType,
}

impl SdVaeCodec {
    pub fn sd15_config() -> vae::AutoEncoderKLConfig {
        vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }

    pub fn load(path: impl AsRef<Path>, dtype: DType, device: &Device) -> Result<Self> {
        let vb = mmap_var_builder(path.as_ref(), dtype, device)?;
        let vae = vae::AutoEncoderKL::new(vb, 3, 3, Self::sd15_config())?;
        info!(path = %path.as_ref().display(), ?dtype, "Loaded VAE");
        Ok(Self { vae, dtype })
    }
}

impl LatentCodec for SdVaeCodec {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(&pixels.to_dtype(self.dtype)?)?;
        dist.sample()?.to_dtype(DType::F32)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        self.vae.decode(&latents.to_dtype(self.dtype)?)?.to_dtype(DType::F32)
    }

    fn scaling_factor(&self) -> f64 {
        SD_LATENT_SCALE
    }
}

// =============================================================================
// CLIP text encoder
// =============================================================================

/// SD 1.5 CLIP text transformer with its tokenizer
pub struct ClipPromptEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipPromptEncoder {
    pub fn load(
        weights: impl AsRef<Path>,
        tokenizer: impl AsRef<Path>,
        dtype: DType,
        device: &Device,
    ) -> std::result::Result<Self, TextEncoderError> {
        let tokenizer = Tokenizer::from_file(tokenizer.as_ref()).map_err(|e| TextEncoderError::Tokenizer(e.to_string()))?;
        let vb = mmap_var_builder(weights.as_ref(), dtype, device)?;
        let model = clip::ClipTextTransformer::new(vb, &clip::Config::v1_5())?;
        info!(path = %weights.as_ref().display(), "Loaded CLIP text encoder");
        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Token ids truncated and padded to the CLIP context length
    pub fn tokenize(&self, prompt: &str) -> std::result::Result<Vec<u32>, TextEncoderError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| TextEncoderError::Tokenizer(e.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(MAX_TOKENS);
        ids.resize(MAX_TOKENS, PAD_TOKEN);
        Ok(ids)
    }
}

impl TextEncoder for ClipPromptEncoder {
    fn encode(&self, prompt: &str) -> std::result::Result<Tensor, TextEncoderError> {
        let ids = self.tokenize(prompt)?;
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&input_ids)?.to_dtype(DType::F32)?)
    }
}
