//! Prompt conditioning
//!
//! - [`TextEncoder`]: frozen tokenizer + encoder contract
//! - [`PromptEncoder`]: embedding cache in front of an encoder
//! - [`PromptPolicy`]: per-step null-text substitution and caption augmentation

use candle_core::Tensor;
use std::collections::HashMap;
use tracing::debug;

use crate::utils::deterministic_rng::TrainingRng;

/// Caption prefixes drawn uniformly when augmentation is enabled
pub const CAPTION_AUGMENTATIONS: [&str; 25] = [
    "a video of",
    "a high quality video of",
    "a good video of",
    "a nice video of",
    "a great video of",
    "a video showing",
    "video of",
    "video clip of",
    "great video of",
    "cool video of",
    "best video of",
    "streamed video of",
    "excellent video of",
    "new video of",
    "new video clip of",
    "high quality video of",
    "a video showing of",
    "a clear video showing",
    "video clip showing",
    "a nice video showing",
    "a good video showing",
    "video, high quality,",
    "high quality, video, video clip,",
    "nice video, clear quality,",
    "clear quality video of",
];

#[derive(Debug, thiserror::Error)]
pub enum TextEncoderError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Frozen text encoder
pub trait TextEncoder {
    /// Embedding [1, L, D] of one prompt
    fn encode(&self, prompt: &str) -> Result<Tensor, TextEncoderError>;
}

/// Caching front of a [`TextEncoder`]
pub struct PromptEncoder {
    encoder: Box<dyn TextEncoder>,
    cache: HashMap<String, Tensor>,
    hits: usize,
}

impl PromptEncoder {
    pub fn new(encoder: Box<dyn TextEncoder>) -> Self {
        Self {
            encoder,
            cache: HashMap::new(),
            hits: 0,
        }
    }

    pub fn encoder(&self) -> &dyn TextEncoder {
        self.encoder.as_ref()
    }

    /// Embedding of `prompt` repeated over `batch`: [batch, L, D]
    pub fn encode(&mut self, prompt: &str, batch: usize) -> Result<Tensor, TextEncoderError> {
        let embedding = match self.cache.get(prompt) {
            Some(cached) => {
                self.hits += 1;
                cached.clone()
            }
            None => {
                let embedding = self.encoder.encode(prompt)?.detach();
                debug!(prompt, "Encoded prompt");
                self.cache.insert(prompt.to_string(), embedding.clone());
                embedding
            }
        };
        if batch == 1 {
            return Ok(embedding);
        }
        let (_, l, d) = embedding.dims3()?;
        Ok(embedding.broadcast_as((batch, l, d))?.contiguous()?)
    }

    pub fn cache_hits(&self) -> usize {
        self.hits
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }
}

/// Per-step prompt selection
#[derive(Debug, Clone)]
pub struct PromptPolicy {
    pub prompt: String,
    /// Probability of training on the empty prompt
    pub null_text_ratio: f64,
    pub augment: bool,
}

impl PromptPolicy {
    /// Draw this step's prompt. Always starts from the base prompt, so a
    /// null-text draw never carries into the next step.
    pub fn draw(&self, rng: &mut TrainingRng) -> String {
        let prompt = if rng.chance(self.null_text_ratio) {
            ""
        } else {
            self.prompt.as_str()
        };
        if self.augment {
            let prefix = CAPTION_AUGMENTATIONS[rng.index(CAPTION_AUGMENTATIONS.len())];
            format!("{prefix} {prompt}")
        } else {
            prompt.to_string()
        }
    }
}
