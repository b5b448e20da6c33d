//! Compact spatio-temporal transformer backbone
//!
//! Latent video [B, C, F, H, W] is flattened to tokens and processed by
//! alternating blocks:
//! - spatial (`Transformer3DModel`): self-attention over the H·W tokens of
//!   each frame, cross-attention to the text embedding, feed-forward
//! - temporal (`TemporalTransformerBlock`): self-attention over the F frames
//!   at each spatial position, with sinusoidal frame positions
//!
//! Every attention/feed-forward projection is an [`AdaptableLinear`], so
//! adapters can be injected by block type. Base weights are loaded frozen.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backbone::{Backbone, SublayerInfo, SublayerVisitor};
use crate::common::attention::{merge_heads, scaled_dot_product_attention, split_heads};
use crate::lora::AdaptableLinear;
use crate::utils::deterministic_rng::Pcg32;

pub const SPATIAL_BLOCK_TYPE: &str = "Transformer3DModel";
pub const TEMPORAL_BLOCK_TYPE: &str = "TemporalTransformerBlock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatioTemporalConfig {
    /// Latent channels
    pub in_channels: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Text embedding width
    pub cross_attention_dim: usize,
    pub ff_mult: usize,
}

impl Default for SpatioTemporalConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            hidden_size: 128,
            num_layers: 2,
            num_heads: 4,
            cross_attention_dim: 768,
            ff_mult: 4,
        }
    }
}

// ===========================================================================
// Layers
// ===========================================================================

fn sinusoidal_embedding(positions: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let device = positions.device();
    let exponent = Tensor::arange(0u32, half as u32, device)?
        .to_dtype(DType::F32)?
        .affine(-(10000f64.ln()) / half as f64, 0.0)?
        .exp()?;
    let args = positions
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&exponent.unsqueeze(0)?)?;
    // cos first (flip_sin_to_cos)
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)
}

struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
    dim: usize,
}

impl TimestepEmbedding {
    fn new(vb: VarBuilder, dim: usize) -> Result<Self> {
        Ok(Self {
            linear_1: candle_nn::linear(dim, dim, vb.pp("linear_1"))?,
            linear_2: candle_nn::linear(dim, dim, vb.pp("linear_2"))?,
            dim,
        })
    }

    fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let emb = sinusoidal_embedding(timesteps, self.dim)?.to_dtype(self.linear_1.weight().dtype())?;
        let emb = self.linear_1.forward(&emb)?.silu()?;
        self.linear_2.forward(&emb)
    }
}

struct Attention {
    to_q: AdaptableLinear,
    to_k: AdaptableLinear,
    to_v: AdaptableLinear,
    to_out: AdaptableLinear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(vb: VarBuilder, query_dim: usize, context_dim: usize, num_heads: usize) -> Result<Self> {
        Ok(Self {
            to_q: AdaptableLinear::load(vb.pp("to_q"), query_dim, query_dim, false)?,
            to_k: AdaptableLinear::load(vb.pp("to_k"), context_dim, query_dim, false)?,
            to_v: AdaptableLinear::load(vb.pp("to_v"), context_dim, query_dim, false)?,
            to_out: AdaptableLinear::load(vb.pp("to_out.0"), query_dim, query_dim, true)?,
            num_heads,
            scale: 1.0 / ((query_dim / num_heads) as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor, context: Option<&Tensor>, accelerated: bool) -> Result<Tensor> {
        let context = context.unwrap_or(x);
        let q = split_heads(&self.to_q.forward(x)?, self.num_heads)?;
        let k = split_heads(&self.to_k.forward(context)?, self.num_heads)?;
        let v = split_heads(&self.to_v.forward(context)?, self.num_heads)?;
        let out = scaled_dot_product_attention(&q, &k, &v, self.scale, accelerated)?;
        self.to_out.forward(&merge_heads(&out)?)
    }

    fn visit(&mut self, prefix: &str, block_type: &'static str, visitor: &mut SublayerVisitor<'_>) -> Result<()> {
        for (name, layer) in [
            ("to_q", &mut self.to_q),
            ("to_k", &mut self.to_k),
            ("to_v", &mut self.to_v),
            ("to_out.0", &mut self.to_out),
        ] {
            visitor(&SublayerInfo::new(format!("{prefix}.{name}"), block_type), layer)?;
        }
        Ok(())
    }
}

struct FeedForward {
    proj_in: AdaptableLinear,
    proj_out: AdaptableLinear,
}

impl FeedForward {
    fn new(vb: VarBuilder, dim: usize, mult: usize) -> Result<Self> {
        Ok(Self {
            proj_in: AdaptableLinear::load(vb.pp("net.0.proj"), dim, dim * mult, true)?,
            proj_out: AdaptableLinear::load(vb.pp("net.2"), dim * mult, dim, true)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.proj_out.forward(&self.proj_in.forward(x)?.gelu()?)
    }

    fn visit(&mut self, prefix: &str, block_type: &'static str, visitor: &mut SublayerVisitor<'_>) -> Result<()> {
        visitor(&SublayerInfo::new(format!("{prefix}.net.0.proj"), block_type), &mut self.proj_in)?;
        visitor(&SublayerInfo::new(format!("{prefix}.net.2"), block_type), &mut self.proj_out)
    }
}

/// Layer norm composed from primitive ops so gradients flow to the
/// adapters upstream of it (the fused kernel has no backward pass)
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f32,
}

impl LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::layer_norm_slow(x, &self.weight, &self.bias, self.eps)
    }
}

fn layer_norm(vb: VarBuilder, dim: usize) -> Result<LayerNorm> {
    Ok(LayerNorm {
        weight: vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.))?,
        bias: vb.get_with_hints(dim, "bias", candle_nn::Init::Const(0.))?,
        eps: 1e-5,
    })
}

/// Per-frame appearance block
struct SpatialBlock {
    norm1: LayerNorm,
    attn1: Attention,
    norm2: LayerNorm,
    attn2: Attention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl SpatialBlock {
    fn new(vb: VarBuilder, config: &SpatioTemporalConfig) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            norm1: layer_norm(vb.pp("norm1"), dim)?,
            attn1: Attention::new(vb.pp("attn1"), dim, dim, config.num_heads)?,
            norm2: layer_norm(vb.pp("norm2"), dim)?,
            attn2: Attention::new(vb.pp("attn2"), dim, config.cross_attention_dim, config.num_heads)?,
            norm3: layer_norm(vb.pp("norm3"), dim)?,
            ff: FeedForward::new(vb.pp("ff"), dim, config.ff_mult)?,
        })
    }

    /// `x`: [B*F, H*W, D], `context`: [B*F, L, Dc]
    fn forward(&self, x: &Tensor, context: &Tensor, accelerated: bool) -> Result<Tensor> {
        let x = (x + self.attn1.forward(&self.norm1.forward(x)?, None, accelerated)?)?;
        let x = (&x + self.attn2.forward(&self.norm2.forward(&x)?, Some(context), accelerated)?)?;
        &x + self.ff.forward(&self.norm3.forward(&x)?)?
    }

    fn visit(&mut self, prefix: &str, visitor: &mut SublayerVisitor<'_>) -> Result<()> {
        self.attn1.visit(&format!("{prefix}.attn1"), SPATIAL_BLOCK_TYPE, visitor)?;
        self.attn2.visit(&format!("{prefix}.attn2"), SPATIAL_BLOCK_TYPE, visitor)?;
        self.ff.visit(&format!("{prefix}.ff"), SPATIAL_BLOCK_TYPE, visitor)
    }
}

/// Cross-frame motion block
struct TemporalBlock {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    ff: FeedForward,
    dim: usize,
}

impl TemporalBlock {
    fn new(vb: VarBuilder, config: &SpatioTemporalConfig) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            norm1: layer_norm(vb.pp("norm1"), dim)?,
            attn: Attention::new(vb.pp("attn1"), dim, dim, config.num_heads)?,
            norm2: layer_norm(vb.pp("norm2"), dim)?,
            ff: FeedForward::new(vb.pp("ff"), dim, config.ff_mult)?,
            dim,
        })
    }

    /// `x`: [B*H*W, F, D]
    fn forward(&self, x: &Tensor, accelerated: bool) -> Result<Tensor> {
        let frames = x.dim(1)?;
        let positions = Tensor::arange(0u32, frames as u32, x.device())?;
        let pos = sinusoidal_embedding(&positions, self.dim)?.to_dtype(x.dtype())?;
        let h = self.norm1.forward(x)?.broadcast_add(&pos.unsqueeze(0)?)?;
        let x = (x + self.attn.forward(&h, None, accelerated)?)?;
        &x + self.ff.forward(&self.norm2.forward(&x)?)?
    }

    fn visit(&mut self, prefix: &str, visitor: &mut SublayerVisitor<'_>) -> Result<()> {
        self.attn.visit(&format!("{prefix}.attn1"), TEMPORAL_BLOCK_TYPE, visitor)?;
        self.ff.visit(&format!("{prefix}.ff"), TEMPORAL_BLOCK_TYPE, visitor)
    }
}

// ===========================================================================
// Model
// ===========================================================================

pub struct SpatioTemporalTransformer {
    proj_in: Linear,
    time_embedding: TimestepEmbedding,
    spatial: Vec<SpatialBlock>,
    temporal: Vec<TemporalBlock>,
    norm_out: LayerNorm,
    proj_out: Linear,
    train: bool,
    gradient_checkpointing: bool,
}

impl SpatioTemporalTransformer {
    pub fn new(vb: VarBuilder, config: &SpatioTemporalConfig) -> Result<Self> {
        if config.hidden_size % config.num_heads != 0 || config.hidden_size % 2 != 0 {
            candle_core::bail!(
                "hidden_size {} must be even and divisible by num_heads {}",
                config.hidden_size,
                config.num_heads
            );
        }
        let dim = config.hidden_size;
        let mut spatial = Vec::with_capacity(config.num_layers);
        let mut temporal = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            spatial.push(SpatialBlock::new(vb.pp(format!("blocks.{i}.spatial")), config)?);
            temporal.push(TemporalBlock::new(vb.pp(format!("blocks.{i}.temporal")), config)?);
        }
        Ok(Self {
            proj_in: candle_nn::linear(config.in_channels, dim, vb.pp("proj_in"))?,
            time_embedding: TimestepEmbedding::new(vb.pp("time_embedding"), dim)?,
            spatial,
            temporal,
            norm_out: layer_norm(vb.pp("norm_out"), dim)?,
            proj_out: candle_nn::linear(dim, config.in_channels, vb.pp("proj_out"))?,
            train: false,
            gradient_checkpointing: false,
        })
    }

    /// Deterministic frozen weights for a freshly initialized model.
    ///
    /// Matrices ~ N(0, 1/fan_in), norm weights 1, biases 0.
    pub fn random_weights(config: &SpatioTemporalConfig, seed: u64, device: &Device) -> Result<HashMap<String, Tensor>> {
        let varmap = VarMap::new();
        Self::new(VarBuilder::from_varmap(&varmap, DType::F32, device), config)?;
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
        let mut names: Vec<_> = data.iter().map(|(name, var)| (name.clone(), var.dims().to_vec())).collect();
        names.sort();

        let mut rng = Pcg32::new(seed, 54);
        let mut weights = HashMap::with_capacity(names.len());
        for (name, dims) in names {
            let tensor = match dims.as_slice() {
                [_, fan_in] => (rng.randn(dims.as_slice(), device)? / (*fan_in as f64).sqrt())?,
                _ if name.ends_with(".weight") => Tensor::ones(dims.as_slice(), DType::F32, device)?,
                _ => Tensor::zeros(dims.as_slice(), DType::F32, device)?,
            };
            weights.insert(name, tensor);
        }
        Ok(weights)
    }

    /// Build from plain (non-`Var`) tensors so base weights stay frozen
    pub fn from_weights(
        weights: HashMap<String, Tensor>,
        config: &SpatioTemporalConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::new(VarBuilder::from_tensors(weights, dtype, device), config)
    }
}

impl Backbone for SpatioTemporalTransformer {
    fn forward(&self, sample: &Tensor, timesteps: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor> {
        let (b, c, f, h, w) = sample.dims5()?;
        let dtype = self.proj_in.weight().dtype();
        let accelerated = !self.train;

        // [B, C, F, H, W] -> [B*F, H*W, C]
        let x = sample
            .to_dtype(dtype)?
            .permute((0, 2, 3, 4, 1))?
            .reshape((b * f, h * w, c))?;
        let mut x = self.proj_in.forward(&x)?;
        let dim = x.dim(D::Minus1)?;

        let temb = self.time_embedding.forward(timesteps)?.to_dtype(dtype)?;
        let temb = temb
            .unsqueeze(1)?
            .broadcast_as((b, f, dim))?
            .reshape((b * f, 1, dim))?;
        x = x.broadcast_add(&temb)?;

        let (_, l, dc) = encoder_hidden_states.dims3()?;
        let context = encoder_hidden_states
            .to_dtype(dtype)?
            .unsqueeze(1)?
            .broadcast_as((b, f, l, dc))?
            .reshape((b * f, l, dc))?;

        for (spatial, temporal) in self.spatial.iter().zip(self.temporal.iter()) {
            x = spatial.forward(&x, &context, accelerated)?;
            // [B*F, HW, D] -> [B*HW, F, D]
            let t = x
                .reshape((b, f, h * w, dim))?
                .transpose(1, 2)?
                .reshape((b * h * w, f, dim))?;
            let t = temporal.forward(&t, accelerated)?;
            x = t.reshape((b, h * w, f, dim))?.transpose(1, 2)?.reshape((b * f, h * w, dim))?;
        }

        let x = self.proj_out.forward(&self.norm_out.forward(&x)?)?;
        x.reshape((b, f, h, w, c))?.permute((0, 4, 1, 2, 3))?.contiguous()
    }

    fn visit_sublayers(&mut self, visitor: &mut SublayerVisitor<'_>) -> Result<()> {
        for (i, (spatial, temporal)) in self.spatial.iter_mut().zip(self.temporal.iter_mut()).enumerate() {
            spatial.visit(&format!("blocks.{i}.spatial"), visitor)?;
            temporal.visit(&format!("blocks.{i}.temporal"), visitor)?;
        }
        Ok(())
    }

    fn set_train(&mut self, train: bool) -> Result<()> {
        self.train = train;
        self.visit_sublayers(&mut |_, layer| {
            layer.set_train(train);
            Ok(())
        })
    }

    fn set_gradient_checkpointing(&mut self, enabled: bool) {
        self.gradient_checkpointing = enabled;
    }

    fn gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> SpatioTemporalConfig {
        SpatioTemporalConfig {
            in_channels: 4,
            hidden_size: 16,
            num_layers: 1,
            num_heads: 2,
            cross_attention_dim: 8,
            ff_mult: 2,
        }
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let weights = SpatioTemporalTransformer::random_weights(&config, 0, &device)?;
        let model = SpatioTemporalTransformer::from_weights(weights, &config, DType::F32, &device)?;

        let sample = Tensor::randn(0f32, 1., (2, 4, 3, 4, 4), &device)?;
        let timesteps = Tensor::new(&[10u32, 500], &device)?;
        let text = Tensor::randn(0f32, 1., (2, 5, 8), &device)?;
        let out = model.forward(&sample, &timesteps, &text)?;
        assert_eq!(out.dims(), &[2, 4, 3, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_sublayer_block_types() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let weights = SpatioTemporalTransformer::random_weights(&config, 0, &device)?;
        let mut model = SpatioTemporalTransformer::from_weights(weights, &config, DType::F32, &device)?;

        let mut seen = Vec::new();
        model.visit_sublayers(&mut |info, _| {
            seen.push(info.clone());
            Ok(())
        })?;
        let spatial = seen.iter().filter(|s| s.block_type == SPATIAL_BLOCK_TYPE).count();
        let temporal = seen.iter().filter(|s| s.block_type == TEMPORAL_BLOCK_TYPE).count();
        assert_eq!(spatial, 10);
        assert_eq!(temporal, 6);
        assert_eq!(seen[0].name, "blocks.0.spatial.attn1.to_q");
        Ok(())
    }

    #[test]
    fn test_random_weights_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let a = SpatioTemporalTransformer::random_weights(&config, 3, &device)?;
        let b = SpatioTemporalTransformer::random_weights(&config, 3, &device)?;
        let key = "blocks.0.temporal.attn1.to_q.weight";
        let diff = (&a[key] - &b[key])?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
