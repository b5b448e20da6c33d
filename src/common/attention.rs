//! Scaled dot-product attention dispatch
//!
//! - Metal: fused SDPA kernel via `candle_nn::ops::sdpa` (inference only,
//!   the fused kernel has no backward pass)
//! - Everything else: explicit softmax(q kᵀ · scale) v, differentiable

use candle_core::{D, Device, Result, Tensor};

/// Attention over (batch, heads, seq, head_dim) tensors.
///
/// `accelerated` selects the fused kernel where one exists; training passes
/// must keep it off so gradients flow.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    accelerated: bool,
) -> Result<Tensor> {
    match q.device() {
        Device::Metal(_) if accelerated => candle_nn::ops::sdpa(q, k, v, None, false, scale as f32, 1.0),
        _ => attention_basic(q, k, v, scale),
    }
}

fn attention_basic(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    let weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let probs = candle_nn::ops::softmax(&weights, D::Minus1)?;
    probs.matmul(v)
}

/// (batch, seq, heads * head_dim) -> (batch, heads, seq, head_dim)
pub fn split_heads(x: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, s, d) = x.dims3()?;
    x.reshape((b, s, num_heads, d / num_heads))?.transpose(1, 2)?.contiguous()
}

/// (batch, heads, seq, head_dim) -> (batch, seq, heads * head_dim)
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, h, s, d) = x.dims4()?;
    x.transpose(1, 2)?.contiguous()?.reshape((b, s, h * d))
}
