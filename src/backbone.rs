//! Call contract of the denoising backbone
//!
//! The trainer never looks inside the network. It needs a forward pass, a
//! way to reach the adaptable linear sublayers (for injection, gating and
//! snapshots) and the train/eval and gradient checkpointing switches.

use candle_core::{Result, Tensor};

use crate::lora::AdaptableLinear;

/// Identity of one adaptable linear sublayer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SublayerInfo {
    /// Dotted parameter path, e.g. `blocks.0.spatial.attn1.to_q`
    pub name: String,
    /// Type name of the enclosing block, matched against adapter targets
    pub block_type: &'static str,
}

impl SublayerInfo {
    pub fn new(name: impl Into<String>, block_type: &'static str) -> Self {
        Self {
            name: name.into(),
            block_type,
        }
    }
}

/// Visitor over adaptable sublayers
pub type SublayerVisitor<'a> = dyn FnMut(&SublayerInfo, &mut AdaptableLinear) -> Result<()> + 'a;

/// Denoising network with adaptable sublayers
pub trait Backbone {
    /// Predict noise for `sample` [B, C, F, H, W] at `timesteps` [B] given
    /// text conditioning [B, L, D]
    fn forward(&self, sample: &Tensor, timesteps: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor>;

    /// Visit every adaptable sublayer in a fixed, layer-major order
    fn visit_sublayers(&mut self, visitor: &mut SublayerVisitor<'_>) -> Result<()>;

    /// Train mode enables adapter dropout
    fn set_train(&mut self, train: bool) -> Result<()>;

    fn set_gradient_checkpointing(&mut self, enabled: bool);

    fn gradient_checkpointing(&self) -> bool;
}
